//! First-start seeding of the directory tree.

use anyhow::{Context, Result};
use tracing::info;

use crate::config::{AdminEntry, InitConfig};
use crate::entry::{Attributes, DirectoryEntry, ATTR_OBJECT_CLASS, ATTR_USER_PASSWORD};
use crate::id::IdGenerator;
use crate::store::{save_new_entry, EntryStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// A root already existed; nothing was written.
    Skipped,
    Seeded { created: usize },
}

fn admin_entry(admin: &AdminEntry) -> DirectoryEntry {
    let attributes = Attributes::from_pairs([
        (ATTR_OBJECT_CLASS, admin.object_classes.clone()),
        (ATTR_USER_PASSWORD, vec![admin.user_password.clone()]),
    ]);
    DirectoryEntry::new(admin.dn.clone(), attributes)
}

/// Creates the configured entries and then the admin entry, unless any root
/// already exists. Stops at the first failure; entries written before it stay.
pub async fn init_base_dn(
    store: &dyn EntryStore,
    ids: &dyn IdGenerator,
    init: &InitConfig,
) -> Result<BootstrapOutcome> {
    let roots = store
        .find_all_roots()
        .await
        .context("Failed to look up existing root entries")?;
    if !roots.is_empty() {
        info!("Directory already initialized ({} root entries), skipping bootstrap", roots.len());
        return Ok(BootstrapOutcome::Skipped);
    }

    let mut created = 0;
    for item in &init.entries {
        let entry = DirectoryEntry::new(
            item.dn.clone(),
            Attributes::from_pairs([(ATTR_OBJECT_CLASS, item.object_classes.clone())]),
        );
        save_new_entry(store, ids, &entry)
            .await
            .with_context(|| format!("Failed to create base entry {}", item.dn))?;
        info!("Created base entry: {}", item.dn);
        created += 1;
    }

    let admin = &init.admin;
    save_new_entry(store, ids, &admin_entry(admin))
        .await
        .with_context(|| format!("Failed to create admin entry {}", admin.dn))?;
    info!("Created admin entry: {}", admin.dn);
    created += 1;

    Ok(BootstrapOutcome::Seeded { created })
}

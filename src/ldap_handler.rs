use crate::dn::EntryKey;
use crate::entry::{Attributes, DirectoryEntry, EntryRecord, ATTR_USER_PASSWORD};
use crate::id::IdGenerator;
use crate::ldap_protocol::{
    AddRequest, Attribute, BindAuthentication, BindRequest, DelRequest, LdapResult, ModifyOperation,
    ModifyRequest, ResultCode, SearchRequest, SearchResultEntry, SearchScope,
};
use crate::store::{save_new_entry, EntryStore, SaveError, StoreError};
use crate::value::normalize_value;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Directory operations over an [`EntryStore`]. Holds no per-connection state:
/// every request is resolved on its own.
pub struct LdapHandler {
    store: Arc<dyn EntryStore>,
    ids: Arc<dyn IdGenerator>,
    bind_base_dn: String,
}

fn invalid_dn(dn: &str, err: impl std::fmt::Display) -> LdapResult {
    LdapResult::new(ResultCode::InvalidDnSyntax, format!("invalid DN '{}': {}", dn, err))
}

fn store_failure(op: &str, dn: &str, err: &StoreError) -> LdapResult {
    error!("{} failed for {}: {}", op, dn, err);
    LdapResult::new(ResultCode::OperationsError, format!("{} failed: {}", op, err))
}

/// Stored values are text; invalid UTF-8 is replaced with U+FFFD.
fn attribute_text(dn: &str, attr: &str, value: &[u8]) -> String {
    match String::from_utf8_lossy(value) {
        Cow::Borrowed(text) => text.to_string(),
        Cow::Owned(text) => {
            warn!("ADD {}: non UTF-8 value for '{}' ({} bytes) stored lossily", dn, attr, value.len());
            text
        }
    }
}

fn to_result_entry(record: EntryRecord) -> SearchResultEntry {
    SearchResultEntry {
        object_name: record.entry.dn,
        attributes: record
            .entry
            .attributes
            .iter()
            .map(|attr| Attribute {
                attr_type: attr.name.clone(),
                attr_values: attr.values.iter().map(|v| v.as_bytes().to_vec()).collect(),
            })
            .collect(),
    }
}

impl LdapHandler {
    pub fn new(store: Arc<dyn EntryStore>, ids: Arc<dyn IdGenerator>, bind_base_dn: impl Into<String>) -> Self {
        Self {
            store,
            ids,
            bind_base_dn: bind_base_dn.into(),
        }
    }

    /// Simple bind only. The name is tried as `cn=<name>,<bind base>` first and
    /// then as a full DN; the first `userPassword` value must match exactly.
    pub async fn handle_bind(&self, req: &BindRequest) -> LdapResult {
        let password = match &req.authentication {
            BindAuthentication::Simple(password) => password,
            BindAuthentication::Sasl { mechanism, .. } => {
                debug!("Rejecting SASL bind ({}) for: {}", mechanism, req.name);
                return LdapResult::new(ResultCode::InvalidCredentials, "only simple bind is supported");
            }
        };
        debug!("Handling BIND request for: {}", req.name);

        let mut candidates = Vec::with_capacity(2);
        if !self.bind_base_dn.is_empty() {
            candidates.push(format!("cn={},{}", req.name, self.bind_base_dn));
        }
        candidates.push(req.name.clone());

        for dn in candidates {
            if EntryKey::from_dn(&dn).is_err() {
                continue;
            }
            match self.store.find_one_entry(&dn).await {
                Ok(Some(record)) => {
                    let stored = record.entry.attributes.first_value(ATTR_USER_PASSWORD);
                    if stored.is_some_and(|p| p.as_bytes() == password.as_slice()) {
                        info!("BIND successful for: {}", record.entry.dn);
                        return LdapResult::success();
                    }
                }
                Ok(None) => {}
                Err(e) => return store_failure("bind", &dn, &e),
            }
        }

        debug!("BIND rejected for: {}", req.name);
        LdapResult::new(ResultCode::InvalidCredentials, "invalid credentials")
    }

    /// Base and one-level scopes only; the filter is logged but not applied.
    pub async fn handle_search(&self, req: &SearchRequest) -> (Vec<SearchResultEntry>, LdapResult) {
        let base = req.base_object.trim();
        debug!(
            "Handling SEARCH request: base={:?}, scope={}, filter={}",
            base,
            req.scope,
            req.filter.to_ldap_string()
        );
        if !base.is_empty() {
            if let Err(e) = EntryKey::from_dn(base) {
                return (Vec::new(), invalid_dn(base, e));
            }
        }

        let found = match req.scope {
            SearchScope::BaseObject => {
                let one = if base.is_empty() {
                    self.store.find_single_root().await
                } else {
                    self.store.find_one_entry(base).await
                };
                one.map(|r| r.into_iter().collect::<Vec<_>>())
            }
            SearchScope::SingleLevel => {
                if base.is_empty() {
                    self.store.find_all_roots().await
                } else {
                    self.store.find_children(base).await
                }
            }
            SearchScope::WholeSubtree => {
                return (
                    Vec::new(),
                    LdapResult::new(ResultCode::NoSuchObject, "subtree scope is not supported"),
                );
            }
        };

        match found {
            Ok(records) if records.is_empty() => (
                Vec::new(),
                LdapResult::new(ResultCode::NoSuchObject, format!("no entries found under: {}", base)),
            ),
            Ok(records) => {
                debug!("SEARCH returned {} entries", records.len());
                (records.into_iter().map(to_result_entry).collect(), LdapResult::success())
            }
            Err(e) => (Vec::new(), store_failure("search", base, &e)),
        }
    }

    pub async fn handle_add(&self, req: &AddRequest) -> LdapResult {
        debug!("Handling ADD request: dn={}", req.entry);
        if let Err(e) = EntryKey::from_dn(&req.entry) {
            return invalid_dn(&req.entry, e);
        }

        match self.store.find_one_entry(&req.entry).await {
            Ok(Some(_)) => {
                return LdapResult::new(
                    ResultCode::EntryAlreadyExists,
                    format!("entry exists for DN: {}", req.entry),
                )
            }
            Ok(None) => {}
            Err(e) => return store_failure("add", &req.entry, &e),
        }

        let attributes = Attributes::from_pairs(req.attributes.iter().map(|attr| {
            let values: Vec<String> = attr
                .attr_values
                .iter()
                .map(|v| attribute_text(&req.entry, &attr.attr_type, v))
                .collect();
            (attr.attr_type.clone(), values)
        }));
        let entry = DirectoryEntry::new(req.entry.clone(), attributes);

        match save_new_entry(self.store.as_ref(), self.ids.as_ref(), &entry).await {
            Ok(id) => {
                info!("ADD successful for: {} (id {})", req.entry, id);
                LdapResult::success()
            }
            Err(SaveError::Store(StoreError::Duplicate(_))) => LdapResult::new(
                ResultCode::EntryAlreadyExists,
                format!("entry exists for DN: {}", req.entry),
            ),
            Err(SaveError::Store(e)) => store_failure("add", &req.entry, &e),
            Err(SaveError::Id(e)) => {
                error!("add failed for {}: {}", req.entry, e);
                LdapResult::new(ResultCode::OperationsError, e.to_string())
            }
        }
    }

    pub async fn handle_delete(&self, req: &DelRequest) -> LdapResult {
        debug!("Handling DELETE request: dn={}", req.entry);
        if let Err(e) = EntryKey::from_dn(&req.entry) {
            return invalid_dn(&req.entry, e);
        }

        match self.store.find_one_entry(&req.entry).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                return LdapResult::new(ResultCode::NoSuchObject, format!("no such entry: {}", req.entry))
            }
            Err(e) => return store_failure("delete", &req.entry, &e),
        }

        match self.store.delete_entry(&req.entry).await {
            Ok(_) => {
                info!("DELETE successful for: {}", req.entry);
                LdapResult::success()
            }
            Err(e) => store_failure("delete", &req.entry, &e),
        }
    }

    /// Applies all changes in memory and writes the entry back once. A value
    /// that fails to normalize aborts the whole request before anything is written.
    pub async fn handle_modify(&self, req: &ModifyRequest) -> LdapResult {
        debug!("Handling MODIFY request: dn={}", req.object);
        if let Err(e) = EntryKey::from_dn(&req.object) {
            return invalid_dn(&req.object, e);
        }

        let mut entry = match self.store.find_one_entry(&req.object).await {
            Ok(Some(record)) => record.entry,
            Ok(None) => {
                return LdapResult::new(ResultCode::NoSuchObject, format!("no such entry: {}", req.object))
            }
            Err(e) => return store_failure("modify", &req.object, &e),
        };

        for change in &req.changes {
            let name = &change.modification.attr_type;
            let values = match change
                .modification
                .attr_values
                .iter()
                .map(|v| normalize_value(v))
                .collect::<Result<Vec<_>, _>>()
            {
                Ok(values) => values,
                Err(e) => {
                    warn!("MODIFY of {} rejected, bad value for {}: {}", req.object, name, e);
                    return LdapResult::new(
                        ResultCode::OperationsError,
                        format!("invalid value for attribute {}: {}", name, e),
                    );
                }
            };
            match change.operation {
                ModifyOperation::Add => entry.attributes.add_values(name.clone(), values),
                ModifyOperation::Delete => {
                    entry.attributes.remove(name);
                }
                ModifyOperation::Replace => {
                    if !entry.attributes.replace_values(name, values) {
                        debug!("replace of missing attribute {} on {} ignored", name, req.object);
                    }
                }
            }
        }

        match self.store.update_entry(&entry).await {
            Ok(0) => {
                warn!("MODIFY of {} matched no rows; entry removed concurrently", req.object);
                LdapResult::success()
            }
            Ok(_) => {
                info!("MODIFY successful for: {}", req.object);
                LdapResult::success()
            }
            Err(e) => store_failure("modify", &req.object, &e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryRecord;
    use crate::id::{IdError, ItemId, UuidGenerator};
    use crate::ldap_protocol::{Filter, ModifyChange};
    use crate::memory_store::MemoryStore;
    use crate::store::StoreResult;
    use async_trait::async_trait;

    const BASE: &str = "ou=people,dc=example";

    struct FailingIds;

    impl IdGenerator for FailingIds {
        fn next_id(&self) -> Result<ItemId, IdError> {
            Err(IdError("generator offline".into()))
        }
    }

    struct FailingStore;

    #[async_trait]
    impl EntryStore for FailingStore {
        async fn find_single_root(&self) -> StoreResult<Option<EntryRecord>> {
            Err(StoreError::Timeout)
        }
        async fn find_all_roots(&self) -> StoreResult<Vec<EntryRecord>> {
            Err(StoreError::Timeout)
        }
        async fn find_one_entry(&self, _dn: &str) -> StoreResult<Option<EntryRecord>> {
            Err(StoreError::Timeout)
        }
        async fn find_children(&self, _dn: &str) -> StoreResult<Vec<EntryRecord>> {
            Err(StoreError::Timeout)
        }
        async fn save_entry(&self, _entry: &DirectoryEntry, _id: &ItemId) -> StoreResult<()> {
            Err(StoreError::Timeout)
        }
        async fn update_entry(&self, _entry: &DirectoryEntry) -> StoreResult<u64> {
            Err(StoreError::Timeout)
        }
        async fn delete_entry(&self, _dn: &str) -> StoreResult<u64> {
            Err(StoreError::Timeout)
        }
        async fn health_check(&self) -> StoreResult<()> {
            Err(StoreError::Timeout)
        }
    }

    fn attr(name: &str, values: &[&str]) -> Attribute {
        Attribute {
            attr_type: name.to_string(),
            attr_values: values.iter().map(|v| v.as_bytes().to_vec()).collect(),
        }
    }

    fn add(dn: &str, attributes: Vec<Attribute>) -> AddRequest {
        AddRequest {
            entry: dn.to_string(),
            attributes,
        }
    }

    fn simple_bind(name: &str, password: &str) -> BindRequest {
        BindRequest {
            version: 3,
            name: name.to_string(),
            authentication: BindAuthentication::Simple(password.as_bytes().to_vec()),
        }
    }

    fn search(base: &str, scope: SearchScope) -> SearchRequest {
        SearchRequest {
            base_object: base.to_string(),
            scope,
            deref_aliases: 0,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter: Filter::EqualityMatch {
                attr: "cn".into(),
                value: b"nobody-matches-this".to_vec(),
            },
            attributes: vec!["cn".into()],
        }
    }

    fn modify(dn: &str, changes: Vec<(ModifyOperation, Attribute)>) -> ModifyRequest {
        ModifyRequest {
            object: dn.to_string(),
            changes: changes
                .into_iter()
                .map(|(operation, modification)| ModifyChange { operation, modification })
                .collect(),
        }
    }

    async fn seeded() -> (Arc<MemoryStore>, LdapHandler) {
        let store = Arc::new(MemoryStore::new());
        let handler = LdapHandler::new(store.clone(), Arc::new(UuidGenerator), BASE);
        for (dn, attrs) in [
            ("dc=example", vec![attr("objectClass", &["top", "domain"])]),
            (BASE, vec![attr("objectClass", &["top", "organizationalUnit"])]),
            (
                "cn=alice,ou=people,dc=example",
                vec![attr("objectClass", &["person"]), attr("userPassword", &["s3cret", "old"])],
            ),
        ] {
            assert_eq!(handler.handle_add(&add(dn, attrs)).await.code, ResultCode::Success);
        }
        (store, handler)
    }

    #[tokio::test]
    async fn test_bind_short_name_and_full_dn() {
        let (_, handler) = seeded().await;
        assert_eq!(handler.handle_bind(&simple_bind("alice", "s3cret")).await.code, ResultCode::Success);
        assert_eq!(
            handler.handle_bind(&simple_bind("cn=alice, ou=people, dc=example", "s3cret")).await.code,
            ResultCode::Success
        );
    }

    #[tokio::test]
    async fn test_bind_rejections() {
        let (_, handler) = seeded().await;
        // only the first value counts
        assert_eq!(handler.handle_bind(&simple_bind("alice", "old")).await.code, ResultCode::InvalidCredentials);
        assert_eq!(handler.handle_bind(&simple_bind("alice", "S3CRET")).await.code, ResultCode::InvalidCredentials);
        assert_eq!(handler.handle_bind(&simple_bind("mallory", "s3cret")).await.code, ResultCode::InvalidCredentials);
        assert_eq!(handler.handle_bind(&simple_bind("", "")).await.code, ResultCode::InvalidCredentials);
        assert_eq!(handler.handle_bind(&simple_bind("dc=example", "")).await.code, ResultCode::InvalidCredentials);
    }

    #[tokio::test]
    async fn test_sasl_bind_never_touches_store() {
        let store = Arc::new(MemoryStore::new());
        let handler = LdapHandler::new(store.clone(), Arc::new(UuidGenerator), BASE);
        let req = BindRequest {
            version: 3,
            name: "alice".into(),
            authentication: BindAuthentication::Sasl {
                mechanism: "PLAIN".into(),
                credentials: b"\0alice\0s3cret".to_vec(),
            },
        };
        assert_eq!(handler.handle_bind(&req).await.code, ResultCode::InvalidCredentials);
        assert_eq!(store.call_count(), 0);
    }

    #[tokio::test]
    async fn test_bind_store_failure() {
        let handler = LdapHandler::new(Arc::new(FailingStore), Arc::new(UuidGenerator), BASE);
        assert_eq!(handler.handle_bind(&simple_bind("alice", "x")).await.code, ResultCode::OperationsError);
    }

    #[tokio::test]
    async fn test_search_base_scope() {
        let (_, handler) = seeded().await;
        let (entries, result) = handler.handle_search(&search("", SearchScope::BaseObject)).await;
        assert_eq!(result.code, ResultCode::Success);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].object_name, "dc=example");

        let (entries, result) = handler.handle_search(&search("cn=alice,ou=people,dc=example", SearchScope::BaseObject)).await;
        assert_eq!(result.code, ResultCode::Success);
        // all attributes, regardless of filter and requested list
        assert_eq!(entries[0].attributes.len(), 2);

        let (entries, result) = handler.handle_search(&search("cn=nobody,dc=example", SearchScope::BaseObject)).await;
        assert!(entries.is_empty());
        assert_eq!(result.code, ResultCode::NoSuchObject);
    }

    #[tokio::test]
    async fn test_search_base_scope_empty_store() {
        let handler = LdapHandler::new(Arc::new(MemoryStore::new()), Arc::new(UuidGenerator), BASE);
        let (entries, result) = handler.handle_search(&search("", SearchScope::BaseObject)).await;
        assert!(entries.is_empty());
        assert_eq!(result.code, ResultCode::NoSuchObject);
    }

    #[tokio::test]
    async fn test_search_single_level() {
        let (_, handler) = seeded().await;
        let (entries, result) = handler.handle_search(&search("dc=example", SearchScope::SingleLevel)).await;
        assert_eq!(result.code, ResultCode::Success);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].object_name, BASE);

        let (roots, result) = handler.handle_search(&search("", SearchScope::SingleLevel)).await;
        assert_eq!(result.code, ResultCode::Success);
        assert_eq!(roots.len(), 1);

        let (leaf, result) = handler.handle_search(&search("cn=alice,ou=people,dc=example", SearchScope::SingleLevel)).await;
        assert!(leaf.is_empty());
        assert_eq!(result.code, ResultCode::NoSuchObject);
    }

    #[tokio::test]
    async fn test_search_subtree_not_supported() {
        let (store, handler) = seeded().await;
        let calls = store.call_count();
        let (entries, result) = handler.handle_search(&search("dc=example", SearchScope::WholeSubtree)).await;
        assert!(entries.is_empty());
        assert_eq!(result.code, ResultCode::NoSuchObject);
        assert_eq!(store.call_count(), calls);
    }

    #[tokio::test]
    async fn test_search_invalid_base() {
        let (_, handler) = seeded().await;
        let (_, result) = handler.handle_search(&search("example", SearchScope::BaseObject)).await;
        assert_eq!(result.code, ResultCode::InvalidDnSyntax);
    }

    #[tokio::test]
    async fn test_add_then_find_and_duplicate() {
        let (store, handler) = seeded().await;
        let dn = "cn=bob,ou=people,dc=example";
        let attrs = vec![attr("objectClass", &["top", "person"]), attr("sn", &["Builder"])];
        assert_eq!(handler.handle_add(&add(dn, attrs.clone())).await.code, ResultCode::Success);

        let stored = store.find_one_entry(dn).await.unwrap().unwrap();
        assert_eq!(stored.entry_id.len(), 32);
        assert_eq!(stored.entry.attributes.get("sn").unwrap().values, vec!["Builder"]);
        assert_eq!(stored.entry.attributes.get("objectClass").unwrap().values, vec!["top", "person"]);

        let again = handler.handle_add(&add(dn, attrs)).await;
        assert_eq!(again.code, ResultCode::EntryAlreadyExists);
        assert_eq!(again.diagnostic_message, format!("entry exists for DN: {}", dn));
    }

    #[tokio::test]
    async fn test_add_binary_value_is_replaced() {
        let store = Arc::new(MemoryStore::new());
        let handler = LdapHandler::new(store.clone(), Arc::new(UuidGenerator), BASE);
        let photo = Attribute {
            attr_type: "jpegPhoto".into(),
            attr_values: vec![vec![0xFF, 0xD8, b'x']],
        };
        let result = handler.handle_add(&add("cn=carol,dc=example", vec![attr("cn", &["carol"]), photo])).await;
        assert_eq!(result.code, ResultCode::Success);

        let stored = store.find_one_entry("cn=carol,dc=example").await.unwrap().unwrap();
        assert_eq!(stored.entry.attributes.first_value("jpegPhoto"), Some("\u{FFFD}\u{FFFD}x"));
        assert_eq!(stored.entry.attributes.first_value("cn"), Some("carol"));
    }

    #[test]
    fn test_attribute_text() {
        assert_eq!(attribute_text("cn=a", "cn", b"plain"), "plain");
        assert_eq!(attribute_text("cn=a", "cn", &[b'a', 0x80]), "a\u{FFFD}");
    }

    #[tokio::test]
    async fn test_add_failures() {
        let store = Arc::new(MemoryStore::new());
        let handler = LdapHandler::new(store.clone(), Arc::new(FailingIds), BASE);
        let result = handler.handle_add(&add("dc=example", vec![])).await;
        assert_eq!(result.code, ResultCode::OperationsError);
        assert_eq!(store.len().await, 0);

        let handler = LdapHandler::new(Arc::new(FailingStore), Arc::new(UuidGenerator), BASE);
        assert_eq!(handler.handle_add(&add("dc=example", vec![])).await.code, ResultCode::OperationsError);

        let handler = LdapHandler::new(Arc::new(MemoryStore::new()), Arc::new(UuidGenerator), BASE);
        assert_eq!(handler.handle_add(&add("example", vec![])).await.code, ResultCode::InvalidDnSyntax);
    }

    #[tokio::test]
    async fn test_delete() {
        let (store, handler) = seeded().await;
        let dn = "cn=alice,ou=people,dc=example";
        assert_eq!(handler.handle_delete(&DelRequest { entry: dn.into() }).await.code, ResultCode::Success);
        assert!(store.find_one_entry(dn).await.unwrap().is_none());
        assert_eq!(handler.handle_delete(&DelRequest { entry: dn.into() }).await.code, ResultCode::NoSuchObject);

        let failing = LdapHandler::new(Arc::new(FailingStore), Arc::new(UuidGenerator), BASE);
        let result = failing.handle_delete(&DelRequest { entry: dn.into() }).await;
        assert_eq!(result.code, ResultCode::OperationsError);
        assert!(!result.diagnostic_message.is_empty());
    }

    #[tokio::test]
    async fn test_modify_add_delete_replace() {
        let (store, handler) = seeded().await;
        let dn = "cn=alice,ou=people,dc=example";

        // replace never creates
        let before = store.find_one_entry(dn).await.unwrap().unwrap().entry.attributes;
        let result = handler.handle_modify(&modify(dn, vec![(ModifyOperation::Replace, attr("mail", &["a@x"]))])).await;
        assert_eq!(result.code, ResultCode::Success);
        assert_eq!(store.find_one_entry(dn).await.unwrap().unwrap().entry.attributes, before);

        // add creates, then appends
        handler.handle_modify(&modify(dn, vec![(ModifyOperation::Add, attr("mail", &["a@x"]))])).await;
        handler.handle_modify(&modify(dn, vec![(ModifyOperation::Add, attr("mail", &["a@x", "b@x"]))])).await;
        let attrs = store.find_one_entry(dn).await.unwrap().unwrap().entry.attributes;
        assert_eq!(attrs.get("mail").unwrap().values, vec!["a@x", "a@x", "b@x"]);

        // replace overwrites in place
        handler.handle_modify(&modify(dn, vec![(ModifyOperation::Replace, attr("mail", &["c@x"]))])).await;
        let attrs = store.find_one_entry(dn).await.unwrap().unwrap().entry.attributes;
        assert_eq!(attrs.get("mail").unwrap().values, vec!["c@x"]);

        // delete drops the whole attribute whatever values are named
        handler.handle_modify(&modify(dn, vec![(ModifyOperation::Delete, attr("mail", &["unrelated"]))])).await;
        let attrs = store.find_one_entry(dn).await.unwrap().unwrap().entry.attributes;
        assert!(attrs.get("mail").is_none());
    }

    #[tokio::test]
    async fn test_modify_normalizes_wrapped_values() {
        let (store, handler) = seeded().await;
        let dn = "cn=alice,ou=people,dc=example";
        let wrapped = Attribute {
            attr_type: "sn".into(),
            attr_values: vec![vec![0x04, 0x03, b'D', b'o', b'e']],
        };
        handler.handle_modify(&modify(dn, vec![(ModifyOperation::Add, wrapped)])).await;
        let attrs = store.find_one_entry(dn).await.unwrap().unwrap().entry.attributes;
        assert_eq!(attrs.first_value("sn"), Some("Doe"));
    }

    #[tokio::test]
    async fn test_modify_bad_value_aborts_without_update() {
        let (store, handler) = seeded().await;
        let dn = "cn=alice,ou=people,dc=example";
        let mutations = store.mutation_count();
        let bad = Attribute {
            attr_type: "sn".into(),
            attr_values: vec![vec![0x04, 0xFF, b'x']],
        };
        let result = handler
            .handle_modify(&modify(
                dn,
                vec![(ModifyOperation::Add, attr("mail", &["a@x"])), (ModifyOperation::Add, bad)],
            ))
            .await;
        assert_eq!(result.code, ResultCode::OperationsError);
        assert_eq!(store.mutation_count(), mutations);
        let attrs = store.find_one_entry(dn).await.unwrap().unwrap().entry.attributes;
        assert!(attrs.get("mail").is_none());
    }

    #[tokio::test]
    async fn test_modify_missing_entry() {
        let (_, handler) = seeded().await;
        let result = handler
            .handle_modify(&modify("cn=zed,ou=people,dc=example", vec![(ModifyOperation::Add, attr("sn", &["Z"]))]))
            .await;
        assert_eq!(result.code, ResultCode::NoSuchObject);
    }
}

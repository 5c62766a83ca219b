use std::collections::HashSet;
use std::sync::Arc;

use std::time::Duration;

use ldap3::{LdapConnAsync, LdapConnSettings, Mod, Scope, SearchEntry};
use ldap_directory::bootstrap::init_base_dn;
use ldap_directory::config::{AdminEntry, InitConfig, InitEntry};
use ldap_directory::id::UuidGenerator;
use ldap_directory::ldap_protocol::{
    encode_ldap_message, encode_result_message, ExtendedResponse, LdapMessage, LdapResult, ProtocolOp,
    ResultCode, LDAP_TAG_ADD_RESPONSE, LDAP_TAG_BIND_RESPONSE, LDAP_TAG_EXTENDED_RESPONSE, START_TLS_OID,
};
use ldap_directory::memory_store::MemoryStore;
use ldap_directory::tls::load_server_config_from_files;
use ldap_directory::{EntryStore, LdapHandler, LdapServer, Metrics};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

const PEOPLE: &str = "ou=people,dc=example,dc=org";
const ADMIN: &str = "cn=admin,ou=people,dc=example,dc=org";

fn init() -> InitConfig {
    InitConfig {
        entries: vec![
            InitEntry {
                dn: "dc=example,dc=org".into(),
                object_classes: vec!["top".into(), "domain".into()],
            },
            InitEntry {
                dn: PEOPLE.into(),
                object_classes: vec!["top".into(), "organizationalUnit".into()],
            },
        ],
        admin: AdminEntry {
            dn: ADMIN.into(),
            object_classes: vec!["top".into(), "person".into()],
            user_password: "secret".into(),
        },
    }
}

const CERT: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/cert.pem");
const KEY: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data/key.pem");

// SEQUENCE { 1, ExtendedRequest { [0] "1.3.6.1.4.1.1466.20037" } }
const START_TLS_REQUEST: [u8; 31] = [
    0x30, 0x1d, 0x02, 0x01, 0x01, 0x77, 0x18, 0x80, 0x16, b'1', b'.', b'3', b'.', b'6', b'.', b'1', b'.',
    b'4', b'.', b'1', b'.', b'1', b'4', b'6', b'6', b'.', b'2', b'0', b'0', b'3', b'7',
];

fn acceptor() -> TlsAcceptor {
    TlsAcceptor::from(load_server_config_from_files(CERT, KEY).unwrap())
}

async fn start_server() -> (String, Arc<MemoryStore>, Arc<Metrics>) {
    start_server_with("ldap", None).await
}

async fn start_server_with(
    scheme: &str,
    tls: Option<TlsAcceptor>,
) -> (String, Arc<MemoryStore>, Arc<Metrics>) {
    let store = Arc::new(MemoryStore::new());
    init_base_dn(store.as_ref(), &UuidGenerator, &init()).await.unwrap();

    let handler = Arc::new(LdapHandler::new(store.clone(), Arc::new(UuidGenerator), PEOPLE));
    let metrics = Arc::new(Metrics::new());
    let server = LdapServer::new(format!("{}://127.0.0.1:0", scheme), handler, metrics.clone(), tls);
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    (format!("{}://{}", scheme, addr), store, metrics)
}

fn tls_settings() -> LdapConnSettings {
    LdapConnSettings::new().set_no_tls_verify(true)
}

fn set(values: &[&'static str]) -> HashSet<&'static str> {
    values.iter().copied().collect()
}

#[tokio::test]
async fn test_bind() {
    let (url, _, metrics) = start_server().await;
    let (conn, mut ldap) = LdapConnAsync::new(&url).await.unwrap();
    ldap3::drive!(conn);

    assert_eq!(ldap.simple_bind("admin", "secret").await.unwrap().rc, 0);
    assert_eq!(ldap.simple_bind(ADMIN, "secret").await.unwrap().rc, 0);
    assert_eq!(ldap.simple_bind("admin", "wrong").await.unwrap().rc, 49);
    assert_eq!(ldap.simple_bind("nobody", "secret").await.unwrap().rc, 49);

    ldap.unbind().await.unwrap();
    assert_eq!(metrics.requests("bind"), 2);
    assert_eq!(metrics.errors("bind"), 2);
}

#[tokio::test]
async fn test_search_scopes() {
    let (url, _, _) = start_server().await;
    let (conn, mut ldap) = LdapConnAsync::new(&url).await.unwrap();
    ldap3::drive!(conn);

    // absent base: the root entry
    let (entries, res) = ldap
        .search("", Scope::Base, "(objectClass=*)", vec!["*"])
        .await
        .unwrap()
        .success()
        .unwrap();
    assert_eq!(res.rc, 0);
    assert_eq!(entries.len(), 1);
    let root = SearchEntry::construct(entries.into_iter().next().unwrap());
    assert_eq!(root.dn, "dc=example,dc=org");
    assert_eq!(root.attrs["objectClass"], vec!["top", "domain"]);

    // filter is not applied
    let (entries, _) = ldap
        .search(ADMIN, Scope::Base, "(cn=someone-else)", vec!["cn"])
        .await
        .unwrap()
        .success()
        .unwrap();
    let admin = SearchEntry::construct(entries.into_iter().next().unwrap());
    assert_eq!(admin.attrs["userPassword"], vec!["secret"]);

    let (entries, _) = ldap
        .search("dc=example,dc=org", Scope::OneLevel, "(objectClass=*)", vec!["*"])
        .await
        .unwrap()
        .success()
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(SearchEntry::construct(entries.into_iter().next().unwrap()).dn, PEOPLE);

    let res = ldap
        .search(ADMIN, Scope::OneLevel, "(objectClass=*)", vec!["*"])
        .await
        .unwrap();
    assert!(res.0.is_empty());
    assert_eq!(res.1.rc, 32);

    let res = ldap
        .search("dc=example,dc=org", Scope::Subtree, "(objectClass=*)", vec!["*"])
        .await
        .unwrap();
    assert!(res.0.is_empty());
    assert_eq!(res.1.rc, 32);

    ldap.unbind().await.unwrap();
}

#[tokio::test]
async fn test_add_modify_delete() {
    let (url, store, _) = start_server().await;
    let (conn, mut ldap) = LdapConnAsync::new(&url).await.unwrap();
    ldap3::drive!(conn);

    let bob = "cn=bob,ou=people,dc=example,dc=org";
    let res = ldap
        .add(bob, vec![("objectClass", set(&["person"])), ("sn", set(&["Builder"]))])
        .await
        .unwrap();
    assert_eq!(res.rc, 0);

    let dup = ldap.add(bob, vec![("objectClass", set(&["person"]))]).await.unwrap();
    assert_eq!(dup.rc, 68);
    assert_eq!(dup.text, format!("entry exists for DN: {}", bob));

    let res = ldap
        .modify(
            bob,
            vec![
                Mod::Add("mail", set(&["bob@example.org"])),
                Mod::Replace("description", set(&["never created"])),
                Mod::Delete("sn", set(&["not-the-value"])),
            ],
        )
        .await
        .unwrap();
    assert_eq!(res.rc, 0);

    let stored = store.find_one_entry(bob).await.unwrap().unwrap();
    assert_eq!(stored.entry.attributes.first_value("mail"), Some("bob@example.org"));
    assert!(stored.entry.attributes.get("description").is_none());
    assert!(stored.entry.attributes.get("sn").is_none());

    // the new entry binds with its short name once it has a password
    ldap.modify(bob, vec![Mod::Add("userPassword", set(&["hunter2"]))]).await.unwrap();
    assert_eq!(ldap.simple_bind("bob", "hunter2").await.unwrap().rc, 0);

    assert_eq!(ldap.delete(bob).await.unwrap().rc, 0);
    assert_eq!(ldap.delete(bob).await.unwrap().rc, 32);
    assert_eq!(
        ldap.modify(bob, vec![Mod::Add("mail", set(&["x"]))]).await.unwrap().rc,
        32
    );
    assert_eq!(ldap.add("no-equals-sign", vec![("cn", set(&["x"]))]).await.unwrap().rc, 34);

    ldap.unbind().await.unwrap();
}

async fn read_exact_len(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}

#[tokio::test]
async fn test_parse_error_keeps_connection() {
    let (url, _, metrics) = start_server().await;
    let mut stream = TcpStream::connect(url.trim_start_matches("ldap://")).await.unwrap();

    // AddRequest with a body that does not decode
    stream
        .write_all(&[0x30, 0x07, 0x02, 0x01, 0x05, 0x68, 0x02, 0x01, 0x00])
        .await
        .unwrap();
    let expected = encode_result_message(
        5,
        LDAP_TAG_ADD_RESPONSE,
        &LdapResult::new(ResultCode::ProtocolError, "Failed to parse LDAP message"),
    );
    assert_eq!(read_exact_len(&mut stream, expected.len()).await, expected);

    // still usable: simple bind "admin"/"secret"
    let mut bind = vec![0x30, 0x17, 0x02, 0x01, 0x06, 0x60, 0x12, 0x02, 0x01, 0x03, 0x04, 0x05];
    bind.extend_from_slice(b"admin");
    bind.extend_from_slice(&[0x80, 0x06]);
    bind.extend_from_slice(b"secret");
    stream.write_all(&bind).await.unwrap();
    let expected = encode_result_message(6, LDAP_TAG_BIND_RESPONSE, &LdapResult::success());
    assert_eq!(read_exact_len(&mut stream, expected.len()).await, expected);
    assert_eq!(metrics.parse_errors.load(std::sync::atomic::Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_unframeable_stream_is_closed() {
    let (url, _, _) = start_server().await;
    let mut stream = TcpStream::connect(url.trim_start_matches("ldap://")).await.unwrap();
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

    let expected = encode_result_message(
        0,
        LDAP_TAG_EXTENDED_RESPONSE,
        &LdapResult::new(ResultCode::ProtocolError, "Invalid message"),
    );
    let mut received = Vec::new();
    stream.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn test_start_tls_then_search() {
    let (url, _, metrics) = start_server_with("ldap", Some(acceptor())).await;
    let (conn, mut ldap) = LdapConnAsync::with_settings(tls_settings().set_starttls(true), &url)
        .await
        .unwrap();
    ldap3::drive!(conn);

    assert_eq!(ldap.simple_bind("admin", "secret").await.unwrap().rc, 0);
    let (entries, res) = ldap
        .search(ADMIN, Scope::Base, "(objectClass=*)", vec!["*"])
        .await
        .unwrap()
        .success()
        .unwrap();
    assert_eq!(res.rc, 0);
    assert_eq!(entries.len(), 1);
    assert_eq!(SearchEntry::construct(entries.into_iter().next().unwrap()).dn, ADMIN);

    ldap.unbind().await.unwrap();
    assert_eq!(metrics.requests("extended"), 1);
    assert_eq!(metrics.errors("extended"), 0);
}

#[tokio::test]
async fn test_ldaps_listener() {
    let (url, _, _) = start_server_with("ldaps", Some(acceptor())).await;
    let (conn, mut ldap) = LdapConnAsync::with_settings(tls_settings(), &url).await.unwrap();
    ldap3::drive!(conn);

    assert_eq!(ldap.simple_bind(ADMIN, "secret").await.unwrap().rc, 0);
    let (entries, _) = ldap
        .search("dc=example,dc=org", Scope::OneLevel, "(objectClass=*)", vec!["*"])
        .await
        .unwrap()
        .success()
        .unwrap();
    assert_eq!(entries.len(), 1);
    ldap.unbind().await.unwrap();
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[tokio::test]
async fn test_start_tls_handshake_failure_is_reported() {
    let (url, _, metrics) = start_server_with("ldap", Some(acceptor())).await;
    let mut stream = TcpStream::connect(url.trim_start_matches("ldap://")).await.unwrap();

    stream.write_all(&START_TLS_REQUEST).await.unwrap();
    let ack = encode_ldap_message(&LdapMessage {
        message_id: 1,
        protocol_op: ProtocolOp::ExtendedResponse(ExtendedResponse {
            result: LdapResult::success(),
            response_name: Some(START_TLS_OID.to_string()),
            response_value: None,
        }),
        controls: None,
    })
    .unwrap();
    assert_eq!(read_exact_len(&mut stream, ack.len()).await, ack);

    // plaintext where the ClientHello should be
    stream.write_all(b"this is not a TLS handshake\r\n").await.unwrap();

    // the server's TLS alert may come first; the failure response follows
    let prefix = b"StartTLS Handshake error : \"";
    let mut received = Vec::new();
    let body = tokio::time::timeout(Duration::from_secs(5), async {
        let mut chunk = [0u8; 512];
        loop {
            if let Some(at) = find(&received, &[0x02, 0x01, 0x01, 0x78]) {
                let len = received.get(at + 4).copied().map(usize::from);
                if let Some(len) = len {
                    if received.len() >= at + 5 + len {
                        return received[at + 5..at + 5 + len].to_vec();
                    }
                }
            }
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before the failure response");
            received.extend_from_slice(&chunk[..n]);
        }
    })
    .await
    .unwrap();

    // resultCode operationsError, then the diagnostic with the reason
    assert_eq!(&body[..3], &[0x0a, 0x01, 0x01]);
    let text = find(&body, prefix).expect("diagnostic message");
    assert!(body[text + prefix.len()..].ends_with(b"\""));
    assert_eq!(metrics.errors("extended"), 1);

    // the connection stays open and speaks plain LDAP
    let mut bind = vec![0x30, 0x17, 0x02, 0x01, 0x02, 0x60, 0x12, 0x02, 0x01, 0x03, 0x04, 0x05];
    bind.extend_from_slice(b"admin");
    bind.extend_from_slice(&[0x80, 0x06]);
    bind.extend_from_slice(b"secret");
    stream.write_all(&bind).await.unwrap();
    let expected = encode_result_message(2, LDAP_TAG_BIND_RESPONSE, &LdapResult::success());
    assert_eq!(read_exact_len(&mut stream, expected.len()).await, expected);
}

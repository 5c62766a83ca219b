use crate::ldap_handler::LdapHandler;
use crate::metrics::Metrics;
use crate::ldap_protocol::{
    encode_ldap_message, encode_result_message, parse_ldap_message, parse_ldap_message_header,
    response_tag_for_request, ExtendedResponse, LdapMessage, LdapResult, ProtocolOp, ResultCode,
    LDAP_TAG_ABANDON_REQUEST, LDAP_TAG_EXTENDED_RESPONSE, LDAP_TAG_UNBIND_REQUEST, START_TLS_OID,
};
use crate::value::{BerLength, ValueError, TAG_OCTET_STRING};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{error, info, warn, debug};
use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::server::TlsStream;

/// Top-level LDAP message is always a SEQUENCE (BER tag 0x30).
const LDAP_MESSAGE_SEQUENCE_TAG: u8 = 0x30;

/// Frames larger than this are treated as a broken stream.
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Client stream: either plain TCP or TLS-wrapped (ldaps:// or after StartTLS).
pub enum ClientStream {
    Tcp(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl ClientStream {
    pub fn is_secure(&self) -> bool {
        matches!(self, ClientStream::Tls(_))
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Result of trying to parse one LDAP message from the buffer.
#[derive(Debug)]
pub enum TryParseResult {
    /// Not enough data yet.
    Incomplete,
    Message(LdapMessage),
    /// A complete frame that does not decode. The frame has been consumed;
    /// answer with protocolError under `response_tag` (None for requests that
    /// never get a response).
    ParseError {
        message_id: i32,
        response_tag: Option<u8>,
        reason: String,
    },
}

/// What the connection loop does after a request was handled.
#[derive(Debug)]
enum Reply {
    /// Encoded response messages, written in order.
    Send(Vec<Vec<u8>>),
    Nothing,
    /// Unbind: close without a response.
    Close,
    /// Acknowledge, then run the TLS handshake on this connection.
    StartTls,
}

pub struct LdapServer {
    listen_url: String,
    handler: Arc<LdapHandler>,
    metrics: Arc<Metrics>,
    /// Present when TLS is enabled: serves StartTLS on ldap:// and every connection on ldaps://.
    tls_acceptor: Option<TlsAcceptor>,
}

impl LdapServer {
    pub fn new(
        listen_url: String,
        handler: Arc<LdapHandler>,
        metrics: Arc<Metrics>,
        tls_acceptor: Option<TlsAcceptor>,
    ) -> Self {
        Self {
            listen_url,
            handler,
            metrics,
            tls_acceptor,
        }
    }

    fn implicit_tls(&self) -> bool {
        self.listen_url.starts_with("ldaps://")
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = parse_listen_url(&self.listen_url)?;
        if self.implicit_tls() && self.tls_acceptor.is_none() {
            bail!("LDAPS listener {} requires tls.enable with cert_file and key_file", self.listen_url);
        }
        TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))
    }

    /// Accept loop on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr().context("Listener has no local address")?;
        info!(
            "LDAP directory listening on {} ({})",
            local,
            if self.implicit_tls() { "ldaps" } else { "ldap" }
        );

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("New connection from {}", peer_addr);
                    let handler = Arc::clone(&self.handler);
                    let metrics = Arc::clone(&self.metrics);
                    metrics.inc_connections();
                    let acceptor = self.tls_acceptor.clone();
                    let implicit_tls = self.implicit_tls();

                    tokio::spawn(async move {
                        let client_stream = match (&acceptor, implicit_tls) {
                            (Some(acceptor), true) => match acceptor.accept(stream).await {
                                Ok(tls_stream) => ClientStream::Tls(tls_stream),
                                Err(e) => {
                                    error!("TLS handshake failed for {}: {}", peer_addr, e);
                                    return;
                                }
                            },
                            _ => ClientStream::Tcp(stream),
                        };
                        if let Err(e) = handle_client(client_stream, peer_addr, handler, metrics, acceptor).await {
                            error!("Error handling client {}: {:#}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }
}

fn parse_listen_url(url: &str) -> Result<SocketAddr> {
    // Parse ldap://host:port or ldaps://host:port
    let url = url.strip_prefix("ldap://")
        .or_else(|| url.strip_prefix("ldaps://"))
        .ok_or_else(|| anyhow::anyhow!("Invalid URL scheme, expected ldap:// or ldaps://"))?;

    let url = url.trim_start_matches('/');

    if url.starts_with(':') {
        // Just port specified, bind to all interfaces
        let port: u16 = url.trim_start_matches(':')
            .parse()
            .context("Invalid port number")?;
        Ok(SocketAddr::from(([0, 0, 0, 0], port)))
    } else {
        url.parse()
            .with_context(|| format!("Failed to parse address: {}", url))
    }
}

async fn send(stream: &mut ClientStream, messages: &[Vec<u8>]) -> std::io::Result<()> {
    for data in messages {
        stream.write_all(data).await?;
    }
    stream.flush().await
}

fn extended_response(message_id: i32, result: LdapResult, response_name: Option<&str>) -> Result<Vec<u8>> {
    encode_ldap_message(&LdapMessage {
        message_id,
        protocol_op: ProtocolOp::ExtendedResponse(ExtendedResponse {
            result,
            response_name: response_name.map(str::to_string),
            response_value: None,
        }),
        controls: None,
    })
}

/// Runs the server side of a TLS handshake over a plain connection. On failure
/// the plain stream is handed back so the client can still be told.
async fn upgrade_to_tls(
    stream: ClientStream,
    acceptor: &TlsAcceptor,
) -> std::result::Result<ClientStream, (std::io::Error, ClientStream)> {
    match stream {
        ClientStream::Tcp(tcp) => match acceptor.accept(tcp).into_fallible().await {
            Ok(tls_stream) => Ok(ClientStream::Tls(tls_stream)),
            Err((e, tcp)) => Err((e, ClientStream::Tcp(tcp))),
        },
        tls => Ok(tls),
    }
}

async fn handle_client(
    mut stream: ClientStream,
    peer_addr: SocketAddr,
    handler: Arc<LdapHandler>,
    metrics: Arc<Metrics>,
    tls_acceptor: Option<TlsAcceptor>,
) -> Result<()> {
    debug!("Handling client connection from {}", peer_addr);
    let mut buffer = BytesMut::with_capacity(4096);
    let mut read_buf = vec![0u8; 4096];

    loop {
        let n = match stream.read(&mut read_buf).await {
            Ok(0) => {
                debug!("Client {} disconnected", peer_addr);
                return Ok(());
            }
            Ok(n) => n,
            Err(e) => return Err(e).with_context(|| format!("Error reading from client {}", peer_addr)),
        };
        buffer.extend_from_slice(&read_buf[..n]);

        loop {
            let message = match try_parse_message(&mut buffer) {
                Ok(TryParseResult::Incomplete) => break,
                Ok(TryParseResult::Message(message)) => message,
                Ok(TryParseResult::ParseError {
                    message_id,
                    response_tag,
                    reason,
                }) => {
                    metrics.inc_parse_error();
                    debug!("Parse error from {} (msgid {}): {}", peer_addr, message_id, reason);
                    if let Some(tag) = response_tag {
                        let result = LdapResult::new(ResultCode::ProtocolError, "Failed to parse LDAP message");
                        send(&mut stream, &[encode_result_message(message_id, tag, &result)])
                            .await
                            .with_context(|| format!("Failed to send parse error to {}", peer_addr))?;
                    }
                    continue;
                }
                Err(e) => {
                    metrics.inc_parse_error();
                    warn!("Invalid LDAP stream from {}: {}; closing connection", peer_addr, e);
                    let result = LdapResult::new(ResultCode::ProtocolError, "Invalid message");
                    let _ = send(&mut stream, &[encode_result_message(0, LDAP_TAG_EXTENDED_RESPONSE, &result)]).await;
                    return Ok(());
                }
            };

            let message_id = message.message_id;
            let reply = process_ldap_message(
                &handler,
                &metrics,
                message,
                stream.is_secure(),
                tls_acceptor.is_some(),
            )
            .await;

            match reply {
                Reply::Send(data) => send(&mut stream, &data)
                    .await
                    .with_context(|| format!("Failed to send response to {}", peer_addr))?,
                Reply::Nothing => {}
                Reply::Close => {
                    debug!("Unbind from {}; closing connection", peer_addr);
                    let _ = stream.shutdown().await;
                    return Ok(());
                }
                Reply::StartTls => {
                    let Some(acceptor) = tls_acceptor.as_ref() else {
                        continue;
                    };
                    let start = Instant::now();
                    let ack = extended_response(message_id, LdapResult::success(), Some(START_TLS_OID))?;
                    send(&mut stream, &[ack])
                        .await
                        .with_context(|| format!("Failed to send StartTLS response to {}", peer_addr))?;
                    if !buffer.is_empty() {
                        warn!("Discarding {} plaintext bytes sent after StartTLS by {}", buffer.len(), peer_addr);
                        buffer.clear();
                    }

                    stream = match upgrade_to_tls(stream, acceptor).await {
                        Ok(upgraded) => {
                            info!("StartTLS upgrade completed for {}", peer_addr);
                            metrics.inc_request("extended");
                            upgraded
                        }
                        Err((e, mut plain)) => {
                            error!("StartTLS handshake failed for {}: {}", peer_addr, e);
                            metrics.inc_error("extended");
                            let result = LdapResult::new(
                                ResultCode::OperationsError,
                                format!("StartTLS Handshake error : \"{}\"", e),
                            );
                            let failure = extended_response(message_id, result, None)?;
                            if let Err(e) = send(&mut plain, &[failure]).await {
                                debug!("Could not report StartTLS failure to {}: {}", peer_addr, e);
                            }
                            plain
                        }
                    };
                    metrics.observe_duration("extended", start.elapsed());
                    break;
                }
            }
        }
    }
}

/// Size of the header and of the whole element at the start of `data`, or
/// None when more bytes are needed to know.
fn element_size(data: &[u8]) -> Result<Option<(usize, usize)>> {
    match BerLength::parse(&data[1..]) {
        Err(ValueError::NeedMoreData(_)) => Ok(None),
        Err(e) => bail!("Invalid length encoding: {}", e),
        Ok(len) => {
            let content = len.definite()?;
            if content > MAX_MESSAGE_SIZE {
                bail!("Message of {} bytes exceeds the {} byte limit", content, MAX_MESSAGE_SIZE);
            }
            let header = 1 + len.encoded_len();
            Ok(Some((header, header + content)))
        }
    }
}

/// Take one message off the front of `buffer`.
///
/// An error means the stream cannot be framed at all and the connection
/// should be dropped.
pub fn try_parse_message(buffer: &mut BytesMut) -> Result<TryParseResult> {
    let Some(&first_byte) = buffer.first() else {
        return Ok(TryParseResult::Incomplete);
    };
    if first_byte != LDAP_MESSAGE_SEQUENCE_TAG && first_byte != TAG_OCTET_STRING {
        bail!("Unexpected leading byte 0x{:02X}, expected SEQUENCE", first_byte);
    }
    let Some((header, total)) = element_size(buffer)? else {
        return Ok(TryParseResult::Incomplete);
    };
    if buffer.len() < total {
        return Ok(TryParseResult::Incomplete);
    }

    let frame = buffer.split_to(total);
    // Some clients send 0x04 <len> <LDAPMessage>.
    let inner = if first_byte == TAG_OCTET_STRING {
        &frame[header..]
    } else {
        &frame[..]
    };

    match parse_ldap_message(inner) {
        Ok(message) => Ok(TryParseResult::Message(message)),
        Err(e) => {
            let hex_preview: String = inner
                .iter()
                .take(64)
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(" ");
            warn!("Failed to parse LDAP message: {} (first 64 bytes: {})", e, hex_preview);
            let (message_id, response_tag) = match parse_ldap_message_header(inner) {
                Ok((id, LDAP_TAG_UNBIND_REQUEST | LDAP_TAG_ABANDON_REQUEST)) => (id, None),
                Ok((id, tag)) => (
                    id,
                    Some(response_tag_for_request(tag).unwrap_or(LDAP_TAG_EXTENDED_RESPONSE)),
                ),
                Err(_) => (0, Some(LDAP_TAG_EXTENDED_RESPONSE)),
            };
            Ok(TryParseResult::ParseError {
                message_id,
                response_tag,
                reason: e.to_string(),
            })
        }
    }
}

fn record(metrics: &Metrics, op: &str, start: Instant, result: &LdapResult) {
    metrics.observe_duration(op, start.elapsed());
    if result.code == ResultCode::Success {
        metrics.inc_request(op);
    } else {
        metrics.inc_error(op);
    }
}

async fn process_ldap_message(
    handler: &LdapHandler,
    metrics: &Metrics,
    message: LdapMessage,
    secure: bool,
    starttls_available: bool,
) -> Reply {
    let message_id = message.message_id;
    let op = message.protocol_op.name();
    let start = Instant::now();

    let (responses, result) = match message.protocol_op {
        ProtocolOp::BindRequest(req) => {
            let result = handler.handle_bind(&req).await;
            (vec![ProtocolOp::BindResponse(result.clone())], result)
        }
        ProtocolOp::SearchRequest(req) => {
            let (entries, result) = handler.handle_search(&req).await;
            let mut ops: Vec<ProtocolOp> = entries.into_iter().map(ProtocolOp::SearchResultEntry).collect();
            ops.push(ProtocolOp::SearchResultDone(result.clone()));
            (ops, result)
        }
        ProtocolOp::AddRequest(req) => {
            let result = handler.handle_add(&req).await;
            (vec![ProtocolOp::AddResponse(result.clone())], result)
        }
        ProtocolOp::DelRequest(req) => {
            let result = handler.handle_delete(&req).await;
            (vec![ProtocolOp::DelResponse(result.clone())], result)
        }
        ProtocolOp::ModifyRequest(req) => {
            let result = handler.handle_modify(&req).await;
            (vec![ProtocolOp::ModifyResponse(result.clone())], result)
        }
        ProtocolOp::UnbindRequest => return Reply::Close,
        ProtocolOp::AbandonRequest(to_abandon) => {
            debug!("Abandon request for msgid {} (ignored)", to_abandon);
            return Reply::Nothing;
        }
        ProtocolOp::ExtendedRequest(req) if req.request_name == START_TLS_OID && starttls_available => {
            if !secure {
                debug!("StartTLS requested (msgid {})", message_id);
                return Reply::StartTls;
            }
            let result = LdapResult::new(ResultCode::ProtocolError, "StartTLS not permitted on secure connection");
            (vec![ProtocolOp::ExtendedResponse(ExtendedResponse {
                result: result.clone(),
                response_name: None,
                response_value: None,
            })], result)
        }
        ProtocolOp::ExtendedRequest(req) => {
            debug!("Unsupported extended operation: {}", req.request_name);
            let result = LdapResult::new(
                ResultCode::ProtocolError,
                format!("Unsupported extended operation: {}", req.request_name),
            );
            (vec![ProtocolOp::ExtendedResponse(ExtendedResponse {
                result: result.clone(),
                response_name: None,
                response_value: None,
            })], result)
        }
        ProtocolOp::ModifyDNRequest(req) => {
            debug!("Rejecting MODIFYDN request: dn={}", req.entry);
            let result = LdapResult::new(ResultCode::UnwillingToPerform, "ModifyDN is not supported");
            (vec![ProtocolOp::ModifyDNResponse(result.clone())], result)
        }
        ProtocolOp::CompareRequest(req) => {
            debug!("Rejecting COMPARE request: dn={}", req.entry);
            let result = LdapResult::new(ResultCode::UnwillingToPerform, "Compare is not supported");
            (vec![ProtocolOp::CompareResponse(result.clone())], result)
        }
        other => {
            warn!("Ignoring {} response sent by a client (msgid {})", other.name(), message_id);
            metrics.inc_error("other");
            return Reply::Nothing;
        }
    };

    record(metrics, op, start, &result);

    let mut encoded = Vec::with_capacity(responses.len());
    for protocol_op in responses {
        let response = LdapMessage {
            message_id,
            protocol_op,
            controls: None,
        };
        match encode_ldap_message(&response) {
            Ok(data) => encoded.push(data),
            Err(e) => {
                error!("Failed to encode {} response (msgid {}): {}", op, message_id, e);
                let fallback = LdapResult::new(ResultCode::Other, "Failed to encode response");
                return Reply::Send(vec![encode_result_message(message_id, LDAP_TAG_EXTENDED_RESPONSE, &fallback)]);
            }
        }
    }
    Reply::Send(encoded)
}

//! Prometheus-format metrics (RED: Rate, Errors, Duration) and the health endpoints.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use anyhow::{Context, Result};
use tracing::{error, info, warn};
use serde::Serialize;

use crate::store::EntryStore;

/// Upper bucket bounds for the duration histogram (seconds). +Inf is the total count.
const DURATION_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Operations with their own counters, in render order.
pub const OPERATIONS: [&str; 6] = ["bind", "search", "add", "delete", "modify", "extended"];

fn op_index(op: &str) -> Option<usize> {
    OPERATIONS.iter().position(|o| *o == op)
}

/// Non-cumulative buckets plus count and sum (microseconds).
#[derive(Debug, Default)]
struct DurationHistogram {
    buckets: [AtomicU64; 11],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl DurationHistogram {
    fn observe(&self, duration: Duration) {
        let micros = duration.as_micros().min(u64::MAX as u128) as u64;
        let secs = duration.as_secs_f64();
        if let Some(i) = DURATION_BUCKETS.iter().position(|&le| secs <= le) {
            self.buckets[i].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }
}

/// Lock-free counters shared by every connection.
#[derive(Debug, Default)]
pub struct Metrics {
    pub connections_total: AtomicU64,
    /// Messages that could not be decoded.
    pub parse_errors: AtomicU64,
    requests: [AtomicU64; 6],
    errors: [AtomicU64; 6],
    /// Failures outside a known operation (unsupported requests, write errors).
    pub errors_other: AtomicU64,
    durations: [DurationHistogram; 6],
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_connections(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Successful request for `op`. Unknown names are ignored.
    #[inline]
    pub fn inc_request(&self, op: &str) {
        if let Some(i) = op_index(op) {
            self.requests[i].fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Failed request for `op`; anything unknown lands in `other`.
    #[inline]
    pub fn inc_error(&self, op: &str) {
        match op_index(op) {
            Some(i) => self.errors[i].fetch_add(1, Ordering::Relaxed),
            None => self.errors_other.fetch_add(1, Ordering::Relaxed),
        };
    }

    #[inline]
    pub fn observe_duration(&self, op: &str, duration: Duration) {
        if let Some(i) = op_index(op) {
            self.durations[i].observe(duration);
        }
    }

    #[inline]
    pub fn inc_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests(&self, op: &str) -> u64 {
        op_index(op).map_or(0, |i| self.requests[i].load(Ordering::Relaxed))
    }

    pub fn errors(&self, op: &str) -> u64 {
        match op_index(op) {
            Some(i) => self.errors[i].load(Ordering::Relaxed),
            None => self.errors_other.load(Ordering::Relaxed),
        }
    }

    /// Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let c = self.connections_total.load(Ordering::Relaxed);
        out.push_str("# HELP ldap_directory_connections_total Total number of client connections accepted.\n");
        out.push_str("# TYPE ldap_directory_connections_total counter\n");
        out.push_str(&format!("ldap_directory_connections_total {}\n", c));

        let pe = self.parse_errors.load(Ordering::Relaxed);
        out.push_str("# HELP ldap_directory_parse_errors_total Total number of LDAP message parse errors.\n");
        out.push_str("# TYPE ldap_directory_parse_errors_total counter\n");
        out.push_str(&format!("ldap_directory_parse_errors_total {}\n", pe));

        out.push_str("# HELP ldap_directory_requests_total Total LDAP requests by operation (success).\n");
        out.push_str("# TYPE ldap_directory_requests_total counter\n");
        for (i, op) in OPERATIONS.iter().enumerate() {
            out.push_str(&format!(
                "ldap_directory_requests_total{{op=\"{}\"}} {}\n",
                op,
                self.requests[i].load(Ordering::Relaxed)
            ));
        }

        out.push_str("# HELP ldap_directory_errors_total Total errors by operation.\n");
        out.push_str("# TYPE ldap_directory_errors_total counter\n");
        for (i, op) in OPERATIONS.iter().enumerate() {
            out.push_str(&format!(
                "ldap_directory_errors_total{{op=\"{}\"}} {}\n",
                op,
                self.errors[i].load(Ordering::Relaxed)
            ));
        }
        out.push_str(&format!(
            "ldap_directory_errors_total{{op=\"other\"}} {}\n",
            self.errors_other.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP ldap_directory_request_duration_seconds Request duration in seconds by operation.\n");
        out.push_str("# TYPE ldap_directory_request_duration_seconds histogram\n");
        for (op, hist) in OPERATIONS.iter().zip(self.durations.iter()) {
            let count = hist.count.load(Ordering::Relaxed);
            let mut cum = 0u64;
            for (i, &le) in DURATION_BUCKETS.iter().enumerate() {
                cum += hist.buckets[i].load(Ordering::Relaxed);
                out.push_str(&format!(
                    "ldap_directory_request_duration_seconds_bucket{{op=\"{}\",le=\"{}\"}} {}\n",
                    op, le, cum
                ));
            }
            out.push_str(&format!(
                "ldap_directory_request_duration_seconds_bucket{{op=\"{}\",le=\"+Inf\"}} {}\n",
                op, count
            ));
            let sum_secs = hist.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
            out.push_str(&format!(
                "ldap_directory_request_duration_seconds_sum{{op=\"{}\"}} {}\n",
                op, sum_secs
            ));
            out.push_str(&format!(
                "ldap_directory_request_duration_seconds_count{{op=\"{}\"}} {}\n",
                op, count
            ));
        }

        out
    }
}

/// GET /ready body.
#[derive(Serialize)]
struct ReadyBody {
    ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Path from the HTTP request line ("GET /health HTTP/1.1" -> "/health").
fn request_path(first_line: &str) -> &str {
    let line = first_line.trim();
    let mut parts = line.split_ascii_whitespace();
    let _method = parts.next();
    let path = parts.next().unwrap_or("");
    if path.starts_with('/') {
        path
    } else {
        ""
    }
}

/// Status line, body and content type for one request path.
async fn route(path: &str, metrics: &Metrics, store: &dyn EntryStore) -> (&'static str, String, &'static str) {
    match path {
        "/health" => ("200 OK", "ok".to_string(), "text/plain; charset=utf-8"),
        "/ready" => {
            let check = store.health_check().await;
            if let Err(e) = &check {
                warn!("Readiness check failed: {}", e);
            }
            let body = ReadyBody {
                ready: check.is_ok(),
                error: check.err().map(|e| e.to_string()),
            };
            let status = if body.ready { "200 OK" } else { "503 Service Unavailable" };
            let json = serde_json::to_string(&body)
                .unwrap_or_else(|_| r#"{"ready":false,"error":"serialize"}"#.to_string());
            (status, json, "application/json")
        }
        "/metrics" => ("200 OK", metrics.render(), "text/plain; charset=utf-8"),
        _ => (
            "404 Not Found",
            "Not found. Supported: GET /metrics, GET /health, GET /ready.\n".to_string(),
            "text/plain; charset=utf-8",
        ),
    }
}

/// Serves GET /metrics, GET /health and GET /ready.
/// - /health (liveness): 200 while the process runs.
/// - /ready (readiness): 200 when the entry store answers a health check, else 503.
pub async fn run_metrics_server(addr: &str, metrics: Arc<Metrics>, store: Arc<dyn EntryStore>) -> Result<()> {
    let socket_addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid metrics listen address: {}", addr))?;

    let listener = TcpListener::bind(&socket_addr)
        .await
        .with_context(|| format!("Failed to bind metrics server to {}", socket_addr))?;

    info!("Metrics server listening on http://{} (GET /metrics, /health, /ready)", socket_addr);

    loop {
        let (mut stream, _peer) = match listener.accept().await {
            Ok(accept) => accept,
            Err(e) => {
                error!("Metrics accept error: {}", e);
                continue;
            }
        };

        let metrics = Arc::clone(&metrics);
        let store = Arc::clone(&store);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 2048];
            let mut total = 0usize;
            loop {
                match stream.read(&mut buf[total..]).await {
                    Ok(0) => break,
                    Ok(n) => {
                        total += n;
                        if buf[..total].windows(4).any(|w| w == b"\r\n\r\n") || total >= buf.len() {
                            break;
                        }
                    }
                    Err(_) => return,
                }
            }

            let request = String::from_utf8_lossy(&buf[..total]);
            let path = request.lines().next().map(request_path).unwrap_or("");
            let (status, body, content_type) = route(path, &metrics, store.as_ref()).await;
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: {}\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{}",
                status,
                content_type,
                body.len(),
                body
            );

            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;

    #[test]
    fn test_request_path() {
        assert_eq!(request_path("GET /health HTTP/1.1"), "/health");
        assert_eq!(request_path("GET /ready HTTP/1.0"), "/ready");
        assert_eq!(request_path("GET /metrics HTTP/1.1"), "/metrics");
        assert_eq!(request_path(""), "");
        assert_eq!(request_path("GET  HTTP/1.1"), "");
    }

    #[test]
    fn test_counters_by_operation() {
        let m = Metrics::new();
        m.inc_request("search");
        m.inc_request("search");
        m.inc_request("compare");
        m.inc_error("bind");
        m.inc_error("modify_dn");
        assert_eq!(m.requests("search"), 2);
        assert_eq!(m.requests("compare"), 0);
        assert_eq!(m.errors("bind"), 1);
        assert_eq!(m.errors("other"), 1);

        let out = m.render();
        assert!(out.contains("ldap_directory_requests_total{op=\"search\"} 2"));
        assert!(out.contains("ldap_directory_errors_total{op=\"bind\"} 1"));
        assert!(out.contains("ldap_directory_errors_total{op=\"other\"} 1"));
    }

    #[test]
    fn test_duration_histogram_is_cumulative() {
        let m = Metrics::new();
        m.observe_duration("add", Duration::from_millis(1));
        m.observe_duration("add", Duration::from_millis(200));
        m.observe_duration("add", Duration::from_secs(30));
        let out = m.render();
        assert!(out.contains("ldap_directory_request_duration_seconds_bucket{op=\"add\",le=\"0.005\"} 1"));
        assert!(out.contains("ldap_directory_request_duration_seconds_bucket{op=\"add\",le=\"0.25\"} 2"));
        assert!(out.contains("ldap_directory_request_duration_seconds_bucket{op=\"add\",le=\"10\"} 2"));
        assert!(out.contains("ldap_directory_request_duration_seconds_bucket{op=\"add\",le=\"+Inf\"} 3"));
        assert!(out.contains("ldap_directory_request_duration_seconds_count{op=\"add\"} 3"));
    }

    #[tokio::test]
    async fn test_routes() {
        let m = Metrics::new();
        let store = MemoryStore::new();
        let (status, body, _) = route("/health", &m, &store).await;
        assert_eq!((status, body.as_str()), ("200 OK", "ok"));

        let (status, body, content_type) = route("/ready", &m, &store).await;
        assert_eq!(status, "200 OK");
        assert_eq!(body, r#"{"ready":true}"#);
        assert_eq!(content_type, "application/json");

        let (status, body, _) = route("/metrics", &m, &store).await;
        assert_eq!(status, "200 OK");
        assert!(body.contains("ldap_directory_connections_total 0"));

        let (status, _, _) = route("/nope", &m, &store).await;
        assert_eq!(status, "404 Not Found");
    }
}

//! Health probe logic.
//!
//! A probe is `GET {probe_path}` against the node's address. The body must
//! be a JSON [`HealthPayload`]; anything else, a non-2xx status, or a
//! connection error is a failure.

use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use mrgc_state::{HealthStatus, NodeRecord};
use serde::Deserialize;
use tracing::{debug, warn};

/// Queue depth above which a node reports itself overloaded.
pub const DEGRADED_QUEUE_DEPTH: u32 = 8;

/// Round-trip latency above which a responding node is deprioritized.
pub const DEGRADED_LATENCY_MS: f64 = 5000.0;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Body of a worker's health endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HealthPayload {
    pub status: String,
    pub queue_depth: u32,
    pub avg_latency_ms: f64,
    pub model_loaded: bool,
    pub secure_compute_running: bool,
}

/// Result of a single health probe.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeResult {
    /// The node answered with a valid payload.
    Success {
        /// Measured round-trip time of the probe.
        latency_ms: f64,
        queue_depth: u32,
        /// The node is serving but should be deprioritized.
        degraded: bool,
    },
    Failure { reason: String },
}

impl ProbeResult {
    pub fn failure(reason: impl Into<String>) -> Self {
        ProbeResult::Failure {
            reason: reason.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProbeResult::Success { .. })
    }
}

/// Turn a parsed payload into a probe result.
pub fn classify(payload: &HealthPayload, latency_ms: f64) -> ProbeResult {
    let self_degraded = match payload.status.to_ascii_lowercase().as_str() {
        "healthy" => false,
        "degraded" => true,
        other => return ProbeResult::failure(format!("node reported status {other:?}")),
    };
    let degraded = self_degraded
        || payload.queue_depth > DEGRADED_QUEUE_DEPTH
        || latency_ms > DEGRADED_LATENCY_MS
        || !payload.model_loaded
        || !payload.secure_compute_running;
    ProbeResult::Success {
        latency_ms,
        queue_depth: payload.queue_depth,
        degraded,
    }
}

/// Something that can probe a node.
///
/// The monitor enforces the timeout, so implementations may simply await.
pub trait Prober: Send + Sync {
    fn probe<'a>(&'a self, node: &'a NodeRecord) -> BoxFuture<'a, ProbeResult>;
}

/// Probes nodes over plain HTTP/1.1.
#[derive(Debug, Clone)]
pub struct HttpProber {
    path: String,
}

impl HttpProber {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for HttpProber {
    fn default() -> Self {
        Self::new("/health")
    }
}

impl Prober for HttpProber {
    fn probe<'a>(&'a self, node: &'a NodeRecord) -> BoxFuture<'a, ProbeResult> {
        Box::pin(http_probe(&node.address, &self.path))
    }
}

/// Perform one HTTP health probe against `address`.
pub async fn http_probe(address: &str, path: &str) -> ProbeResult {
    let started = Instant::now();

    let stream = match tokio::net::TcpStream::connect(address).await {
        Ok(s) => s,
        Err(e) => {
            debug!(error = %e, %address, "health probe connection failed");
            return ProbeResult::failure(format!("connect: {e}"));
        }
    };

    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
        Ok(pair) => pair,
        Err(e) => {
            debug!(error = %e, %address, "health probe handshake failed");
            return ProbeResult::failure(format!("handshake: {e}"));
        }
    };

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = match http::Request::builder()
        .method("GET")
        .uri(path)
        .header("host", address)
        .header("user-agent", "mrgc-health/0.1")
        .body(Empty::<Bytes>::new())
    {
        Ok(req) => req,
        Err(e) => return ProbeResult::failure(format!("request: {e}")),
    };

    let resp = match sender.send_request(req).await {
        Ok(resp) => resp,
        Err(e) => {
            debug!(error = %e, %address, "health probe request failed");
            return ProbeResult::failure(format!("request: {e}"));
        }
    };
    if !resp.status().is_success() {
        debug!(status = %resp.status(), %address, "health probe non-2xx");
        return ProbeResult::failure(format!("status {}", resp.status()));
    }

    let body = match resp.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return ProbeResult::failure(format!("body: {e}")),
    };
    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

    match serde_json::from_slice::<HealthPayload>(&body) {
        Ok(payload) => classify(&payload, latency_ms),
        Err(e) => {
            warn!(%address, error = %e, "malformed health payload");
            ProbeResult::failure(format!("malformed payload: {e}"))
        }
    }
}

/// Tracks consecutive probe results for a single node.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    status: Option<HealthStatus>,
    consecutive_failures: u32,
    failure_threshold: u32,
}

impl HealthTracker {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            status: None,
            consecutive_failures: 0,
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Record a probe result and return the node's new health status.
    ///
    /// A failure below the threshold leaves the node routable but
    /// DEGRADED; reaching the threshold makes it UNHEALTHY.
    pub fn record(&mut self, result: &ProbeResult) -> HealthStatus {
        let status = match result {
            ProbeResult::Success { degraded, .. } => {
                if self.status == Some(HealthStatus::Unhealthy) {
                    debug!(
                        failures = self.consecutive_failures,
                        "node recovered"
                    );
                }
                self.consecutive_failures = 0;
                if *degraded {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Healthy
                }
            }
            ProbeResult::Failure { .. } => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.failure_threshold {
                    if self.status != Some(HealthStatus::Unhealthy) {
                        warn!(
                            failures = self.consecutive_failures,
                            threshold = self.failure_threshold,
                            "node marked unhealthy"
                        );
                    }
                    HealthStatus::Unhealthy
                } else {
                    HealthStatus::Degraded
                }
            }
        };
        self.status = Some(status);
        status
    }

    /// Last recorded status; `None` before the first probe.
    pub fn status(&self) -> Option<HealthStatus> {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn payload(status: &str) -> HealthPayload {
        HealthPayload {
            status: status.to_string(),
            queue_depth: 2,
            avg_latency_ms: 120.0,
            model_loaded: true,
            secure_compute_running: true,
        }
    }

    fn success(degraded: bool) -> ProbeResult {
        ProbeResult::Success {
            latency_ms: 10.0,
            queue_depth: 1,
            degraded,
        }
    }

    #[test]
    fn classify_healthy() {
        assert_eq!(
            classify(&payload("healthy"), 40.0),
            ProbeResult::Success {
                latency_ms: 40.0,
                queue_depth: 2,
                degraded: false
            }
        );
    }

    #[test]
    fn classify_degradation_signals() {
        assert!(matches!(
            classify(&payload("degraded"), 40.0),
            ProbeResult::Success { degraded: true, .. }
        ));

        let mut busy = payload("healthy");
        busy.queue_depth = 9;
        assert!(matches!(classify(&busy, 40.0), ProbeResult::Success { degraded: true, .. }));

        let mut at_limit = payload("healthy");
        at_limit.queue_depth = 8;
        assert!(matches!(classify(&at_limit, 40.0), ProbeResult::Success { degraded: false, .. }));

        assert!(matches!(
            classify(&payload("healthy"), 5001.0),
            ProbeResult::Success { degraded: true, .. }
        ));

        let mut no_model = payload("healthy");
        no_model.model_loaded = false;
        assert!(matches!(classify(&no_model, 40.0), ProbeResult::Success { degraded: true, .. }));

        let mut no_enclave = payload("healthy");
        no_enclave.secure_compute_running = false;
        assert!(matches!(classify(&no_enclave, 40.0), ProbeResult::Success { degraded: true, .. }));
    }

    #[test]
    fn classify_unknown_status_is_failure() {
        assert!(!classify(&payload("starting"), 40.0).is_success());
    }

    #[test]
    fn tracker_thresholds() {
        let mut tracker = HealthTracker::new(3);
        assert_eq!(tracker.status(), None);

        assert_eq!(tracker.record(&success(false)), HealthStatus::Healthy);
        assert_eq!(tracker.record(&ProbeResult::failure("x")), HealthStatus::Degraded);
        assert_eq!(tracker.record(&ProbeResult::failure("x")), HealthStatus::Degraded);
        assert_eq!(tracker.record(&ProbeResult::failure("x")), HealthStatus::Unhealthy);
        assert_eq!(tracker.record(&ProbeResult::failure("x")), HealthStatus::Unhealthy);
        assert_eq!(tracker.consecutive_failures(), 4);

        assert_eq!(tracker.record(&success(true)), HealthStatus::Degraded);
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn tracker_zero_threshold_is_one() {
        let mut tracker = HealthTracker::new(0);
        assert_eq!(tracker.record(&ProbeResult::failure("x")), HealthStatus::Unhealthy);
    }

    /// Serve a single canned HTTP response, returning the bound address.
    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        });
        addr
    }

    #[tokio::test]
    async fn http_probe_parses_payload() {
        let addr = serve_once(
            "200 OK",
            r#"{"status":"healthy","queue_depth":3,"avg_latency_ms":80.0,"model_loaded":true,"secure_compute_running":true}"#,
        )
        .await;
        match http_probe(&addr, "/health").await {
            ProbeResult::Success { queue_depth, degraded, .. } => {
                assert_eq!(queue_depth, 3);
                assert!(!degraded);
            }
            other => panic!("unexpected probe result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn http_probe_non_2xx_is_failure() {
        let addr = serve_once("503 Service Unavailable", "{}").await;
        assert!(!http_probe(&addr, "/health").await.is_success());
    }

    #[tokio::test]
    async fn http_probe_malformed_payload_is_failure() {
        let addr = serve_once("200 OK", r#"{"status":"healthy"}"#).await;
        assert!(!http_probe(&addr, "/health").await.is_success());
    }

    #[tokio::test]
    async fn http_probe_to_closed_port_is_failure() {
        let result = http_probe("127.0.0.1:1", "/health").await;
        assert!(!result.is_success());
    }
}

//! Readiness polling for freshly started sidecars.

use bytes::Bytes;
use http::{Request, StatusCode};
use http_body_util::Empty;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Wait used when the manifest declares no start period.
pub const DEFAULT_START_PERIOD: Duration = Duration::from_secs(10);

pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// HTTP readiness probe against `127.0.0.1:{port}{path}`.
#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    pub port: u16,
    pub path: String,
    pub expected_status: u16,
    pub start_period: Duration,
}

impl ReadinessProbe {
    /// Poll until the expected status is seen or the start period elapses.
    /// Returns whether the sidecar became ready.
    pub async fn wait(&self) -> bool {
        let client: Client<HttpConnector, Empty<Bytes>> =
            Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        let uri = format!("http://127.0.0.1:{}{}", self.port, path);
        let deadline = Instant::now() + self.start_period;

        loop {
            if let Some(status) = probe_once(&client, &uri).await {
                if status.as_u16() == self.expected_status {
                    return true;
                }
                debug!(uri = %uri, status = status.as_u16(), "sidecar not ready yet");
            }
            if Instant::now() + POLL_INTERVAL > deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

async fn probe_once(client: &Client<HttpConnector, Empty<Bytes>>, uri: &str) -> Option<StatusCode> {
    let req = Request::get(uri).body(Empty::new()).ok()?;
    match tokio::time::timeout(PROBE_TIMEOUT, client.request(req)).await {
        Ok(Ok(resp)) => Some(resp.status()),
        _ => None,
    }
}

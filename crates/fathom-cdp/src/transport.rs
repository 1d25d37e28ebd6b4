//! Discovery of the inspector's WebSocket endpoint.
//!
//! A freshly-spawned inspector exposes `GET http://127.0.0.1:<port>/json`
//! listing its debuggable targets; the first one carrying a
//! `webSocketDebuggerUrl` is the one to attach to.

use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;

use fathom_core::{DebugError, DebugResult};

pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryTarget {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub web_socket_debugger_url: Option<String>,
}

/// Poll the discovery endpoint until a debuggable target shows up.
pub async fn discover_ws_url(port: u16, timeout: Duration) -> DebugResult<String> {
    let endpoint = format!("http://127.0.0.1:{port}/json");
    let client = reqwest::Client::new();
    let deadline = Instant::now() + timeout;

    loop {
        match fetch_targets(&client, &endpoint).await {
            Ok(targets) => {
                if let Some(url) = targets
                    .into_iter()
                    .find_map(|target| target.web_socket_debugger_url)
                {
                    return Ok(url);
                }
            }
            Err(err) => tracing::trace!("inspector discovery not ready: {err}"),
        }

        if Instant::now() >= deadline {
            return Err(DebugError::Timeout(format!(
                "timed out waiting for the inspector discovery endpoint on port {port}"
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn fetch_targets(
    client: &reqwest::Client,
    endpoint: &str,
) -> Result<Vec<DiscoveryTarget>, reqwest::Error> {
    client
        .get(endpoint)
        .send()
        .await?
        .json::<Vec<DiscoveryTarget>>()
        .await
}

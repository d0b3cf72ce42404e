//! Overlay-network discovery
//!
//! Peers are resolved through an external directory service. Every poll the
//! node publishes its own announcement, then fetches the directory listing
//! and diffs it against what the previous poll saw: listed peers are upserted,
//! peers that dropped out of the listing are marked dead.
//!
//! Directory API:
//! - `POST {overlay_url}/peers` with an [`Announcement`] body
//! - `GET {overlay_url}/peers` returning [`DirectoryListing`]
//!
//! Both carry `Authorization: Bearer <overlay_api_key>` when a key is set.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::{shutdown_signalled, DiscoveryProvider};
use crate::config::DiscoverySettings;
use crate::error::{Error, Result};
use crate::peer::PeerRegistry;
use crate::protocol::Announcement;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Body of `GET /peers`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryListing {
    pub peers: Vec<Announcement>,
}

/// Outcome of applying one listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryDiff {
    pub upserted: Vec<String>,
    pub removed: Vec<String>,
}

/// Directory-backed discovery
pub struct OverlayDiscovery {
    local_node_id: String,
    peers_url: Url,
    api_key: Option<String>,
    poll_interval: Duration,
    client: reqwest::Client,
    /// Peer ids present in the last listing
    seen: Mutex<HashSet<String>>,
}

impl OverlayDiscovery {
    pub fn new(
        local_node_id: impl Into<String>,
        overlay_url: &str,
        api_key: Option<String>,
        poll_interval: Duration,
    ) -> Result<Self> {
        let base = Url::parse(overlay_url).map_err(|e| {
            Error::config_field_invalid(
                "discovery.overlay_url",
                format!("Invalid overlay_url '{}': {}", overlay_url, e),
            )
        })?;
        let peers_url = join_peers(&base)?;

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Discovery(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            local_node_id: local_node_id.into(),
            peers_url,
            api_key,
            poll_interval,
            client,
            seen: Mutex::new(HashSet::new()),
        })
    }

    pub fn from_settings(local_node_id: &str, settings: &DiscoverySettings) -> Result<Self> {
        let url = settings.overlay_url.as_deref().ok_or_else(|| {
            Error::config_field_invalid("discovery.overlay_url", "overlay discovery requires overlay_url")
        })?;
        Self::new(
            local_node_id,
            url,
            settings.overlay_api_key.clone(),
            settings.overlay_poll_interval(),
        )
    }

    /// Directory endpoint polled by this provider
    pub fn peers_url(&self) -> &Url {
        &self.peers_url
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Publish this node's announcement, if it is registered
    pub async fn publish(&self, registry: &PeerRegistry) -> Result<()> {
        let Some(node) = registry.get(&self.local_node_id) else {
            return Ok(());
        };
        let announcement = Announcement::from_descriptor(&node);
        self.authorized(self.client.post(self.peers_url.clone()))
            .json(&announcement)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| Error::Discovery(format!("publish to {} failed: {}", self.peers_url, e)))?;
        Ok(())
    }

    /// Fetch the current directory listing
    pub async fn fetch(&self) -> Result<DirectoryListing> {
        let resp = self
            .authorized(self.client.get(self.peers_url.clone()))
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| Error::Discovery(format!("fetch from {} failed: {}", self.peers_url, e)))?;

        resp.json::<DirectoryListing>()
            .await
            .map_err(|e| Error::Discovery(format!("malformed directory listing: {}", e)))
    }

    /// Diff a listing against the previous one and feed the registry
    pub fn apply(&self, registry: &PeerRegistry, listing: &DirectoryListing) -> DirectoryDiff {
        let mut diff = DirectoryDiff::default();
        let mut current = HashSet::new();

        for announcement in &listing.peers {
            if announcement.node_id == self.local_node_id {
                continue;
            }
            registry.upsert(announcement.to_descriptor());
            current.insert(announcement.node_id.clone());
            diff.upserted.push(announcement.node_id.clone());
        }

        let mut seen = self.seen.lock();
        for gone in seen.difference(&current) {
            if registry.mark_dead(gone) {
                diff.removed.push(gone.clone());
            }
        }
        diff.removed.sort();
        *seen = current;

        diff
    }

    /// Publish, fetch and apply once
    pub async fn poll_once(&self, registry: &PeerRegistry) -> Result<DirectoryDiff> {
        if let Err(e) = self.publish(registry).await {
            // The listing is still useful without our own entry
            warn!(error = %e, "Overlay publish failed");
        }
        let listing = self.fetch().await?;
        Ok(self.apply(registry, &listing))
    }

    async fn poll_loop(self: Arc<Self>, registry: Arc<PeerRegistry>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.poll_interval.min(Duration::from_secs(1)),
            max_interval: self.poll_interval.saturating_mul(8),
            max_elapsed_time: None,
            ..Default::default()
        };

        loop {
            let delay = match self.poll_once(&registry).await {
                Ok(diff) => {
                    backoff.reset();
                    if !diff.removed.is_empty() {
                        info!(removed = ?diff.removed, "Peers left the overlay directory");
                    }
                    debug!(peers = diff.upserted.len(), "Overlay directory polled");
                    self.poll_interval
                }
                Err(e) => {
                    let delay = backoff.next_backoff().unwrap_or(self.poll_interval);
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Overlay directory unreachable");
                    delay
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_signalled(&mut shutdown) => break,
            }
        }
    }
}

fn join_peers(base: &Url) -> Result<Url> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join("peers")
        .map_err(|e| Error::config_field_invalid("discovery.overlay_url", e.to_string()))
}

#[async_trait]
impl DiscoveryProvider for OverlayDiscovery {
    fn name(&self) -> &'static str {
        "overlay"
    }

    async fn start(
        self: Arc<Self>,
        registry: Arc<PeerRegistry>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>> {
        info!(url = %self.peers_url, "Overlay discovery started");
        Ok(vec![tokio::spawn(self.poll_loop(registry, shutdown))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::LivenessPolicy;
    use crate::types::NodeDescriptor;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn registry() -> Arc<PeerRegistry> {
        Arc::new(PeerRegistry::new(LivenessPolicy::new(Duration::from_secs(1), 3)))
    }

    fn listing(ids: &[&str]) -> DirectoryListing {
        DirectoryListing {
            peers: ids
                .iter()
                .map(|id| {
                    Announcement::from_descriptor(&NodeDescriptor::new(
                        *id,
                        format!("{}.overlay:7420", id),
                        2 << 30,
                        1.0,
                    ))
                })
                .collect(),
        }
    }

    /// Minimal directory: answers every request with `body`
    async fn directory(body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else { break };
                let body = body.clone();
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    // Read headers, then any declared body
                    loop {
                        let n = stream.read(&mut buf).await.unwrap_or(0);
                        if n == 0 {
                            return;
                        }
                        request.extend_from_slice(&buf[..n]);
                        let text = String::from_utf8_lossy(&request).to_string();
                        if let Some(end) = text.find("\r\n\r\n") {
                            let declared = text[..end]
                                .lines()
                                .find_map(|l| {
                                    l.to_lowercase()
                                        .strip_prefix("content-length:")
                                        .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                                })
                                .unwrap_or(0);
                            if request.len() >= end + 4 + declared {
                                break;
                            }
                        }
                    }
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        format!("http://{}/v1", addr)
    }

    #[test]
    fn test_peers_url_joins_path() {
        let overlay = OverlayDiscovery::new("a", "http://dir.example/v1", None, Duration::from_secs(1)).unwrap();
        assert_eq!(overlay.peers_url().as_str(), "http://dir.example/v1/peers");

        let overlay = OverlayDiscovery::new("a", "http://dir.example/", None, Duration::from_secs(1)).unwrap();
        assert_eq!(overlay.peers_url().as_str(), "http://dir.example/peers");

        assert!(OverlayDiscovery::new("a", "not a url", None, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_apply_diffs_against_previous_listing() {
        let registry = registry();
        let overlay = OverlayDiscovery::new("self", "http://dir.example", None, Duration::from_secs(1)).unwrap();

        let diff = overlay.apply(&registry, &listing(&["self", "b", "c"]));
        assert_eq!(diff.upserted, vec!["b".to_string(), "c".to_string()]);
        assert!(diff.removed.is_empty());
        assert_eq!(registry.snapshot().len(), 2);

        // c left the directory
        let diff = overlay.apply(&registry, &listing(&["b"]));
        assert_eq!(diff.removed, vec!["c".to_string()]);
        let view = registry.snapshot();
        assert!(view.get("b").is_some());
        assert!(view.get("c").is_none());
    }

    #[tokio::test]
    async fn test_poll_once_against_directory() {
        let body = serde_json::to_string(&listing(&["b", "c"])).unwrap();
        let url = directory(body).await;

        let registry = registry();
        registry.upsert(NodeDescriptor::new("self", "127.0.0.1:7420", 1 << 30, 1.0));
        let overlay = OverlayDiscovery::new("self", &url, Some("secret".into()), Duration::from_millis(50)).unwrap();

        let diff = overlay.poll_once(&registry).await.unwrap();
        assert_eq!(diff.upserted.len(), 2);
        assert!(registry.get("b").is_some());
        assert!(registry.get("c").is_some());
    }

    #[tokio::test]
    async fn test_unreachable_directory_is_discovery_error() {
        let overlay = OverlayDiscovery::new("self", "http://127.0.0.1:9", None, Duration::from_millis(50)).unwrap();
        let err = overlay.fetch().await.unwrap_err();
        assert!(matches!(err, Error::Discovery(_)));
        assert!(err.is_retryable());
    }
}

//! Peer discovery
//!
//! Providers find peers and feed the registry. They only ever call
//! [`PeerRegistry::upsert`] and [`PeerRegistry::mark_dead`]; liveness
//! timeouts are applied by the registry sweep.
//!
//! - [`BroadcastDiscovery`]: UDP presence announcements on the local segment
//! - [`OverlayDiscovery`]: polls an external directory API
//! - [`ManualDiscovery`]: static peer list with periodic health probes

mod broadcast;
mod manual;
mod overlay;

pub use broadcast::*;
pub use manual::*;
pub use overlay::*;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{DiscoveryMode, DiscoverySettings};
use crate::error::Result;
use crate::peer::{NodeTransport, PeerRegistry};

/// A source of peers
#[async_trait]
pub trait DiscoveryProvider: Send + Sync {
    /// Provider name for logs and status
    fn name(&self) -> &'static str;

    /// Spawn the provider's background loops
    ///
    /// Loops exit once `shutdown` flips to true; the returned handles let the
    /// caller wait for them.
    async fn start(
        self: Arc<Self>,
        registry: Arc<PeerRegistry>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>>;
}

/// Build the provider selected by `settings.mode`
pub fn provider_for(
    settings: &DiscoverySettings,
    local_node_id: &str,
    transport: Arc<dyn NodeTransport>,
) -> Result<Arc<dyn DiscoveryProvider>> {
    let provider: Arc<dyn DiscoveryProvider> = match settings.mode {
        DiscoveryMode::Broadcast => Arc::new(BroadcastDiscovery::from_settings(local_node_id, settings)?),
        DiscoveryMode::Overlay => Arc::new(OverlayDiscovery::from_settings(local_node_id, settings)?),
        DiscoveryMode::Manual => Arc::new(ManualDiscovery::from_settings(local_node_id, settings, transport)),
    };
    Ok(provider)
}

/// Resolves once `shutdown` is set (or its sender is gone)
pub(crate) async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerEntry;
    use crate::peer::InMemoryTransport;

    #[test]
    fn test_provider_for_each_mode() {
        let transport: Arc<dyn NodeTransport> = Arc::new(InMemoryTransport::new());

        let mut settings = DiscoverySettings::default();
        settings.mode = DiscoveryMode::Manual;
        settings.peers = vec![PeerEntry::new("b", "10.0.0.2", 7420)];
        let manual = provider_for(&settings, "a", transport.clone()).unwrap();
        assert_eq!(manual.name(), "manual");

        settings.mode = DiscoveryMode::Overlay;
        settings.overlay_url = Some("http://127.0.0.1:9/".into());
        let overlay = provider_for(&settings, "a", transport.clone()).unwrap();
        assert_eq!(overlay.name(), "overlay");

        settings.mode = DiscoveryMode::Broadcast;
        let broadcast = provider_for(&settings, "a", transport).unwrap();
        assert_eq!(broadcast.name(), "broadcast");
    }

    #[tokio::test]
    async fn test_shutdown_signalled() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { shutdown_signalled(&mut rx).await });
        tx.send(true).unwrap();
        waiter.await.unwrap();
    }
}

//! Backend service
//!
//! The entry point callers submit inference requests to. A submission is
//! answered from the response cache when possible, joins an identical run
//! already in flight when there is one, and otherwise partitions the model
//! over the current cluster view and runs the pipeline.
//!
//! `start` wires discovery into the registry, announces the local node and
//! begins the heartbeat/sweep loop. `stop` refuses new work, drains in-flight
//! runs, then tears down every background task, the hop server and the
//! transport.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::batch::BatchingTransport;
use super::cache::{CacheStats, ResponseCache};
use super::coalesce::{Coalescer, RunOutcome};
use crate::backend::LayerBackend;
use crate::config::ClusterConfig;
use crate::discovery::{provider_for, shutdown_signalled, DiscoveryProvider};
use crate::error::{Error, Result, ServiceError};
use crate::executor::{PipelineExecutor, RunTracker};
use crate::partition::{Partition, Partitioner};
use crate::peer::{ClusterView, LivenessPolicy, NodeServer, NodeTransport, PeerRegistry, TcpTransport};
use crate::system::LocalResources;
use crate::types::{InferenceRequest, InferenceResult, ModelProfile, NodeDescriptor};

/// Dead nodes are forgotten after this many liveness windows
const PRUNE_AFTER_DEAD_WINDOWS: u32 = 5;

// ─────────────────────────────────────────────────────────────────
// Reports
// ─────────────────────────────────────────────────────────────────

/// Narrow health contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// ALIVE nodes in the current view
    pub cluster_size: usize,

    /// Whether some registered model can be partitioned over the view
    pub model_loaded: bool,

    /// Cached responses
    pub cache_size: usize,
}

/// Operational status
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub active_requests: usize,
    pub cached_responses: usize,
    pub cluster_version: u64,
    pub timestamp: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────

enum DiscoverySource {
    FromConfig,
    Provider(Arc<dyn DiscoveryProvider>),
    Disabled,
}

/// Assembles a [`BackendService`]
///
/// Defaults follow the configuration: a TCP transport, the discovery mode
/// from `[discovery]`, and a hop server when the node participates with a
/// local engine.
pub struct BackendServiceBuilder {
    config: ClusterConfig,
    registry: Option<Arc<PeerRegistry>>,
    transport: Option<Arc<dyn NodeTransport>>,
    local_backend: Option<Arc<dyn LayerBackend>>,
    resources: Option<LocalResources>,
    discovery: DiscoverySource,
    listen: Option<bool>,
    profiles: Vec<ModelProfile>,
}

impl BackendServiceBuilder {
    fn new(config: ClusterConfig) -> Self {
        Self {
            config,
            registry: None,
            transport: None,
            local_backend: None,
            resources: None,
            discovery: DiscoverySource::FromConfig,
            listen: None,
            profiles: Vec::new(),
        }
    }

    pub fn registry(mut self, registry: Arc<PeerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replace the TCP transport
    pub fn transport(mut self, transport: Arc<dyn NodeTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Engine for the layers assigned to this node
    pub fn local_backend(mut self, backend: Arc<dyn LayerBackend>) -> Self {
        self.local_backend = Some(backend);
        self
    }

    /// Skip the resource probe
    pub fn resources(mut self, resources: LocalResources) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn discovery(mut self, provider: Arc<dyn DiscoveryProvider>) -> Self {
        self.discovery = DiscoverySource::Provider(provider);
        self
    }

    /// Run without a discovery provider; peers are upserted by the caller
    pub fn without_discovery(mut self) -> Self {
        self.discovery = DiscoverySource::Disabled;
        self
    }

    /// Whether to serve hops over TCP for the local node
    pub fn listen(mut self, listen: bool) -> Self {
        self.listen = Some(listen);
        self
    }

    pub fn profile(mut self, profile: ModelProfile) -> Self {
        self.profiles.push(profile);
        self
    }

    pub fn build(self) -> Result<Arc<BackendService>> {
        let config = self.config;
        config.validate()?;
        let node_id = config.node_id();

        let registry = self.registry.unwrap_or_else(|| {
            Arc::new(PeerRegistry::new(LivenessPolicy::new(
                config.discovery.heartbeat_interval(),
                config.discovery.liveness_multiplier,
            )))
        });

        let participating = config.node.participate && self.local_backend.is_some();
        let listen = self
            .listen
            .unwrap_or(participating && self.transport.is_none());

        let base_transport: Arc<dyn NodeTransport> = match self.transport {
            Some(transport) => transport,
            None => {
                let tcp = TcpTransport::new(&config.transport);
                match (&self.local_backend, participating) {
                    (Some(backend), true) => Arc::new(tcp.with_local_node(node_id.clone(), Arc::clone(backend))),
                    _ => Arc::new(tcp),
                }
            }
        };

        let discovery = match self.discovery {
            DiscoverySource::FromConfig => Some(provider_for(
                &config.discovery,
                &node_id,
                Arc::clone(&base_transport),
            )?),
            DiscoverySource::Provider(provider) => Some(provider),
            DiscoverySource::Disabled => None,
        };

        let local = match self.local_backend {
            Some(backend) if config.node.participate => Some(LocalNode {
                backend,
                resources: self
                    .resources
                    .unwrap_or_else(|| LocalResources::probe_with(&config.node)),
                listen,
            }),
            _ => None,
        };

        let transport = Arc::new(BatchingTransport::from_settings(base_transport, &config.service));
        let tracker = Arc::new(RunTracker::new());
        let executor = PipelineExecutor::new(
            config.pipeline.clone(),
            Arc::clone(&registry),
            Arc::clone(&transport) as Arc<dyn NodeTransport>,
        )
        .with_tracker(Arc::clone(&tracker));

        let service = BackendService {
            cache: ResponseCache::from_settings(&config.cache),
            node_id,
            registry,
            transport,
            executor,
            tracker,
            coalescer: Coalescer::new(),
            partitioner: Partitioner::new(),
            profiles: RwLock::new(HashMap::new()),
            partitions: Mutex::new(HashMap::new()),
            local,
            discovery,
            advertised: RwLock::new(None),
            accepting: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
            config,
        };

        for path in &service.config.models.profiles {
            service.register_profile(ModelProfile::load_from_file(Path::new(path))?)?;
        }
        for profile in self.profiles {
            service.register_profile(profile)?;
        }

        Ok(Arc::new(service))
    }
}

// ─────────────────────────────────────────────────────────────────
// Service
// ─────────────────────────────────────────────────────────────────

struct LocalNode {
    backend: Arc<dyn LayerBackend>,
    resources: LocalResources,
    listen: bool,
}

#[derive(Default)]
struct Lifecycle {
    running: bool,
    shutdown_tx: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
    server: Option<Arc<NodeServer>>,
    started_at: Option<Instant>,
}

/// Cluster request dispatch
pub struct BackendService {
    config: ClusterConfig,
    node_id: String,
    registry: Arc<PeerRegistry>,
    transport: Arc<BatchingTransport>,
    executor: PipelineExecutor,
    tracker: Arc<RunTracker>,
    cache: ResponseCache,
    coalescer: Coalescer,
    partitioner: Partitioner,
    profiles: RwLock<HashMap<String, Arc<ModelProfile>>>,
    /// Last partition per model, reused while the view version holds
    partitions: Mutex<HashMap<String, Partition>>,
    local: Option<LocalNode>,
    discovery: Option<Arc<dyn DiscoveryProvider>>,
    advertised: RwLock<Option<String>>,
    accepting: AtomicBool,
    stopped: AtomicBool,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl BackendService {
    pub fn builder(config: ClusterConfig) -> BackendServiceBuilder {
        BackendServiceBuilder::new(config)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &Arc<RunTracker> {
        &self.tracker
    }

    pub fn transport(&self) -> &Arc<BatchingTransport> {
        &self.transport
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    // ─────────────────────────────────────────────────────────────
    // Models
    // ─────────────────────────────────────────────────────────────

    /// Make a model available for submission
    pub fn register_profile(&self, profile: ModelProfile) -> Result<()> {
        profile.validate()?;
        info!(
            model_id = %profile.model_id,
            layers = profile.total_layers(),
            memory_bytes = profile.total_memory(),
            "Model profile registered"
        );
        self.partitions.lock().remove(&profile.model_id);
        self.profiles
            .write()
            .insert(profile.model_id.clone(), Arc::new(profile));
        Ok(())
    }

    pub fn models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.profiles.read().keys().cloned().collect();
        models.sort();
        models
    }

    fn profile(&self, model_id: &str) -> Result<Arc<ModelProfile>> {
        self.profiles
            .read()
            .get(model_id)
            .cloned()
            .ok_or_else(|| Error::model_not_found(model_id))
    }

    /// Partition for `profile` over the current view
    ///
    /// Reuses the previous partition while the view version is unchanged.
    pub fn partition_for(&self, profile: &ModelProfile) -> Result<Partition> {
        let view = self.registry.snapshot();
        self.partition_over(&view, profile)
    }

    fn partition_over(&self, view: &ClusterView, profile: &ModelProfile) -> Result<Partition> {
        let mut partitions = self.partitions.lock();
        if let Some(cached) = partitions.get(&profile.model_id) {
            if cached.view_version == view.version {
                return Ok(cached.clone());
            }
        }

        let partition = self.partitioner.compute(view, profile)?;
        partitions.insert(profile.model_id.clone(), partition.clone());
        Ok(partition)
    }

    // ─────────────────────────────────────────────────────────────
    // Submission
    // ─────────────────────────────────────────────────────────────

    /// Run one request
    ///
    /// Identical requests (same fingerprint) are answered from the cache
    /// within the TTL, or share a single run while one is in flight.
    pub async fn submit(self: &Arc<Self>, request: InferenceRequest) -> RunOutcome {
        if !self.is_running() {
            return Err(ServiceError::from(Error::ServiceStopped));
        }
        request.validate().map_err(ServiceError::from)?;

        let fingerprint = request.fingerprint();
        if let Some(hit) = self.cache.get(&fingerprint) {
            debug!(fingerprint = %fingerprint.short(), "Cache hit");
            return Ok(hit);
        }

        let service = Arc::clone(self);
        let (outcome, joined) = self
            .coalescer
            .run(&fingerprint, move || async move { service.execute(request).await })
            .await;
        if joined {
            debug!(fingerprint = %fingerprint.short(), "Answered by coalesced run");
        }
        outcome
    }

    /// Run many requests concurrently; outcomes are in request order
    pub async fn submit_batch(self: &Arc<Self>, requests: Vec<InferenceRequest>) -> Vec<RunOutcome> {
        join_all(requests.into_iter().map(|request| self.submit(request))).await
    }

    async fn execute(&self, request: InferenceRequest) -> RunOutcome {
        let fingerprint = request.fingerprint();
        // A run that finished between the cache check and the claim
        if let Some(hit) = self.cache.get(&fingerprint) {
            return Ok(hit);
        }

        let profile = self.profile(&request.model_id)?;
        let partition = self.partition_for(&profile)?;
        let result = Arc::new(self.executor.run(partition, &profile, &request).await?);

        self.cache.insert(fingerprint, Arc::clone(&result));
        Ok(result)
    }

    // ─────────────────────────────────────────────────────────────
    // Reports
    // ─────────────────────────────────────────────────────────────

    pub fn health(&self) -> HealthReport {
        let view = self.registry.snapshot();
        let profiles: Vec<Arc<ModelProfile>> = self.profiles.read().values().cloned().collect();
        let model_loaded = profiles
            .iter()
            .any(|profile| self.partition_over(&view, profile).is_ok());

        HealthReport {
            cluster_size: view.len(),
            model_loaded,
            cache_size: self.cache.len(),
        }
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            running: self.is_running(),
            active_requests: self.tracker.active_count(),
            cached_responses: self.cache.len(),
            cluster_version: self.registry.snapshot().version,
            timestamp: Utc::now(),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Address this node announces, once started
    pub fn advertised_address(&self) -> Option<String> {
        self.advertised.read().clone()
    }

    // ─────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────

    /// Start discovery, the local node and the maintenance loop
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut life = self.lifecycle.lock().await;
        if life.running {
            return Ok(());
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::ServiceStopped);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        if let Some(local) = &self.local {
            let address = if local.listen {
                let server = Arc::new(
                    NodeServer::new(
                        self.node_id.clone(),
                        Arc::clone(&local.backend),
                        self.config.transport.max_message_bytes,
                    )
                    .with_registry(Arc::clone(&self.registry)),
                );
                let bound = server
                    .start(SocketAddr::from(([0, 0, 0, 0], self.config.node.listen_port)))
                    .await?;
                life.server = Some(server);
                self.config
                    .node
                    .advertise_addr
                    .clone()
                    .unwrap_or_else(|| format!("{}:{}", local.resources.hostname, bound.port()))
            } else {
                self.config
                    .node
                    .advertise_addr
                    .clone()
                    .unwrap_or_else(|| format!("local://{}", self.node_id))
            };
            *self.advertised.write() = Some(address);
            self.announce_local();
        }

        let mut tasks = Vec::new();
        if let Some(provider) = &self.discovery {
            match Arc::clone(provider)
                .start(Arc::clone(&self.registry), shutdown_rx.clone())
                .await
            {
                Ok(handles) => tasks.extend(handles),
                Err(e) => {
                    if let Some(server) = life.server.take() {
                        server.stop().await;
                    }
                    return Err(e);
                }
            }
        }

        tasks.push(tokio::spawn(Arc::clone(self).maintenance_loop(shutdown_rx.clone())));
        tasks.push(tokio::spawn(Arc::clone(self).watch_startup(shutdown_rx)));

        life.tasks = tasks;
        life.shutdown_tx = Some(shutdown_tx);
        life.started_at = Some(Instant::now());
        life.running = true;
        self.accepting.store(true, Ordering::SeqCst);

        info!(
            node_id = %self.node_id,
            discovery = self.discovery.as_ref().map(|d| d.name()).unwrap_or("none"),
            participating = self.local.is_some(),
            models = ?self.models(),
            "Backend service started"
        );
        Ok(())
    }

    /// Stop accepting, drain in-flight runs and tear everything down
    ///
    /// Draining waits for the longer of the shutdown grace and the request
    /// deadline.
    pub async fn stop(&self) -> Result<()> {
        self.accepting.store(false, Ordering::SeqCst);
        self.stopped.store(true, Ordering::SeqCst);

        let mut life = self.lifecycle.lock().await;
        if !life.running {
            return Ok(());
        }
        life.running = false;

        // A run ends by its request deadline at the latest
        let drain = self
            .config
            .service
            .shutdown_grace()
            .max(self.config.pipeline.request_deadline());
        let active = self.tracker.active_count();
        if active > 0 {
            info!(active, drain_ms = drain.as_millis() as u64, "Draining in-flight runs");
        }
        if !self.tracker.wait_idle(drain).await {
            warn!(
                still_active = self.tracker.active_count(),
                "Drain window elapsed with runs in flight"
            );
        }

        if let Some(tx) = life.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        for task in life.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        if let Some(server) = life.server.take() {
            server.stop().await;
        }
        self.transport.close().await;

        let uptime_secs = life
            .started_at
            .take()
            .map(|t| t.elapsed().as_secs())
            .unwrap_or(0);
        info!(
            node_id = %self.node_id,
            uptime_secs,
            completed = self.tracker.total_completed(),
            failed = self.tracker.total_failed(),
            "Backend service stopped"
        );
        Ok(())
    }

    /// Upsert this node's own descriptor
    fn announce_local(&self) {
        let Some(local) = &self.local else {
            return;
        };
        let Some(address) = self.advertised.read().clone() else {
            return;
        };
        self.registry.upsert(NodeDescriptor::new(
            self.node_id.clone(),
            address,
            local.resources.free_memory_bytes,
            local.resources.compute_score,
        ));
    }

    async fn maintenance_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let policy = self.registry.policy();
        let retention = policy.dead_after() * PRUNE_AFTER_DEAD_WINDOWS;
        let mut ticker = interval(policy.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_signalled(&mut shutdown) => break,
            }

            self.announce_local();
            let report = self.registry.sweep();
            if !report.is_empty() {
                debug!(suspected = ?report.suspected, dead = ?report.dead, "Liveness sweep");
            }
            self.registry.prune_dead(retention);
            self.cache.purge_expired();
        }
    }

    /// Warn once if no peer shows up within the startup grace period
    async fn watch_startup(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let grace = self.config.discovery.startup_grace();
        let mut views = self.registry.subscribe();
        let local_id = self.node_id.clone();

        let found = tokio::select! {
            found = tokio::time::timeout(grace, wait_for_peer(&mut views, &local_id)) => {
                found.unwrap_or(false)
            }
            _ = shutdown_signalled(&mut shutdown) => return,
        };

        if found {
            info!(peers = self.registry.snapshot().len(), "Peers discovered");
        } else {
            let err = Error::DiscoveryUnavailable {
                grace_ms: grace.as_millis() as u64,
            };
            warn!(
                code = %err.code().as_str(),
                error = %err,
                "Continuing without peers; discovery keeps searching"
            );
        }
    }
}

/// Resolves true once the view holds a node other than `local_id`
async fn wait_for_peer(views: &mut watch::Receiver<Arc<ClusterView>>, local_id: &str) -> bool {
    loop {
        let found = views
            .borrow_and_update()
            .nodes
            .iter()
            .any(|n| n.id != local_id);
        if found {
            return true;
        }
        if views.changed().await.is_err() {
            return false;
        }
    }
}

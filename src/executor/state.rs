//! Run state tracking
//!
//! Tracks in-flight pipeline runs so the service can report activity and
//! drain cleanly on stop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::watch;
use uuid::Uuid;

use crate::types::Fingerprint;

// ─────────────────────────────────────────────────────────────────
// Active Run
// ─────────────────────────────────────────────────────────────────

/// Progress of one in-flight run
#[derive(Debug, Clone)]
pub struct ActiveRun {
    pub run_id: Uuid,

    pub fingerprint: Fingerprint,

    pub model_id: String,

    pub started_at: Instant,

    /// Layer boundary reached so far
    pub last_completed_layer: u32,

    /// Node currently executing a hop
    pub current_node: Option<String>,

    pub recoveries: u32,
}

impl ActiveRun {
    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

// ─────────────────────────────────────────────────────────────────
// Run Tracker
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Totals {
    completed: u64,
    failed: u64,
    cancelled: u64,
}

/// Tracks all in-flight runs
pub struct RunTracker {
    runs: RwLock<HashMap<Uuid, ActiveRun>>,
    totals: RwLock<Totals>,
    /// Number of in-flight runs, for drain waiters
    active_tx: watch::Sender<usize>,
}

impl RunTracker {
    pub fn new() -> Self {
        let (active_tx, _) = watch::channel(0);
        Self {
            runs: RwLock::new(HashMap::new()),
            totals: RwLock::new(Totals::default()),
            active_tx,
        }
    }

    /// Register a run; it stays active until the guard is finished or dropped
    pub fn begin(self: &Arc<Self>, fingerprint: Fingerprint, model_id: impl Into<String>) -> RunGuard {
        let run_id = Uuid::new_v4();
        let run = ActiveRun {
            run_id,
            fingerprint,
            model_id: model_id.into(),
            started_at: Instant::now(),
            last_completed_layer: 0,
            current_node: None,
            recoveries: 0,
        };

        let count = {
            let mut runs = self.runs.write();
            runs.insert(run_id, run);
            runs.len()
        };
        self.active_tx.send_replace(count);

        RunGuard {
            tracker: Arc::clone(self),
            run_id,
            finished: false,
        }
    }

    fn update(&self, run_id: &Uuid, f: impl FnOnce(&mut ActiveRun)) {
        if let Some(run) = self.runs.write().get_mut(run_id) {
            f(run);
        }
    }

    fn remove(&self, run_id: &Uuid) -> Option<ActiveRun> {
        let (run, count) = {
            let mut runs = self.runs.write();
            let run = runs.remove(run_id);
            (run, runs.len())
        };
        self.active_tx.send_replace(count);
        run
    }

    pub fn get(&self, run_id: &Uuid) -> Option<ActiveRun> {
        self.runs.read().get(run_id).cloned()
    }

    pub fn active_runs(&self) -> Vec<ActiveRun> {
        self.runs.read().values().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.runs.read().len()
    }

    pub fn total_completed(&self) -> u64 {
        self.totals.read().completed
    }

    pub fn total_failed(&self) -> u64 {
        self.totals.read().failed
    }

    /// Runs abandoned before finishing
    pub fn total_cancelled(&self) -> u64 {
        self.totals.read().cancelled
    }

    /// Wait until no run is in flight; false if `timeout` elapsed first
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.active_tx.subscribe();
        let idle = async move {
            loop {
                if *rx.borrow_and_update() == 0 {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(timeout, idle).await.unwrap_or(false)
    }
}

impl Default for RunTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────
// Run Guard
// ─────────────────────────────────────────────────────────────────

/// Handle on one tracked run
///
/// Dropping the guard without finishing counts the run as cancelled.
pub struct RunGuard {
    tracker: Arc<RunTracker>,
    run_id: Uuid,
    finished: bool,
}

impl RunGuard {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// A hop is being sent to `node_id`
    pub fn hop_started(&self, node_id: &str) {
        let node_id = node_id.to_string();
        self.tracker
            .update(&self.run_id, |run| run.current_node = Some(node_id));
    }

    /// Layers up to `layer` are done
    pub fn hop_completed(&self, layer: u32) {
        self.tracker.update(&self.run_id, |run| {
            run.last_completed_layer = layer;
            run.current_node = None;
        });
    }

    pub fn recovered(&self) {
        self.tracker.update(&self.run_id, |run| run.recoveries += 1);
    }

    pub fn snapshot(&self) -> Option<ActiveRun> {
        self.tracker.get(&self.run_id)
    }

    pub fn complete(mut self) {
        self.finish(true);
    }

    pub fn fail(mut self) {
        self.finish(false);
    }

    fn finish(&mut self, success: bool) {
        self.finished = true;
        self.tracker.remove(&self.run_id);
        let mut totals = self.tracker.totals.write();
        if success {
            totals.completed += 1;
        } else {
            totals.failed += 1;
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.tracker.remove(&self.run_id);
            self.tracker.totals.write().cancelled += 1;
        }
    }
}

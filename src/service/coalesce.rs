//! Request coalescing
//!
//! At most one run per fingerprint is in flight. The first caller claims the
//! fingerprint and its run becomes a shared future; later callers join it and
//! all receive the same outcome. The map only holds weak handles, so a run
//! whose callers have all gone away is dropped and can be claimed again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::ServiceError;
use crate::types::{Fingerprint, InferenceResult};

/// Outcome shared by every waiter on a run
pub type RunOutcome = std::result::Result<Arc<InferenceResult>, ServiceError>;

type SharedRun = Shared<BoxFuture<'static, RunOutcome>>;

struct Slot {
    generation: u64,
    run: WeakShared<BoxFuture<'static, RunOutcome>>,
}

#[derive(Default)]
struct Claims {
    slots: HashMap<Fingerprint, Slot>,
    next_generation: u64,
}

/// Claim-or-join registry of in-flight runs
#[derive(Default)]
pub struct Coalescer {
    claims: Mutex<Claims>,
}

impl Coalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `start()` for `fingerprint`, or join the run already in flight
    ///
    /// Returns the outcome and whether this caller joined an existing run.
    ///
    /// ```
    /// use ai4all_cluster::service::Coalescer;
    /// use ai4all_cluster::types::InferenceRequest;
    /// use ai4all_cluster::{ErrorCode, ServiceError};
    ///
    /// # tokio_test::block_on(async {
    /// let coalescer = Coalescer::new();
    /// let fingerprint = InferenceRequest::new("llama", "hi").fingerprint();
    /// let (outcome, joined) = coalescer
    ///     .run(&fingerprint, || async {
    ///         Err(ServiceError::new(ErrorCode::ModelNotFound, "no such model"))
    ///     })
    ///     .await;
    /// assert!(!joined);
    /// assert_eq!(outcome.unwrap_err().code, ErrorCode::ModelNotFound);
    /// assert_eq!(coalescer.in_flight(), 0);
    /// # });
    /// ```
    pub async fn run<F, Fut>(&self, fingerprint: &Fingerprint, start: F) -> (RunOutcome, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RunOutcome> + Send + 'static,
    {
        let (run, generation, joined) = self.claim(fingerprint, start);
        if joined {
            debug!(fingerprint = %fingerprint.short(), "Joined in-flight run");
        }

        let outcome = run.await;
        self.release(fingerprint, generation);
        (outcome, joined)
    }

    fn claim<F, Fut>(&self, fingerprint: &Fingerprint, start: F) -> (SharedRun, u64, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = RunOutcome> + Send + 'static,
    {
        let mut claims = self.claims.lock();
        if let Some(slot) = claims.slots.get(fingerprint) {
            if let Some(run) = slot.run.upgrade() {
                return (run, slot.generation, true);
            }
        }

        let run = start().boxed().shared();
        claims.next_generation += 1;
        let generation = claims.next_generation;
        if let Some(weak) = run.downgrade() {
            claims.slots.insert(
                fingerprint.clone(),
                Slot {
                    generation,
                    run: weak,
                },
            );
        }
        (run, generation, false)
    }

    /// Forget the slot if it still belongs to `generation`
    fn release(&self, fingerprint: &Fingerprint, generation: u64) {
        let mut claims = self.claims.lock();
        if claims
            .slots
            .get(fingerprint)
            .is_some_and(|slot| slot.generation == generation)
        {
            claims.slots.remove(fingerprint);
        }
    }

    /// Runs with at least one live waiter
    pub fn in_flight(&self) -> usize {
        self.claims
            .lock()
            .slots
            .values()
            .filter(|slot| slot.run.upgrade().is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use crate::error::ErrorCode;
    use crate::types::InferenceRequest;

    fn fp(input: &str) -> Fingerprint {
        InferenceRequest::new("m", input).fingerprint()
    }

    fn slow_failure(runs: Arc<AtomicU32>) -> impl Future<Output = RunOutcome> + Send + 'static {
        async move {
            runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err(ServiceError::new(ErrorCode::InsufficientCapacity, "no room"))
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_run() {
        let coalescer = Arc::new(Coalescer::new());
        let runs = Arc::new(AtomicU32::new(0));
        let key = fp("same");

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let coalescer = coalescer.clone();
            let runs = runs.clone();
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                coalescer.run(&key, || slow_failure(runs)).await
            }));
        }

        let mut joined = 0;
        for task in tasks {
            let (outcome, was_joined) = task.await.unwrap();
            assert_eq!(outcome.unwrap_err().code, ErrorCode::InsufficientCapacity);
            joined += was_joined as u32;
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(joined, 4);
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_finished_run_is_not_reused() {
        let coalescer = Coalescer::new();
        let runs = Arc::new(AtomicU32::new(0));
        let key = fp("again");

        coalescer.run(&key, || slow_failure(runs.clone())).await;
        coalescer.run(&key, || slow_failure(runs.clone())).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_joined_caller_survives_first_caller_abort() {
        let coalescer = Arc::new(Coalescer::new());
        let runs = Arc::new(AtomicU32::new(0));
        let key = fp("handover");

        let spawn_caller = || {
            let coalescer = coalescer.clone();
            let runs = runs.clone();
            let key = key.clone();
            tokio::spawn(async move { coalescer.run(&key, || slow_failure(runs)).await })
        };

        let first = spawn_caller();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = spawn_caller();
        tokio::time::sleep(Duration::from_millis(10)).await;
        first.abort();
        assert!(first.await.unwrap_err().is_cancelled());

        let (outcome, joined) = second.await.unwrap();
        assert!(joined);
        assert_eq!(outcome.unwrap_err().code, ErrorCode::InsufficientCapacity);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_run_is_cancelled() {
        let coalescer = Arc::new(Coalescer::new());
        let runs = Arc::new(AtomicU32::new(0));
        let key = fp("abandon");

        let first = {
            let coalescer = coalescer.clone();
            let runs = runs.clone();
            let key = key.clone();
            tokio::spawn(async move { coalescer.run(&key, || slow_failure(runs)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        first.abort();
        let _ = first.await;
        assert_eq!(coalescer.in_flight(), 0);

        // A new caller starts a fresh run instead of joining the dropped one
        let (_, joined) = coalescer.run(&key, || slow_failure(runs.clone())).await;
        assert!(!joined);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}

//! Pipeline execution
//!
//! Drives an activation through the assignments of a partition, one hop at a
//! time. When a hop fails the node is marked dead, the layers not yet done
//! are re-partitioned over the remaining nodes, and the run resumes from the
//! last completed layer boundary with the activation already computed up to
//! it. Recovery is bounded; when it cannot continue the run is aborted and
//! nothing partial is returned. Only faults of the remote node count as hop
//! failures; a local transport that has stopped ends the run as is.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::PipelineSettings;
use crate::error::{Error, Result, TimeoutScope};
use crate::partition::{Assignment, Partition, Partitioner};
use crate::peer::{NodeTransport, PeerRegistry};
use crate::protocol::HopRequest;
use crate::types::{
    CompletionStatus, HopLatency, InferenceRequest, InferenceResult, ModelProfile,
};

use super::{RunGuard, RunTracker};

/// Where a run had got to, readable after the run future is dropped
#[derive(Debug, Default)]
struct Progress {
    last_completed_layer: u32,
    current_node: Option<String>,
}

/// Runs inference requests through partitions
pub struct PipelineExecutor {
    settings: PipelineSettings,
    registry: Arc<PeerRegistry>,
    transport: Arc<dyn NodeTransport>,
    partitioner: Partitioner,
    tracker: Arc<RunTracker>,
}

impl PipelineExecutor {
    pub fn new(
        settings: PipelineSettings,
        registry: Arc<PeerRegistry>,
        transport: Arc<dyn NodeTransport>,
    ) -> Self {
        Self {
            settings,
            registry,
            transport,
            partitioner: Partitioner::new(),
            tracker: Arc::new(RunTracker::new()),
        }
    }

    /// Share a tracker with the owner of this executor
    pub fn with_tracker(mut self, tracker: Arc<RunTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn tracker(&self) -> &Arc<RunTracker> {
        &self.tracker
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Execute `request` over `partition`
    ///
    /// `profile` must be the profile `partition` was computed from; it is
    /// needed to re-partition the remaining layers after a hop failure.
    pub async fn run(
        &self,
        partition: Partition,
        profile: &ModelProfile,
        request: &InferenceRequest,
    ) -> Result<InferenceResult> {
        partition.validate()?;
        if partition.model_id != request.model_id || profile.model_id != request.model_id {
            return Err(Error::InvalidRequest(format!(
                "request for {} cannot run on a partition of {}",
                request.model_id, partition.model_id
            )));
        }

        let guard = self.tracker.begin(request.fingerprint(), &request.model_id);
        let progress = Mutex::new(Progress::default());
        let deadline = self.settings.request_deadline();

        let outcome =
            tokio::time::timeout(deadline, self.execute(partition, profile, request, &guard, &progress))
                .await;

        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                let progress = progress.lock();
                Err(Error::Timeout {
                    scope: TimeoutScope::Request,
                    last_completed_layer: progress.last_completed_layer,
                    node_id: progress.current_node.clone(),
                })
            }
        };

        match &result {
            Ok(_) => guard.complete(),
            Err(e) => {
                warn!(
                    request_id = %request.request_id,
                    model_id = %request.model_id,
                    error = %e.format_for_log(),
                    "Pipeline run failed"
                );
                guard.fail();
            }
        }
        result
    }

    async fn execute(
        &self,
        mut partition: Partition,
        profile: &ModelProfile,
        request: &InferenceRequest,
        guard: &RunGuard,
        progress: &Mutex<Progress>,
    ) -> Result<InferenceResult> {
        let started = Instant::now();
        let fingerprint = request.fingerprint();
        let hop_timeout = self.settings.hop_timeout();

        // Activation at the last completed layer boundary
        let mut activation = request.initial_activation()?;
        let mut completed: Vec<Assignment> = Vec::new();
        let mut hop_latencies = Vec::new();
        let mut excluded: Vec<String> = Vec::new();
        let mut recoveries = 0u32;
        let mut tokens_generated = None;

        debug!(
            fingerprint = %fingerprint.short(),
            view_version = partition.view_version,
            nodes = ?partition.node_ids(),
            "Starting pipeline run"
        );

        loop {
            let mut failure = None;

            for assignment in partition.assignments[completed.len()..].iter() {
                let node_id = assignment.node.id.clone();
                let hop = HopRequest {
                    model_id: request.model_id.clone(),
                    layers: assignment.layers,
                    input: activation.clone(),
                    fingerprint: fingerprint.clone(),
                    hop_index: completed.len() as u32,
                    is_last: assignment.layers.end == partition.total_layers,
                };

                progress.lock().current_node = Some(node_id.clone());
                guard.hop_started(&node_id);
                let hop_started = Instant::now();

                let outcome =
                    tokio::time::timeout(hop_timeout, self.transport.send_hop(&assignment.node, hop))
                        .await;

                let response = match outcome {
                    Err(_) => {
                        return Err(Error::Timeout {
                            scope: TimeoutScope::Hop,
                            last_completed_layer: progress.lock().last_completed_layer,
                            node_id: Some(node_id),
                        });
                    }
                    Ok(Err(e)) if !e.is_peer_fault() => {
                        debug!(node_id = %node_id, error = %e, "Hop not delivered");
                        return Err(e);
                    }
                    Ok(Err(e)) => {
                        failure = Some(Error::hop_failure(&node_id, assignment.layers.start, e.to_string()));
                        break;
                    }
                    Ok(Ok(response)) if !response.is_ok() => {
                        let message = response.error.unwrap_or_else(|| "hop failed".to_string());
                        failure = Some(Error::hop_failure(&node_id, assignment.layers.start, message));
                        break;
                    }
                    Ok(Ok(response)) => response,
                };

                let latency_ms = hop_started.elapsed().as_millis() as u64;
                debug!(
                    fingerprint = %fingerprint.short(),
                    node_id = %node_id,
                    layers = %assignment.layers,
                    latency_ms,
                    node_latency_ms = response.latency_ms,
                    "Hop completed"
                );

                activation = response.output;
                if response.tokens_generated.is_some() {
                    tokens_generated = response.tokens_generated;
                }
                hop_latencies.push(HopLatency {
                    node_id,
                    layers: assignment.layers,
                    latency_ms,
                });
                completed.push(assignment.clone());

                let mut p = progress.lock();
                p.last_completed_layer = assignment.layers.end;
                p.current_node = None;
                guard.hop_completed(assignment.layers.end);
            }

            let Some(failure) = failure else {
                break;
            };

            partition = self.recover(
                failure,
                &partition,
                profile,
                &completed,
                &mut excluded,
                recoveries,
            )?;
            recoveries += 1;
            guard.recovered();
        }

        let status = if recoveries > 0 {
            CompletionStatus::Recovered
        } else {
            CompletionStatus::Completed
        };
        let result = InferenceResult {
            fingerprint,
            model_id: request.model_id.clone(),
            output: activation,
            partition,
            hop_latencies,
            status,
            recoveries,
            tokens_generated,
            processing_time_ms: started.elapsed().as_millis() as u64,
            completed_at: Utc::now(),
        };

        info!(
            fingerprint = %result.fingerprint.short(),
            model_id = %result.model_id,
            hops = result.hop_latencies.len(),
            recoveries,
            processing_time_ms = result.processing_time_ms,
            "Pipeline run completed"
        );
        Ok(result)
    }

    /// Re-partition the layers after the last completed boundary
    fn recover(
        &self,
        failure: Error,
        partition: &Partition,
        profile: &ModelProfile,
        completed: &[Assignment],
        excluded: &mut Vec<String>,
        recoveries: u32,
    ) -> Result<Partition> {
        let boundary = completed.last().map(|a| a.layers.end).unwrap_or(0);
        let failed_node = failure.failed_node().map(str::to_string);

        warn!(
            node_id = ?failed_node,
            last_completed_layer = boundary,
            error = %failure,
            "Hop failed, recovering"
        );

        if let Some(node_id) = &failed_node {
            self.registry.mark_dead(node_id);
            if !excluded.contains(node_id) {
                excluded.push(node_id.clone());
            }
        }

        if recoveries >= self.settings.max_recoveries {
            return Err(Error::PipelineAborted {
                last_completed_layer: boundary,
                failed_node,
                reason: format!(
                    "recovery limit of {} reached: {}",
                    self.settings.max_recoveries, failure
                ),
            });
        }

        let view = self.registry.snapshot().without(excluded);
        let rest = self
            .partitioner
            .compute_from(&view, profile, boundary)
            .map_err(|e| Error::PipelineAborted {
                last_completed_layer: boundary,
                failed_node: failed_node.clone(),
                reason: format!(
                    "no partition covers layers {}..{}: {}",
                    boundary, partition.total_layers, e
                ),
            })?;

        info!(
            from_layer = boundary,
            view_version = rest.view_version,
            nodes = ?rest.node_ids(),
            "Resuming on new partition"
        );
        Ok(Partition::stitched(completed.to_vec(), rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::backend::MockLayerBackend;
    use crate::peer::{InMemoryTransport, LivenessPolicy};
    use crate::service::BatchingTransport;
    use crate::types::NodeDescriptor;

    const GB: u64 = 1 << 30;

    struct Cluster {
        registry: Arc<PeerRegistry>,
        transport: Arc<InMemoryTransport>,
        profile: ModelProfile,
    }

    fn cluster(nodes: &[(&str, u64)]) -> Cluster {
        let registry = Arc::new(PeerRegistry::new(LivenessPolicy::new(Duration::from_secs(1), 3)));
        let transport = Arc::new(InMemoryTransport::new());
        for (id, mem) in nodes {
            registry.upsert(NodeDescriptor::new(*id, format!("mem://{}", id), *mem, 1.0));
            transport.add_node(*id, Arc::new(MockLayerBackend::new()));
        }
        Cluster {
            registry,
            transport,
            profile: ModelProfile::uniform("llama", 24, GB / 2),
        }
    }

    fn executor(c: &Cluster, settings: PipelineSettings) -> PipelineExecutor {
        PipelineExecutor::new(settings, c.registry.clone(), c.transport.clone())
    }

    fn partition(c: &Cluster) -> Partition {
        Partitioner::new()
            .compute(&c.registry.snapshot(), &c.profile)
            .unwrap()
    }

    /// Output the mock engine produces for a full pass over `ranges`
    fn expected_suffix(ranges: &[(u32, u32)]) -> String {
        ranges.iter().map(|(s, e)| format!("[{}..{})", s, e)).collect()
    }

    #[tokio::test]
    async fn test_run_visits_every_assignment() {
        let c = cluster(&[("a", 8 * GB), ("b", 4 * GB)]);
        let exec = executor(&c, PipelineSettings::default());
        let p = partition(&c);
        let request = InferenceRequest::new("llama", "hello");

        let result = exec.run(p.clone(), &c.profile, &request).await.unwrap();

        assert_eq!(result.status, CompletionStatus::Completed);
        assert_eq!(result.recoveries, 0);
        assert_eq!(result.hop_latencies.len(), p.assignments.len());
        assert_eq!(result.partition, p);
        assert_eq!(result.tokens_generated, Some(16));
        let ranges: Vec<(u32, u32)> = p
            .assignments
            .iter()
            .map(|a| (a.layers.start, a.layers.end))
            .collect();
        assert!(result.output_text().ends_with(&expected_suffix(&ranges)));
        assert_eq!(exec.tracker().total_completed(), 1);
    }

    #[tokio::test]
    async fn test_mid_ring_failure_resumes_from_boundary() {
        let c = cluster(&[("a", 8 * GB), ("b", 8 * GB), ("c", 8 * GB)]);
        let exec = executor(&c, PipelineSettings::default());
        let p = partition(&c);
        let second = p.assignments[1].clone();
        c.transport.take_down(&second.node.id);

        let request = InferenceRequest::new("llama", "hello");
        let result = exec.run(p.clone(), &c.profile, &request).await.unwrap();

        assert_eq!(result.status, CompletionStatus::Recovered);
        assert_eq!(result.recoveries, 1);
        result.partition.validate().unwrap();
        assert!(!result.partition.uses_node(&second.node.id));
        // The first hop is kept, not re-run
        assert_eq!(result.partition.assignments[0], p.assignments[0]);

        // Every layer ran exactly once, in order
        let mut ranges = Vec::new();
        for a in &result.partition.assignments {
            ranges.push((a.layers.start, a.layers.end));
        }
        assert!(result.output_text().ends_with(&expected_suffix(&ranges)));
        assert_eq!(result.output_text().matches("[0..").count(), 1);

        // The failed node is no longer in the cluster view
        assert!(c.registry.snapshot().get(&second.node.id).is_none());
    }

    #[tokio::test]
    async fn test_no_remaining_capacity_aborts() {
        let c = cluster(&[("a", 8 * GB), ("b", 4 * GB)]);
        let exec = executor(&c, PipelineSettings::default());
        let p = partition(&c);
        let first = p.assignments[0].node.clone();
        let last = p.assignments.last().unwrap().clone();
        c.transport.take_down(&last.node.id);
        // The surviving node can no longer hold the tail
        c.registry
            .upsert(NodeDescriptor::new(first.id.clone(), first.address.clone(), 1, 1.0));

        let request = InferenceRequest::new("llama", "hello");
        let err = exec.run(p.clone(), &c.profile, &request).await.unwrap_err();

        match err {
            Error::PipelineAborted {
                last_completed_layer,
                failed_node,
                ..
            } => {
                assert_eq!(last_completed_layer, last.layers.start);
                assert_eq!(failed_node.as_deref(), Some(last.node.id.as_str()));
            }
            other => panic!("expected PipelineAborted, got {other}"),
        }
        assert_eq!(exec.tracker().total_failed(), 1);
    }

    #[tokio::test]
    async fn test_recovery_limit() {
        let c = cluster(&[("a", 8 * GB), ("b", 8 * GB), ("c", 8 * GB)]);
        let settings = PipelineSettings {
            max_recoveries: 0,
            ..PipelineSettings::default()
        };
        let exec = executor(&c, settings);
        let p = partition(&c);
        c.transport.take_down(&p.assignments[0].node.id);

        let err = exec
            .run(p, &c.profile, &InferenceRequest::new("llama", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PipelineAborted { last_completed_layer: 0, .. }));
    }

    #[tokio::test]
    async fn test_hop_timeout_is_surfaced() {
        let c = cluster(&[("a", 16 * GB)]);
        let settings = PipelineSettings {
            hop_timeout_ms: 20,
            ..PipelineSettings::default()
        };
        let exec = executor(&c, settings);
        c.transport.set_delay("a", Duration::from_millis(500));

        let err = exec
            .run(partition(&c), &c.profile, &InferenceRequest::new("llama", "x"))
            .await
            .unwrap_err();
        match err {
            Error::Timeout { scope, node_id, .. } => {
                assert_eq!(scope, TimeoutScope::Hop);
                assert_eq!(node_id.as_deref(), Some("a"));
            }
            other => panic!("expected hop timeout, got {other}"),
        }
        // Timeouts do not mark the node dead
        assert!(c.registry.snapshot().get("a").is_some());
    }

    #[tokio::test]
    async fn test_request_deadline() {
        let c = cluster(&[("a", 16 * GB)]);
        let settings = PipelineSettings {
            hop_timeout_ms: 10_000,
            request_deadline_ms: 20,
            ..PipelineSettings::default()
        };
        let exec = executor(&c, settings);
        c.transport.set_delay("a", Duration::from_millis(500));

        let err = exec
            .run(partition(&c), &c.profile, &InferenceRequest::new("llama", "x"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Timeout {
                scope: TimeoutScope::Request,
                last_completed_layer: 0,
                ..
            }
        ));
        assert_eq!(exec.tracker().active_count(), 0);
    }

    #[tokio::test]
    async fn test_stopped_transport_does_not_blame_peers() {
        let c = cluster(&[("a", 16 * GB), ("b", 16 * GB)]);
        let batching = Arc::new(BatchingTransport::new(
            c.transport.clone(),
            Duration::from_millis(5),
            8,
            1,
        ));
        batching.close().await;
        let exec = PipelineExecutor::new(PipelineSettings::default(), c.registry.clone(), batching);

        let err = exec
            .run(partition(&c), &c.profile, &InferenceRequest::new("llama", "x"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ServiceStopped));
        assert_eq!(c.registry.snapshot().len(), 2);
        assert_eq!(c.transport.total_hops(), 0);
        assert_eq!(exec.tracker().active_count(), 0);
    }

    #[tokio::test]
    async fn test_model_mismatch_rejected() {
        let c = cluster(&[("a", 16 * GB)]);
        let exec = executor(&c, PipelineSettings::default());
        let err = exec
            .run(partition(&c), &c.profile, &InferenceRequest::new("other", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }
}

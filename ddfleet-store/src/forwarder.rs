// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cooperative worker draining partition streams towards the telemetry
//! sender. Forwarding of a partition is controlled by two independent
//! sources: the campaign condition and remote jobs with an optional end
//! time. A partition is eligible while any source is active.

use crate::manager::StreamManager;
use crate::stream::StreamRecord;
use async_trait::async_trait;
use ddfleet_campaign::collection_scheme::PartitionId;
use ddfleet_common::ids::SyncId;
use ddfleet_common::metrics::{names, Metrics};
use ddfleet_common::signal::Signal;
use ddfleet_common::time::Timestamp;
use ddfleet_common::transport::SendError;
use ddfleet_common::worker::Worker;
use ddfleet_common::MutexExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where forwarded records go; implemented by the telemetry sender's
/// persisted-data path.
#[async_trait]
pub trait ForwardTarget: Send + Sync {
    async fn forward_record(
        &self,
        campaign_sync_id: &str,
        record: &StreamRecord,
    ) -> Result<(), SendError>;
}

#[derive(Debug, Clone, Default)]
struct SourceState {
    condition: bool,
    job: Option<JobState>,
}

#[derive(Debug, Clone)]
struct JobState {
    job_id: String,
    end_time_ms: Option<Timestamp>,
}

impl SourceState {
    fn active(&self) -> bool {
        self.condition || self.job.is_some()
    }
}

#[derive(Debug)]
struct Shared {
    states: Mutex<HashMap<(SyncId, PartitionId), SourceState>>,
    wake: Signal,
    job_complete_tx: Option<mpsc::Sender<String>>,
}

impl Shared {
    fn complete_job(&self, key: &(SyncId, PartitionId), job_id: String) {
        {
            let mut states = self.states.lock_or_panic();
            if let Some(state) = states.get_mut(key) {
                state.job = None;
                if !state.active() {
                    states.remove(key);
                }
            }
        }
        info!(component = "forwarder", job = %job_id, "job forwarding complete");
        if let Some(tx) = &self.job_complete_tx {
            let _ = tx.try_send(job_id);
        }
    }
}

/// Cloneable handle through which campaigns and remote jobs toggle
/// forwarding. Cancelling one source never affects the other.
#[derive(Debug, Clone)]
pub struct ForwardController {
    shared: Arc<Shared>,
}

impl ForwardController {
    pub fn begin_condition_forward(&self, campaign_sync_id: &str, partition_id: PartitionId) {
        self.shared
            .states
            .lock_or_panic()
            .entry((campaign_sync_id.to_string(), partition_id))
            .or_default()
            .condition = true;
        self.shared.wake.notify();
    }

    pub fn cancel_condition_forward(&self, campaign_sync_id: &str, partition_id: PartitionId) {
        let mut states = self.shared.states.lock_or_panic();
        let key = (campaign_sync_id.to_string(), partition_id);
        if let Some(state) = states.get_mut(&key) {
            state.condition = false;
            if !state.active() {
                states.remove(&key);
            }
        }
    }

    pub fn begin_job_forward(
        &self,
        campaign_sync_id: &str,
        partition_id: PartitionId,
        job_id: &str,
        end_time_ms: Option<Timestamp>,
    ) {
        self.shared
            .states
            .lock_or_panic()
            .entry((campaign_sync_id.to_string(), partition_id))
            .or_default()
            .job = Some(JobState {
            job_id: job_id.to_string(),
            end_time_ms,
        });
        info!(component = "forwarder", campaign = %campaign_sync_id, partition = partition_id,
            job = %job_id, "job forwarding started");
        self.shared.wake.notify();
    }

    pub fn cancel_job(&self, job_id: &str) {
        let mut states = self.shared.states.lock_or_panic();
        for state in states.values_mut() {
            if state.job.as_ref().map(|j| j.job_id == job_id).unwrap_or(false) {
                state.job = None;
            }
        }
        states.retain(|_, state| state.active());
    }

    /// Nudges the worker, e.g. after new data was appended.
    pub fn wake(&self) {
        self.shared.wake.notify();
    }
}

const IDLE_WAIT: Duration = Duration::from_millis(500);
const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

pub struct StreamForwarder {
    metrics: Arc<dyn Metrics>,
    manager: Arc<StreamManager>,
    target: Arc<dyn ForwardTarget>,
    shared: Arc<Shared>,
    cancellation_token: CancellationToken,
}

impl StreamForwarder {
    pub fn new(
        metrics: Arc<dyn Metrics>,
        manager: Arc<StreamManager>,
        target: Arc<dyn ForwardTarget>,
        job_complete_tx: Option<mpsc::Sender<String>>,
        cancellation_token: CancellationToken,
    ) -> Self {
        StreamForwarder {
            metrics,
            manager,
            target,
            shared: Arc::new(Shared {
                states: Mutex::new(HashMap::new()),
                wake: Signal::new(),
                job_complete_tx,
            }),
            cancellation_token,
        }
    }

    pub fn controller(&self) -> ForwardController {
        ForwardController {
            shared: self.shared.clone(),
        }
    }

    /// One pass over every eligible partition. Returns (forwarded_any,
    /// failed_any).
    async fn forward_pass(&self) -> (bool, bool) {
        let snapshot: Vec<((SyncId, PartitionId), SourceState)> = self
            .shared
            .states
            .lock_or_panic()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut forwarded = false;
        let mut failed = false;

        for (key, state) in snapshot {
            if !state.active() || self.cancellation_token.is_cancelled() {
                continue;
            }
            let (campaign, partition) = &key;
            let record = match self.manager.read_from_stream(campaign, *partition) {
                Ok(Some(record)) => record,
                Ok(None) => {
                    // An empty stream completes any job-driven request.
                    if let Some(job) = state.job {
                        self.shared.complete_job(&key, job.job_id);
                    }
                    continue;
                }
                Err(e) => {
                    debug!(component = "forwarder", campaign = %campaign, partition = partition,
                        error = %e, "stream not readable");
                    continue;
                }
            };

            let past_job_end = state
                .job
                .as_ref()
                .and_then(|j| j.end_time_ms)
                .map(|end| record.trigger_time_ms > end)
                .unwrap_or(false);
            if past_job_end {
                // The job never reads beyond its end time. The record stays
                // (not checkpointed) for condition-driven forwarding.
                if let Some(job) = state.job.clone() {
                    self.shared.complete_job(&key, job.job_id);
                }
                if !state.condition {
                    continue;
                }
            }

            match self.target.forward_record(campaign, &record).await {
                Ok(()) => {
                    if let Err(e) = self.manager.checkpoint(campaign, *partition, record.seq) {
                        warn!(component = "forwarder", campaign = %campaign, partition = partition,
                            error = %e, "checkpoint failed; record will be redelivered");
                    }
                    self.metrics.increment(names::STREAM_RECORDS_FORWARDED);
                    forwarded = true;
                }
                Err(e) => {
                    debug!(component = "forwarder", campaign = %campaign, partition = partition,
                        error = %e, "forward failed, will retry the same record");
                    failed = true;
                }
            }
        }
        (forwarded, failed)
    }
}

#[async_trait]
impl Worker for StreamForwarder {
    async fn run(&mut self) {
        let mut backoff = BACKOFF_BASE;
        loop {
            if self.cancellation_token.is_cancelled() {
                return;
            }
            let (forwarded, failed) = self.forward_pass().await;
            let wait_for = if failed {
                let wait = backoff;
                backoff = (backoff * 2).min(BACKOFF_MAX);
                Some(wait)
            } else if forwarded {
                // More data may be pending; loop straight away.
                backoff = BACKOFF_BASE;
                None
            } else {
                backoff = BACKOFF_BASE;
                Some(IDLE_WAIT)
            };
            if let Some(wait_for) = wait_for {
                tokio::select! {
                    _ = self.cancellation_token.cancelled() => return,
                    _ = self.shared.wake.wait(wait_for) => {}
                }
            }
        }
    }
}

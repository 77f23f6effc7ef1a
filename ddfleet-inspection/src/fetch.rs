// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Execution of the fetch matrix: periodic requests run on their own
//! schedule, condition-driven requests fire when the inspection engine
//! signals them. Fetched values re-enter the pipeline as ordinary samples.

use async_trait::async_trait;
use ddfleet_campaign::collection_scheme::{FetchSchedule, LiteralArg};
use ddfleet_campaign::fetch_matrix::{FetchMatrix, FetchRequest};
use ddfleet_common::ids::SignalId;
use ddfleet_common::time::{Clock, Timestamp};
use ddfleet_common::value::SampleValue;
use ddfleet_common::worker::Worker;
use crate::types::SignalSample;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Obtains a fresh sample of a signal that is not push-based (e.g. an OBD
/// query or a custom interface read).
pub trait FetchFunction: Send + Sync {
    fn fetch(&self, signal_id: SignalId, args: &[LiteralArg]) -> Option<SampleValue>;
}

struct PeriodicState {
    request: FetchRequest,
    next_due_ms: Timestamp,
    executions: u64,
    /// When set, the execution counter clears at this time.
    reset_at_ms: Option<Timestamp>,
}

pub struct FetchExecutor {
    clock: Arc<dyn Clock>,
    fetch_rx: watch::Receiver<Arc<FetchMatrix>>,
    functions: HashMap<String, Box<dyn FetchFunction>>,
    sample_tx: mpsc::Sender<SignalSample>,
    trigger_rx: mpsc::Receiver<String>,
    cancellation_token: CancellationToken,
    periodic: Vec<PeriodicState>,
}

impl FetchExecutor {
    pub fn new(
        clock: Arc<dyn Clock>,
        fetch_rx: watch::Receiver<Arc<FetchMatrix>>,
        sample_tx: mpsc::Sender<SignalSample>,
        trigger_rx: mpsc::Receiver<String>,
        cancellation_token: CancellationToken,
    ) -> Self {
        FetchExecutor {
            clock,
            fetch_rx,
            functions: HashMap::new(),
            sample_tx,
            trigger_rx,
            cancellation_token,
            periodic: Vec::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, function: Box<dyn FetchFunction>) {
        self.functions.insert(name.into(), function);
    }

    fn apply_matrix(&mut self, matrix: &FetchMatrix, now: Timestamp) {
        self.periodic = matrix
            .requests
            .values()
            .filter(|r| matches!(r.schedule, FetchSchedule::Periodic { .. }))
            .map(|r| PeriodicState {
                request: r.clone(),
                next_due_ms: now,
                executions: 0,
                reset_at_ms: None,
            })
            .collect();
        // Deterministic execution order regardless of map iteration.
        self.periodic
            .sort_by(|a, b| a.request.fetch_request_id.cmp(&b.request.fetch_request_id));
        debug!(
            component = "fetch",
            periodic = self.periodic.len(),
            "applied fetch matrix"
        );
    }

    fn execute(&self, request: &FetchRequest, now: Timestamp) {
        for action in &request.actions {
            let Some(function) = self.functions.get(&action.function_name) else {
                warn!(
                    component = "fetch",
                    function = %action.function_name,
                    "fetch function is not registered"
                );
                continue;
            };
            let Some(value) = function.fetch(request.signal_id, &action.literal_args) else {
                continue;
            };
            // Fetched values flow back in as if they were sampled.
            if self
                .sample_tx
                .try_send(SignalSample {
                    signal_id: request.signal_id,
                    timestamp_ms: now,
                    value,
                })
                .is_err()
            {
                warn!(component = "fetch", signal = %request.signal_id, "sample queue full, fetched value dropped");
            }
        }
    }

    fn run_due_periodic(&mut self, now: Timestamp) {
        let mut due = Vec::new();
        for state in &mut self.periodic {
            let FetchSchedule::Periodic {
                max_executions,
                period_ms,
                reset_interval_ms,
            } = state.request.schedule
            else {
                continue;
            };
            if let Some(reset_at) = state.reset_at_ms {
                if now >= reset_at {
                    state.executions = 0;
                    state.reset_at_ms = None;
                }
            }
            if state.next_due_ms > now {
                continue;
            }
            if let Some(max) = max_executions {
                if state.executions >= max {
                    // Exhausted; wake again when the counter resets.
                    if reset_interval_ms > 0 && state.reset_at_ms.is_none() {
                        state.reset_at_ms = Some(now + reset_interval_ms);
                    }
                    state.next_due_ms = state.reset_at_ms.unwrap_or(u64::MAX);
                    continue;
                }
            }
            state.executions += 1;
            state.next_due_ms = now + period_ms;
            due.push(state.request.clone());
        }
        for request in due {
            self.execute(&request, now);
        }
    }

    fn next_deadline(&self) -> Option<Timestamp> {
        self.periodic.iter().map(|s| s.next_due_ms).min()
    }
}

#[async_trait]
impl Worker for FetchExecutor {
    async fn run(&mut self) {
        loop {
            if self.cancellation_token.is_cancelled() {
                return;
            }
            if self.fetch_rx.has_changed().unwrap_or(false) {
                let matrix = self.fetch_rx.borrow_and_update().clone();
                let now = self.clock.monotonic_ms();
                self.apply_matrix(&matrix, now);
            }

            let sleep_ms = self
                .next_deadline()
                .map(|due| due.saturating_sub(self.clock.monotonic_ms()))
                .unwrap_or(1_000)
                .min(1_000);
            tokio::select! {
                _ = self.cancellation_token.cancelled() => return,
                changed = self.fetch_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
                triggered = self.trigger_rx.recv() => {
                    let Some(request_id) = triggered else { return };
                    let now = self.clock.monotonic_ms();
                    let request = self
                        .fetch_rx
                        .borrow()
                        .requests
                        .get(&request_id)
                        .cloned();
                    match request {
                        Some(request) => self.execute(&request, now),
                        None => debug!(component = "fetch", fetch_request = %request_id, "triggered request no longer exists"),
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
            }

            let now = self.clock.monotonic_ms();
            self.run_due_periodic(now);
        }
    }
}

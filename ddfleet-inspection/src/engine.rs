// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Single-threaded inspection loop: consumes decoded samples from a bounded
//! queue, owns every ring buffer exclusively, evaluates the active
//! conditions and emits triggered data windows. Matrix swaps are applied at
//! the top of the loop; no suspension happens mid-evaluation.

use crate::buffers::{AppendOutcome, SignalHistoryBuffer};
use crate::custom_function::{ConditionEndContext, CustomFunctionRegistry};
use crate::eval::{evaluate, EvalContext};
use crate::output::TriggerQueue;
use crate::raw_buffer::{RawBufferConfig, RawBufferManager, UsageStage};
use crate::types::{CollectedSignal, DtcInfo, SignalSample, TriggerMetadata, TriggeredData};
use async_trait::async_trait;
use ddfleet_campaign::collection_scheme::FetchSchedule;
use ddfleet_campaign::condition::{ConditionArena, ExpressionNode};
use ddfleet_campaign::fetch_matrix::FetchMatrix;
use ddfleet_campaign::inspection_matrix::InspectionMatrix;
use ddfleet_common::ids::SignalId;
use ddfleet_common::metrics::{names, Metrics};
use ddfleet_common::time::{Clock, Timestamp};
use ddfleet_common::value::SampleValue;
use ddfleet_common::worker::Worker;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Source of the currently active diagnostic trouble codes. One snapshot is
/// taken per evaluation pass and shared by every trigger emitted in it.
pub trait DtcProvider: Send + Sync {
    fn active_dtcs(&self) -> Option<DtcInfo>;
}

#[derive(Debug, Clone)]
pub struct InspectionEngineConfig {
    /// Upper bound between two evaluation passes when no samples arrive.
    pub tick_interval: Duration,
    /// Samples drained per loop iteration before evaluating.
    pub max_batch: usize,
    /// Arena limits applied together with the per-scheme overrides.
    pub raw_buffer: RawBufferConfig,
}

impl Default for InspectionEngineConfig {
    fn default() -> Self {
        InspectionEngineConfig {
            tick_interval: Duration::from_millis(100),
            max_batch: 256,
            raw_buffer: RawBufferConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ConditionState {
    activation_ms: Timestamp,
    last_trigger_ms: Option<Timestamp>,
    previous_result: bool,
}

struct FetchConditionState {
    request_id: String,
    condition: Arc<ConditionArena>,
    rising_edge_only: bool,
    previous_result: bool,
}

pub struct InspectionEngine {
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn Metrics>,
    config: InspectionEngineConfig,
    input: mpsc::Receiver<SignalSample>,
    matrix_rx: watch::Receiver<Arc<InspectionMatrix>>,
    fetch_rx: watch::Receiver<Arc<FetchMatrix>>,
    output: Arc<TriggerQueue>,
    raw_buffer: Arc<RawBufferManager>,
    functions: CustomFunctionRegistry,
    dtc_provider: Option<Arc<dyn DtcProvider>>,
    /// Conditional fetch firings are handed to the fetch executor.
    fetch_trigger_tx: Option<mpsc::Sender<String>>,
    cancellation_token: CancellationToken,

    matrix: Arc<InspectionMatrix>,
    buffers: HashMap<SignalId, SignalHistoryBuffer>,
    conditions: Vec<ConditionState>,
    signal_to_conditions: HashMap<SignalId, Vec<usize>>,
    candidates: Vec<bool>,
    fetch_conditions: Vec<FetchConditionState>,
}

#[allow(clippy::too_many_arguments)]
impl InspectionEngine {
    pub fn new(
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn Metrics>,
        config: InspectionEngineConfig,
        input: mpsc::Receiver<SignalSample>,
        matrix_rx: watch::Receiver<Arc<InspectionMatrix>>,
        fetch_rx: watch::Receiver<Arc<FetchMatrix>>,
        output: Arc<TriggerQueue>,
        raw_buffer: Arc<RawBufferManager>,
        functions: CustomFunctionRegistry,
        dtc_provider: Option<Arc<dyn DtcProvider>>,
        fetch_trigger_tx: Option<mpsc::Sender<String>>,
        cancellation_token: CancellationToken,
    ) -> Self {
        InspectionEngine {
            clock,
            metrics,
            config,
            input,
            matrix_rx,
            fetch_rx,
            output,
            raw_buffer,
            functions,
            dtc_provider,
            fetch_trigger_tx,
            cancellation_token,
            matrix: Arc::new(InspectionMatrix::default()),
            buffers: HashMap::new(),
            conditions: Vec::new(),
            signal_to_conditions: HashMap::new(),
            candidates: Vec::new(),
            fetch_conditions: Vec::new(),
        }
    }

    /// Rebuilds the ring-buffer layout for a new matrix. Buffers of signals
    /// whose size and window are unchanged keep their accumulated state;
    /// everything else is discarded.
    fn apply_matrix(&mut self, matrix: Arc<InspectionMatrix>, now: Timestamp) {
        // Custom function state belongs to the retiring conditions.
        for (idx, meta) in self.matrix.conditions.iter().enumerate() {
            let base = (idx as u64) << 32;
            for (node, _) in meta
                .condition
                .nodes()
                .iter()
                .enumerate()
                .filter(|(_, n)| matches!(n, ExpressionNode::Call { .. }))
            {
                self.functions.cleanup(base | node as u64);
            }
        }

        let mut old_buffers = std::mem::take(&mut self.buffers);
        for (signal_id, spec) in &matrix.buffers {
            let buffer = match old_buffers.remove(signal_id) {
                Some(mut old)
                    if old.compatible_with(
                        spec.sample_buffer_size as usize,
                        spec.fixed_window_ms,
                    ) =>
                {
                    old.set_min_sample_interval(spec.min_sample_interval_ms);
                    old
                }
                _ => SignalHistoryBuffer::new(
                    spec.sample_buffer_size as usize,
                    spec.min_sample_interval_ms,
                    spec.fixed_window_ms,
                ),
            };
            self.buffers.insert(*signal_id, buffer);
        }
        // Whatever remains belongs to retired signals; release the history
        // references of their raw values.
        for buffer in old_buffers.values() {
            for value in buffer.raw_handles() {
                if let SampleValue::Raw(handle) = value {
                    self.raw_buffer
                        .decrease_usage(handle, UsageStage::InHistoryBuffer);
                }
            }
        }

        self.conditions = matrix
            .conditions
            .iter()
            .map(|_| ConditionState {
                activation_ms: now,
                last_trigger_ms: None,
                previous_result: false,
            })
            .collect();
        self.candidates = vec![true; matrix.conditions.len()];
        self.signal_to_conditions.clear();
        for (idx, meta) in matrix.conditions.iter().enumerate() {
            for signal in meta.condition.referenced_signals() {
                self.signal_to_conditions.entry(signal).or_default().push(idx);
            }
        }

        let mut raw_config = self.config.raw_buffer.clone();
        raw_config.overrides = matrix.raw_buffer_overrides.clone();
        self.raw_buffer.reconfigure(raw_config);

        debug!(
            component = "inspection",
            conditions = matrix.conditions.len(),
            signals = matrix.buffers.len(),
            "applied new inspection matrix"
        );
        self.matrix = matrix;
    }

    fn apply_fetch_matrix(&mut self, matrix: Arc<FetchMatrix>) {
        self.fetch_conditions = matrix
            .requests
            .values()
            .filter_map(|request| match &request.schedule {
                FetchSchedule::Conditional {
                    condition,
                    trigger_only_on_rising_edge,
                } => Some(FetchConditionState {
                    request_id: request.fetch_request_id.clone(),
                    condition: condition.clone(),
                    rising_edge_only: *trigger_only_on_rising_edge,
                    previous_result: false,
                }),
                FetchSchedule::Periodic { .. } => None,
            })
            .collect();
    }

    fn handle_sample(&mut self, sample: SignalSample) {
        let Some(buffer) = self.buffers.get_mut(&sample.signal_id) else {
            // Not required by any enabled scheme; drop, releasing any raw
            // storage the adapter already claimed.
            self.metrics.increment(names::SAMPLES_DROPPED);
            if let SampleValue::Raw(handle) = sample.value {
                self.raw_buffer
                    .decrease_usage(handle, UsageStage::InHistoryBuffer);
            }
            return;
        };
        match buffer.append(sample.timestamp_ms, sample.value) {
            AppendOutcome::TooFrequent => {
                if let SampleValue::Raw(handle) = sample.value {
                    self.raw_buffer
                        .decrease_usage(handle, UsageStage::InHistoryBuffer);
                }
            }
            AppendOutcome::Stored { evicted } => {
                if let Some(SampleValue::Raw(handle)) = evicted {
                    self.raw_buffer
                        .decrease_usage(handle, UsageStage::InHistoryBuffer);
                }
                if let Some(indices) = self.signal_to_conditions.get(&sample.signal_id) {
                    for idx in indices {
                        self.candidates[*idx] = true;
                    }
                }
            }
        }
    }

    fn mark_all_candidates(&mut self) {
        for candidate in &mut self.candidates {
            *candidate = true;
        }
    }

    fn evaluate_candidates(&mut self, now: Timestamp) {
        // One DTC snapshot per pass, shared by reference.
        let mut tick_dtcs: Option<Option<Arc<DtcInfo>>> = None;
        for idx in 0..self.conditions.len() {
            if !std::mem::take(&mut self.candidates[idx]) {
                continue;
            }
            let meta = &self.matrix.conditions[idx];
            let state = self.conditions[idx];

            if let Some(last) = state.last_trigger_ms {
                if now < last + meta.after_duration_ms {
                    // Not eligible yet; stays a candidate for the next pass.
                    self.candidates[idx] = true;
                    continue;
                }
            }

            let matrix = self.matrix.clone();
            let meta = &matrix.conditions[idx];
            let mut ctx = EvalContext {
                buffers: &self.buffers,
                raw_buffer: &self.raw_buffer,
                functions: &mut self.functions,
                invocation_base: (idx as u64) << 32,
            };
            let result = match evaluate(&mut ctx, &meta.condition, meta.condition.root()) {
                Ok(value) => value.truthy(),
                Err(e) => {
                    trace!(component = "inspection", campaign = %meta.campaign_sync_id, error = %e,
                        "condition evaluation failed, treating as false");
                    false
                }
            };

            let state = &mut self.conditions[idx];
            let skip_for_edge = meta.trigger_only_on_rising_edge && state.previous_result;
            let skip_for_interval = result
                && state
                    .last_trigger_ms
                    .map(|last| now.saturating_sub(last) < meta.minimum_publish_interval_ms)
                    .unwrap_or(false);
            if !result || skip_for_edge || skip_for_interval {
                state.previous_result = result;
                continue;
            }
            state.previous_result = result;
            state.last_trigger_ms = Some(now);
            let activation_ms = state.activation_ms;

            let data = self.build_trigger(idx, &matrix, activation_ms, now, &mut tick_dtcs);
            trace!(
                component = "inspection",
                campaign = %data.metadata.campaign_sync_id,
                event_id = data.event_id,
                signals = data.signals.len(),
                "condition fired"
            );
            // Push never blocks; overflow already dropped and counted the
            // lowest-priority entry.
            let _ = self.output.push(Arc::new(data));
        }

        self.evaluate_fetch_conditions();
    }

    fn build_trigger(
        &mut self,
        idx: usize,
        matrix: &InspectionMatrix,
        activation_ms: Timestamp,
        now: Timestamp,
        tick_dtcs: &mut Option<Option<Arc<DtcInfo>>>,
    ) -> TriggeredData {
        let meta = &matrix.conditions[idx];
        let mut signals = Vec::new();
        let mut collected_ids = HashSet::new();
        for spec in &meta.signals {
            if spec.condition_only {
                continue;
            }
            collected_ids.insert(spec.signal_id);
            let Some(buffer) = self.buffers.get(&spec.signal_id) else {
                continue;
            };
            for (timestamp, value) in
                buffer.samples_since(activation_ms, spec.sample_buffer_size as usize)
            {
                if let SampleValue::Raw(handle) = value {
                    self.raw_buffer
                        .increase_usage(handle, UsageStage::SelectedForUpload);
                }
                signals.push(CollectedSignal {
                    signal_id: spec.signal_id,
                    receive_time_ms: timestamp,
                    value,
                });
            }
        }

        let mut extra = Vec::new();
        self.functions.condition_end(&mut ConditionEndContext {
            collected_signal_ids: &collected_ids,
            timestamp: now,
            extra_signals: &mut extra,
        });
        signals.extend(extra);

        let dtc_info = if meta.include_active_dtcs {
            tick_dtcs
                .get_or_insert_with(|| {
                    self.dtc_provider
                        .as_ref()
                        .and_then(|p| p.active_dtcs())
                        .map(Arc::new)
                })
                .clone()
        } else {
            None
        };

        TriggeredData {
            event_id: rand::random(),
            trigger_time_ms: now,
            metadata: TriggerMetadata {
                campaign_sync_id: meta.campaign_sync_id.clone(),
                campaign_name: meta.campaign_name.clone(),
                decoder_manifest_id: meta.decoder_manifest_id.clone(),
                persist: meta.persist,
                compress: meta.compress,
                priority: meta.priority,
            },
            signals,
            dtc_info,
        }
    }

    fn evaluate_fetch_conditions(&mut self) {
        let Some(trigger_tx) = self.fetch_trigger_tx.clone() else {
            return;
        };
        const FETCH_INVOCATION_BASE: u64 = 0xFFFF_0000_0000_0000;
        for (idx, fetch) in self.fetch_conditions.iter_mut().enumerate() {
            let mut ctx = EvalContext {
                buffers: &self.buffers,
                raw_buffer: &self.raw_buffer,
                functions: &mut self.functions,
                invocation_base: FETCH_INVOCATION_BASE | ((idx as u64) << 32),
            };
            let result = evaluate(&mut ctx, &fetch.condition, fetch.condition.root())
                .map(|v| v.truthy())
                .unwrap_or(false);
            let fire = result && !(fetch.rising_edge_only && fetch.previous_result);
            fetch.previous_result = result;
            if fire && trigger_tx.try_send(fetch.request_id.clone()).is_err() {
                trace!(
                    component = "inspection",
                    fetch_request = %fetch.request_id,
                    "fetch trigger queue full, skipping"
                );
            }
        }
    }
}

#[async_trait]
impl Worker for InspectionEngine {
    async fn run(&mut self) {
        loop {
            if self.cancellation_token.is_cancelled() {
                return;
            }
            // Snapshot swaps happen only at the top of the loop.
            if self.matrix_rx.has_changed().unwrap_or(false) {
                let matrix = self.matrix_rx.borrow_and_update().clone();
                let now = self.clock.system_time_ms();
                self.apply_matrix(matrix, now);
            }
            if self.fetch_rx.has_changed().unwrap_or(false) {
                let matrix = self.fetch_rx.borrow_and_update().clone();
                self.apply_fetch_matrix(matrix);
            }

            tokio::select! {
                _ = self.cancellation_token.cancelled() => return,
                _ = tokio::time::sleep(self.config.tick_interval) => {
                    self.mark_all_candidates();
                }
                changed = self.matrix_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
                sample = self.input.recv() => {
                    let Some(sample) = sample else { return };
                    self.handle_sample(sample);
                    for _ in 1..self.config.max_batch {
                        match self.input.try_recv() {
                            Ok(sample) => self.handle_sample(sample),
                            Err(_) => break,
                        }
                    }
                }
            }

            let now = self.clock.system_time_ms();
            self.evaluate_candidates(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custom_function::MultiRisingEdgeTrigger;
    use ddfleet_campaign::test_support::{build_list, scheme_json};
    use ddfleet_campaign::test_support::sample_manifest;
    use ddfleet_campaign::inspection_matrix::build_inspection_matrix;
    use ddfleet_common::metrics::InMemoryMetrics;
    use ddfleet_common::time::ManualClock;
    use serde_json::json;

    struct Harness {
        clock: Arc<ManualClock>,
        sample_tx: mpsc::Sender<SignalSample>,
        matrix_tx: watch::Sender<Arc<InspectionMatrix>>,
        output: Arc<TriggerQueue>,
        raw_buffer: Arc<RawBufferManager>,
        token: CancellationToken,
        handle: tokio::task::JoinHandle<()>,
    }

    fn spawn_engine(tick_ms: u64, functions: CustomFunctionRegistry) -> Harness {
        let clock = ManualClock::starting_at(0);
        let metrics = Arc::new(InMemoryMetrics::new());
        let (sample_tx, sample_rx) = mpsc::channel(1024);
        let (matrix_tx, matrix_rx) = watch::channel(Arc::new(InspectionMatrix::default()));
        let (_fetch_tx, fetch_rx) = watch::channel(Arc::new(FetchMatrix::default()));
        let output = Arc::new(TriggerQueue::new(64, metrics.clone()));
        let raw_buffer = Arc::new(RawBufferManager::new(
            RawBufferConfig::default(),
            metrics.clone(),
        ));
        let token = CancellationToken::new();
        let mut engine = InspectionEngine::new(
            clock.clone(),
            metrics,
            InspectionEngineConfig {
                tick_interval: Duration::from_millis(tick_ms),
                ..Default::default()
            },
            sample_rx,
            matrix_rx,
            fetch_rx,
            output.clone(),
            raw_buffer.clone(),
            functions,
            None,
            None,
            token.clone(),
        );
        let handle = tokio::spawn(async move { engine.run().await });
        Harness {
            clock,
            sample_tx,
            matrix_tx,
            output,
            raw_buffer,
            token,
            handle,
        }
    }

    fn matrix_for(docs: &[serde_json::Value]) -> Arc<InspectionMatrix> {
        let manifest = sample_manifest();
        let list = build_list(docs);
        build_inspection_matrix(&list.schemes, &manifest)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    async fn send_sample(h: &Harness, t: u64, signal: u32, value: f64) {
        h.clock.set(t);
        h.sample_tx
            .send(SignalSample {
                signal_id: SignalId(signal),
                timestamp_ms: t,
                value: SampleValue::Number(value),
            })
            .await
            .unwrap();
        settle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rising_edge_debounce() {
        // speed > 100 with trigger_only_on_rising_edge.
        let mut doc = scheme_json("cs-edge", 0, 1_000_000);
        doc["trigger_only_on_rising_edge"] = json!(true);
        let h = spawn_engine(1000, CustomFunctionRegistry::default());
        h.matrix_tx.send_replace(matrix_for(&[doc]));
        settle().await;

        for (t, v) in [(1u64, 50.0), (10, 120.0), (20, 130.0), (30, 90.0), (40, 110.0)] {
            send_sample(&h, t, 1, v).await;
        }

        let mut trigger_times = Vec::new();
        while let Some(data) = h.output.try_pop() {
            trigger_times.push(data.trigger_time_ms);
        }
        trigger_times.sort_unstable();
        assert_eq!(trigger_times, vec![10, 40]);

        h.token.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_minimum_publish_interval() {
        // Always-true condition with a 100ms publish interval, ticked every
        // 20ms for 500ms.
        let mut doc = scheme_json("cs-heartbeat", 0, 1_000_000);
        doc.as_object_mut().unwrap().remove("condition");
        doc["minimum_publish_interval_ms"] = json!(100);
        let h = spawn_engine(20, CustomFunctionRegistry::default());
        h.matrix_tx.send_replace(matrix_for(&[doc]));
        settle().await;
        send_sample(&h, 0, 1, 42.0).await;

        let mut now = 0;
        while now < 480 {
            now += 20;
            h.clock.set(now);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let mut emissions = Vec::new();
        while let Some(data) = h.output.try_pop() {
            emissions.push(data.trigger_time_ms);
        }
        emissions.sort_unstable();
        assert_eq!(emissions.len(), 5, "emissions: {emissions:?}");
        for pair in emissions.windows(2) {
            assert!(pair[1] - pair[0] >= 100);
        }

        h.token.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_snapshots_ring_buffer() {
        let h = spawn_engine(1000, CustomFunctionRegistry::default());
        h.matrix_tx
            .send_replace(matrix_for(&[scheme_json("cs-snap", 0, 1_000_000)]));
        settle().await;

        for (t, v) in [(1u64, 10.0), (5, 20.0), (9, 150.0)] {
            send_sample(&h, t, 1, v).await;
        }

        let data = h.output.try_pop().expect("one trigger");
        assert_eq!(data.metadata.campaign_sync_id, "cs-snap");
        let values: Vec<f64> = data
            .signals
            .iter()
            .filter_map(|s| s.value.as_number())
            .collect();
        assert_eq!(values, vec![10.0, 20.0, 150.0]);
        assert!(data.dtc_info.is_none());

        h.token.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_matrix_swap_rebuilds_layout() {
        let h = spawn_engine(1000, CustomFunctionRegistry::default());
        h.matrix_tx
            .send_replace(matrix_for(&[scheme_json("cs-a", 0, 1_000_000)]));
        settle().await;
        send_sample(&h, 1, 1, 500.0).await;
        assert!(h.output.try_pop().is_some());

        // Swap to an empty matrix: buffers vanish, no more triggers.
        h.matrix_tx.send_replace(Arc::new(InspectionMatrix::default()));
        settle().await;
        send_sample(&h, 10, 1, 500.0).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.output.try_pop().is_none());

        h.token.cancel();
        h.handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_rising_edge_custom_function() {
        let output_signal = 0x8000_0001u32;
        let mut doc = scheme_json("cs-custom", 0, 1_000_000);
        doc["signals"] = json!([
            {"signal_id": 1, "sample_buffer_size": 4},
            {"signal_id": output_signal, "sample_buffer_size": 1}
        ]);
        doc["condition"] = json!({"function": MultiRisingEdgeTrigger::NAME, "args": [
            {"string": "overspeed"},
            {"op": "gt", "left": {"signal": 1}, "right": {"number": 100.0}}
        ]});

        let h = {
            // Registry construction needs the engine's raw buffer manager;
            // build the engine manually around a shared one.
            let clock = ManualClock::starting_at(0);
            let metrics = Arc::new(InMemoryMetrics::new());
            let (sample_tx, sample_rx) = mpsc::channel(1024);
            let (matrix_tx, matrix_rx) = watch::channel(Arc::new(InspectionMatrix::default()));
            let (_fetch_tx, fetch_rx) = watch::channel(Arc::new(FetchMatrix::default()));
            let output = Arc::new(TriggerQueue::new(64, metrics.clone()));
            let raw_buffer = Arc::new(RawBufferManager::new(
                RawBufferConfig::default(),
                metrics.clone(),
            ));
            let mut functions = CustomFunctionRegistry::default();
            functions.register(
                MultiRisingEdgeTrigger::NAME,
                Box::new(MultiRisingEdgeTrigger::new(
                    SignalId(output_signal),
                    raw_buffer.clone(),
                )),
            );
            let token = CancellationToken::new();
            let mut engine = InspectionEngine::new(
                clock.clone(),
                metrics,
                InspectionEngineConfig {
                    tick_interval: Duration::from_millis(1000),
                    ..Default::default()
                },
                sample_rx,
                matrix_rx,
                fetch_rx,
                output.clone(),
                raw_buffer.clone(),
                functions,
                None,
                None,
                token.clone(),
            );
            let handle = tokio::spawn(async move { engine.run().await });
            Harness {
                clock,
                sample_tx,
                matrix_tx,
                output,
                raw_buffer,
                token,
                handle,
            }
        };
        h.matrix_tx.send_replace(matrix_for(&[doc]));
        settle().await;

        // Arm with a low sample, then cross the threshold.
        send_sample(&h, 1, 1, 50.0).await;
        send_sample(&h, 10, 1, 120.0).await;

        let data = h.output.try_pop().expect("rising edge trigger");
        let raw_signal = data
            .signals
            .iter()
            .find(|s| s.signal_id == SignalId(output_signal))
            .expect("custom function output collected");
        let SampleValue::Raw(handle) = raw_signal.value else {
            panic!("expected raw handle")
        };
        let names: Vec<String> =
            serde_json::from_slice(&h.raw_buffer.borrow(handle).unwrap()).unwrap();
        assert_eq!(names, vec!["overspeed"]);

        h.token.cancel();
        h.handle.await.unwrap();
    }
}

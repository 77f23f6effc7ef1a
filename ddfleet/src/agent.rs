// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wires the subsystem workers together into one embeddable agent. The
//! host provides the transport and the runtime; `start` spawns every
//! worker, `stop` cancels them and waits for in-flight writes to finish.

use crate::config::AgentConfig;
use ddfleet_campaign::checkin::CheckinSender;
use ddfleet_campaign::manager::{CampaignAction, CampaignManager, CampaignSnapshots};
use ddfleet_common::ids::SignalId;
use ddfleet_common::metrics::Metrics;
use ddfleet_common::persistency::PersistencyStore;
use ddfleet_common::time::Clock;
use ddfleet_common::transport::Sender;
use ddfleet_common::worker::Worker;
use ddfleet_common::EdgeError;
use ddfleet_inspection::custom_function::{
    CustomFunction, CustomFunctionRegistry, MultiRisingEdgeTrigger,
};
use ddfleet_inspection::engine::{DtcProvider, InspectionEngine, InspectionEngineConfig};
use ddfleet_inspection::fetch::{FetchExecutor, FetchFunction};
use ddfleet_inspection::output::TriggerQueue;
use ddfleet_inspection::raw_buffer::RawBufferManager;
use ddfleet_inspection::types::SignalSample;
use ddfleet_store::forwarder::{ForwardController, StreamForwarder};
use ddfleet_store::jobs::ForwardJobHandler;
use ddfleet_store::manager::{StreamManager, StreamManagerConfig};
use ddfleet_telemetry::payload_writer::JsonPayloadWriter;
use ddfleet_telemetry::sender::{PersistedUploader, TelemetryDataSender};
use ddfleet_telemetry::spool::PayloadSpool;
use ddfleet_telemetry::worker::TelemetrySenderWorker;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Internal signal slot receiving the JSON output of the built-in
/// multi-rising-edge trigger function.
pub const MULTI_RISING_EDGE_TRIGGER_SIGNAL: SignalId = SignalId(0x8000_0001);

/// Optional host extension points.
#[derive(Default)]
pub struct AgentHooks {
    pub dtc_provider: Option<Arc<dyn DtcProvider>>,
    pub custom_functions: Vec<(String, Box<dyn CustomFunction>)>,
    pub fetch_functions: Vec<(String, Box<dyn FetchFunction>)>,
    /// Receives the id of every completed forward job.
    pub job_complete_tx: Option<mpsc::Sender<String>>,
}

pub struct EdgeAgent {
    cancellation_token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    campaign_tx: mpsc::Sender<CampaignAction>,
    sample_tx: mpsc::Sender<SignalSample>,
    snapshots: CampaignSnapshots,
    stream_manager: Arc<StreamManager>,
    forward_controller: ForwardController,
    job_handler: ForwardJobHandler,
}

impl EdgeAgent {
    /// Builds and spawns every worker on the current tokio runtime. The
    /// only error surfaced here is a fatal persistency-root failure.
    pub fn start(
        config: AgentConfig,
        transport: Arc<dyn Sender>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn Metrics>,
        hooks: AgentHooks,
    ) -> Result<EdgeAgent, EdgeError> {
        let cancellation_token = CancellationToken::new();
        let store = Arc::new(PersistencyStore::new(
            &config.persistency_path,
            config.persistency_max_bytes,
        )?);
        let stream_manager = Arc::new(StreamManager::new(
            StreamManagerConfig::new(config.stream_root()),
            clock.clone(),
            metrics.clone(),
        )?);
        let raw_buffer = Arc::new(RawBufferManager::new(
            config.raw_buffer.clone(),
            metrics.clone(),
        ));
        let trigger_queue = Arc::new(TriggerQueue::new(
            config.output_queue_capacity,
            metrics.clone(),
        ));
        let (sample_tx, sample_rx) = mpsc::channel(config.input_queue_capacity);
        let (fetch_trigger_tx, fetch_trigger_rx) = mpsc::channel(64);

        let (campaign_manager, campaign_tx, snapshots) = CampaignManager::new(
            clock.clone(),
            store.clone(),
            metrics.clone(),
            config.checkin_interval.as_millis() as u64,
            cancellation_token.clone(),
        );

        let mut functions = CustomFunctionRegistry::default();
        functions.register(
            MultiRisingEdgeTrigger::NAME,
            Box::new(MultiRisingEdgeTrigger::new(
                MULTI_RISING_EDGE_TRIGGER_SIGNAL,
                raw_buffer.clone(),
            )),
        );
        for (name, function) in hooks.custom_functions {
            functions.register(name, function);
        }

        let engine = InspectionEngine::new(
            clock.clone(),
            metrics.clone(),
            InspectionEngineConfig {
                tick_interval: config.inspection_tick_interval,
                raw_buffer: config.raw_buffer.clone(),
                ..Default::default()
            },
            sample_rx,
            snapshots.inspection_matrix.clone(),
            snapshots.fetch_matrix.clone(),
            trigger_queue.clone(),
            raw_buffer.clone(),
            functions,
            hooks.dtc_provider,
            Some(fetch_trigger_tx),
            cancellation_token.clone(),
        );

        let mut fetch_executor = FetchExecutor::new(
            clock.clone(),
            snapshots.fetch_matrix.clone(),
            sample_tx.clone(),
            fetch_trigger_rx,
            cancellation_token.clone(),
        );
        for (name, function) in hooks.fetch_functions {
            fetch_executor.register(name, function);
        }

        let spool = Arc::new(PayloadSpool::new(store.clone()));
        let sender = TelemetryDataSender::new(
            transport.clone(),
            Box::new(JsonPayloadWriter::new(raw_buffer.clone())),
            config.uncompressed,
            config.compressed,
            Some(stream_manager.clone()),
            Some(spool),
            raw_buffer.clone(),
            metrics.clone(),
        );
        let telemetry_worker = TelemetrySenderWorker::new(
            sender,
            trigger_queue.clone(),
            config.flush_interval,
            config.spool_retry_interval,
            cancellation_token.clone(),
        );

        let forwarder = StreamForwarder::new(
            metrics.clone(),
            stream_manager.clone(),
            Arc::new(PersistedUploader::new(transport.clone(), metrics.clone())),
            hooks.job_complete_tx,
            cancellation_token.clone(),
        );
        let forward_controller = forwarder.controller();
        let job_handler = ForwardJobHandler::new(stream_manager.clone(), forwarder.controller());

        let checkin = CheckinSender::new(
            clock,
            transport,
            metrics,
            snapshots.checkin_document.clone(),
            config.checkin_interval,
            cancellation_token.clone(),
        );

        let mut handles = Vec::new();
        handles.push(spawn_worker(campaign_manager));
        handles.push(spawn_worker(engine));
        handles.push(spawn_worker(fetch_executor));
        handles.push(spawn_worker(telemetry_worker));
        handles.push(spawn_worker(forwarder));
        handles.push(spawn_worker(checkin));
        handles.push(spawn_scheme_bridge(
            snapshots.clone(),
            stream_manager.clone(),
            forward_controller.clone(),
            cancellation_token.clone(),
        ));

        info!(component = "agent", workers = handles.len(), "edge agent started");
        Ok(EdgeAgent {
            cancellation_token,
            handles,
            campaign_tx,
            sample_tx,
            snapshots,
            stream_manager,
            forward_controller,
            job_handler,
        })
    }

    /// Mailbox for cloud-delivered documents and manual reviews.
    pub fn campaign_actions(&self) -> mpsc::Sender<CampaignAction> {
        self.campaign_tx.clone()
    }

    /// Bounded queue the vehicle adapters push decoded samples into.
    pub fn sample_sender(&self) -> mpsc::Sender<SignalSample> {
        self.sample_tx.clone()
    }

    /// Snapshot subscriptions (decoder dictionary for adapters, matrices
    /// for diagnostics).
    pub fn snapshots(&self) -> &CampaignSnapshots {
        &self.snapshots
    }

    pub fn stream_manager(&self) -> &Arc<StreamManager> {
        &self.stream_manager
    }

    pub fn forward_controller(&self) -> &ForwardController {
        &self.forward_controller
    }

    pub fn job_handler(&self) -> &ForwardJobHandler {
        &self.job_handler
    }

    /// Cancels every worker and joins them. In-flight writes complete;
    /// unacknowledged stream reads are redelivered after restart.
    pub async fn stop(self) {
        self.cancellation_token.cancel();
        for handle in self.handles {
            let _ = handle.await;
        }
        info!(component = "agent", "edge agent stopped");
    }
}

fn spawn_worker<W: Worker + Send + 'static>(mut worker: W) -> JoinHandle<()> {
    tokio::spawn(async move {
        worker.run().await;
        worker.shutdown();
    })
}

/// Keeps the stream manager's partition set aligned with the enabled
/// schemes and nudges the forwarder after every swap.
fn spawn_scheme_bridge(
    snapshots: CampaignSnapshots,
    stream_manager: Arc<StreamManager>,
    controller: ForwardController,
    cancellation_token: CancellationToken,
) -> JoinHandle<()> {
    let mut schemes_rx = snapshots.enabled_schemes;
    tokio::spawn(async move {
        loop {
            let schemes = schemes_rx.borrow_and_update().clone();
            stream_manager.apply_schemes(&schemes);
            controller.wake();
            tokio::select! {
                _ = cancellation_token.cancelled() => return,
                changed = schemes_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    })
}

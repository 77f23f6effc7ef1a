// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Serialization and upload of triggered data: batch through the injected
//! writer, compress when the campaign asks for it, keep chunk sizes inside
//! the configured band by adapting the transmit threshold, split oversize
//! payloads in half up to a recursion limit, and spool failed publishes.

use crate::payload_writer::PayloadWriter;
use crate::spool::PayloadSpool;
use async_trait::async_trait;
use bytes::Bytes;
use ddfleet_campaign::collection_scheme::{PartitionId, DEFAULT_PARTITION_ID};
use ddfleet_common::metrics::{names, Metrics};
use ddfleet_common::time::Timestamp;
use ddfleet_common::transport::{SendError, Sender};
use ddfleet_common::value::SampleValue;
use ddfleet_inspection::raw_buffer::{RawBufferManager, UsageStage};
use ddfleet_inspection::types::TriggeredData;
use ddfleet_store::manager::{PartitionPayload, StreamManager};
use ddfleet_store::stream::StreamRecord;
use ddfleet_store::ForwardTarget;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Hard limit on halving recursion when a chunk exceeds the transport's
/// maximum payload size.
pub const UPLOAD_PAYLOAD_RECURSION_LIMIT: u32 = 2;

const MAX_SIGNALS_IN_LOG: usize = 6;

/// Self-tuning chunk sizing, one instance per compression mode.
#[derive(Debug, Clone, Copy)]
pub struct PayloadAdaptionConfig {
    pub transmit_threshold_start_percent: u64,
    pub payload_size_limit_min_percent: u64,
    pub payload_size_limit_max_percent: u64,
    pub transmit_threshold_adapt_percent: u64,
    transmit_size_threshold: usize,
}

impl PayloadAdaptionConfig {
    pub fn new(start: u64, min: u64, max: u64, adapt: u64) -> Self {
        PayloadAdaptionConfig {
            transmit_threshold_start_percent: start,
            payload_size_limit_min_percent: min,
            payload_size_limit_max_percent: max,
            transmit_threshold_adapt_percent: adapt,
            transmit_size_threshold: 0,
        }
    }

    pub fn default_uncompressed() -> Self {
        Self::new(80, 70, 90, 10)
    }

    pub fn default_compressed() -> Self {
        Self::new(70, 60, 80, 10)
    }

    fn init(&mut self, max_send_size: usize) {
        self.transmit_size_threshold =
            (max_send_size * self.transmit_threshold_start_percent as usize) / 100;
    }

    pub fn transmit_size_threshold(&self) -> usize {
        self.transmit_size_threshold
    }
}

/// One serialized chunk ready to publish or store.
#[derive(Debug, Clone)]
pub struct PayloadChunk {
    pub data: Bytes,
    pub compressed: bool,
    pub persist: bool,
    pub partition_id: Option<PartitionId>,
    pub part_number: u32,
    pub event_id: u32,
    pub trigger_time_ms: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BatchParams {
    persist: bool,
    compress: bool,
    event_id: u32,
    trigger_time_ms: Timestamp,
}

pub struct TelemetryDataSender {
    transport: Arc<dyn Sender>,
    writer: Box<dyn PayloadWriter>,
    config_uncompressed: PayloadAdaptionConfig,
    config_compressed: PayloadAdaptionConfig,
    stream_manager: Option<Arc<StreamManager>>,
    spool: Option<Arc<PayloadSpool>>,
    raw_buffer: Arc<RawBufferManager>,
    metrics: Arc<dyn Metrics>,
    part_number: u32,
    batch: Option<BatchParams>,
}

impl TelemetryDataSender {
    pub fn new(
        transport: Arc<dyn Sender>,
        writer: Box<dyn PayloadWriter>,
        mut config_uncompressed: PayloadAdaptionConfig,
        mut config_compressed: PayloadAdaptionConfig,
        stream_manager: Option<Arc<StreamManager>>,
        spool: Option<Arc<PayloadSpool>>,
        raw_buffer: Arc<RawBufferManager>,
        metrics: Arc<dyn Metrics>,
    ) -> Self {
        config_uncompressed.init(transport.max_send_size());
        config_compressed.init(transport.max_send_size());
        TelemetryDataSender {
            transport,
            writer,
            config_uncompressed,
            config_compressed,
            stream_manager,
            spool,
            raw_buffer,
            metrics,
            part_number: 0,
            batch: None,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    fn log_summary(data: &TriggeredData) {
        let mut first_values = String::from("[");
        let mut first_timestamp = None;
        for (i, signal) in data.signals.iter().enumerate() {
            if first_timestamp.is_none() {
                first_timestamp = Some(signal.receive_time_ms);
            }
            if i >= MAX_SIGNALS_IN_LOG {
                first_values.push_str(" ...");
                break;
            }
            match signal.value {
                SampleValue::Number(n) => {
                    first_values.push_str(&format!("{}:{n},", signal.signal_id))
                }
                SampleValue::Bool(b) => {
                    first_values.push_str(&format!("{}:{},", signal.signal_id, b as u8))
                }
                SampleValue::Raw(handle) => {
                    first_values.push_str(&format!("{}:raw#{handle},", signal.signal_id))
                }
            }
        }
        first_values.push(']');
        info!(
            component = "telemetry",
            event_id = data.event_id,
            campaign = %data.metadata.campaign_sync_id,
            signals = data.signals.len(),
            first_values = %first_values,
            first_signal_timestamp = first_timestamp,
            trigger_time = data.trigger_time_ms,
            dtcs = data.dtc_info.as_ref().map(|d| d.codes.len()).unwrap_or(0),
            "data ready to send"
        );
    }

    /// Drops the upload-stage references the engine took when it snapshotted
    /// raw values; the writer has embedded the bytes by now.
    fn release_raw_references(&self, data: &TriggeredData) {
        for signal in &data.signals {
            if let SampleValue::Raw(handle) = signal.value {
                self.raw_buffer
                    .decrease_usage(handle, UsageStage::SelectedForUpload);
            }
        }
    }

    pub async fn process_data(&mut self, data: &TriggeredData) {
        if data.is_empty() {
            info!(
                component = "telemetry",
                campaign = %data.metadata.campaign_sync_id,
                event_id = data.event_id,
                "trigger activated but no data is available to ingest"
            );
            return;
        }
        Self::log_summary(data);

        let partitioned = self
            .stream_manager
            .as_ref()
            .and_then(|sm| sm.scheme_of(&data.metadata.campaign_sync_id))
            .filter(|scheme| !scheme.partitions.is_empty());

        if let Some(scheme) = partitioned {
            // The writer is about to be repurposed; publish any batch the
            // direct path has accumulated.
            self.flush().await;
            // Each partition requires its own chunk sequence.
            let mut payloads = Vec::new();
            let mut partitions: Vec<PartitionId> = scheme.partitions.keys().copied().collect();
            partitions.sort_unstable();
            for partition_id in partitions {
                self.writer.clear();
                self.part_number = 0;
                self.writer.begin_event(data);
                for signal in &data.signals {
                    let target = scheme
                        .partition_of(signal.signal_id)
                        .unwrap_or(DEFAULT_PARTITION_ID);
                    if target == partition_id {
                        self.writer.append_signal(signal);
                    }
                }
                if partition_id == DEFAULT_PARTITION_ID {
                    if let Some(dtcs) = &data.dtc_info {
                        for code in &dtcs.codes {
                            self.writer.append_dtc(code, dtcs.receive_time_ms);
                        }
                    }
                }
                if self.writer.appended_messages() == 0 {
                    continue;
                }
                let mut chunks = Vec::new();
                self.serialize_chunks(
                    data.metadata.compress,
                    data.metadata.persist,
                    Some(partition_id),
                    data.event_id,
                    data.trigger_time_ms,
                    &mut chunks,
                    0,
                );
                payloads.extend(chunks.into_iter().map(|chunk| PartitionPayload {
                    partition_id,
                    trigger_time_ms: chunk.trigger_time_ms,
                    payload: chunk.data,
                    compressed: chunk.compressed,
                }));
            }
            self.writer.clear();
            self.release_raw_references(data);
            #[allow(clippy::unwrap_used)] // partitioned implies a manager
            let manager = self.stream_manager.as_ref().unwrap();
            let result = manager.append_to_streams(&data.metadata.campaign_sync_id, &payloads);
            debug!(component = "telemetry", campaign = %data.metadata.campaign_sync_id,
                ?result, "routed trigger to streams");
            return;
        }

        // Direct path: batch across triggers until the adaptive threshold
        // flushes. Campaigns with different persist/compress settings never
        // share a batch.
        let params = BatchParams {
            persist: data.metadata.persist,
            compress: data.metadata.compress,
            event_id: data.event_id,
            trigger_time_ms: data.trigger_time_ms,
        };
        if let Some(batch) = self.batch {
            if batch.persist != params.persist || batch.compress != params.compress {
                self.flush().await;
            }
        }
        if self.batch.is_none() {
            self.batch = Some(params);
        }
        self.writer.begin_event(data);
        for signal in &data.signals {
            self.writer.append_signal(signal);
        }
        if let Some(dtcs) = &data.dtc_info {
            for code in &dtcs.codes {
                self.writer.append_dtc(code, dtcs.receive_time_ms);
            }
        }
        self.release_raw_references(data);

        let threshold = if data.metadata.compress {
            self.config_compressed.transmit_size_threshold
        } else {
            self.config_uncompressed.transmit_size_threshold
        };
        if self.writer.estimated_size() > threshold {
            self.flush().await;
        }
    }

    /// Serializes and publishes whatever is batched.
    pub async fn flush(&mut self) {
        let Some(batch) = self.batch.take() else {
            return;
        };
        if self.writer.appended_messages() == 0 {
            self.writer.clear();
            return;
        }
        self.part_number = 0;
        let mut chunks = Vec::new();
        self.serialize_chunks(
            batch.compress,
            batch.persist,
            None,
            batch.event_id,
            batch.trigger_time_ms,
            &mut chunks,
            0,
        );
        self.writer.clear();
        for chunk in chunks {
            self.upload_chunk(chunk).await;
        }
    }

    async fn upload_chunk(&self, chunk: PayloadChunk) {
        let topic = self.transport.topic_config().telemetry_data_topic.clone();
        match self.transport.send(&topic, chunk.data.clone()).await {
            Ok(()) => {
                info!(
                    component = "telemetry",
                    size = chunk.data.len(),
                    compressed = chunk.compressed,
                    "payload has been uploaded"
                );
                self.metrics.increment(names::PAYLOADS_PUBLISHED);
                self.metrics
                    .add(names::BYTES_PUBLISHED, chunk.data.len() as u64);
            }
            Err(e) => {
                warn!(component = "telemetry", error = %e, size = chunk.data.len(),
                    "publish failed");
                if chunk.persist {
                    if let Some(spool) = &self.spool {
                        if let Err(e) = spool.store_chunk(&chunk) {
                            error!(component = "telemetry", error = %e, "spooling payload failed");
                        }
                    }
                }
            }
        }
    }

    /// Serialize the current batch into chunks no larger than the transport
    /// limit, adapting the transmit threshold towards the configured band.
    #[allow(clippy::too_many_arguments)]
    fn serialize_chunks(
        &mut self,
        compress: bool,
        persist: bool,
        partition_id: Option<PartitionId>,
        event_id: u32,
        trigger_time_ms: Timestamp,
        out: &mut Vec<PayloadChunk>,
        recursion_level: u32,
    ) -> usize {
        let serialized = match self.writer.serialize() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(component = "telemetry", error = %e,
                    "data cannot be uploaded due to serialization failure");
                return 0;
            }
        };
        let payload = if compress {
            trace!(
                component = "telemetry",
                "compressing the payload since the campaign compression flag is set"
            );
            match zstd::stream::encode_all(serialized.as_slice(), 0) {
                Ok(compressed) => compressed,
                Err(e) => {
                    error!(component = "telemetry", error = %e,
                        "data cannot be uploaded due to compression failure");
                    return 0;
                }
            }
        } else {
            serialized
        };

        let max_send_size = self.transport.max_send_size();
        let config = if compress {
            &mut self.config_compressed
        } else {
            &mut self.config_uncompressed
        };
        let payload_size_limit_max =
            (max_send_size * config.payload_size_limit_max_percent as usize) / 100;
        if payload.len() > payload_size_limit_max {
            config.transmit_size_threshold = (config.transmit_size_threshold
                * (100 - config.transmit_threshold_adapt_percent as usize))
                / 100;
            trace!(
                component = "telemetry",
                size = payload.len(),
                limit = payload_size_limit_max,
                threshold = config.transmit_size_threshold,
                "payload above maximum limit, decreasing transmit threshold"
            );
        }
        if payload.len() > max_send_size {
            if recursion_level >= UPLOAD_PAYLOAD_RECURSION_LIMIT {
                error!(
                    component = "telemetry",
                    size = payload.len(),
                    "payload dropped as it could not be split smaller than the maximum payload size"
                );
                self.metrics.increment(names::PAYLOADS_DROPPED_OVERSIZE);
                return 0;
            }
            trace!(
                component = "telemetry",
                size = payload.len(),
                max = max_send_size,
                recursion_level,
                "payload exceeds the maximum size, splitting in half"
            );
            let half = self.writer.split();
            self.serialize_chunks(
                compress,
                persist,
                partition_id,
                event_id,
                trigger_time_ms,
                out,
                recursion_level + 1,
            );
            self.writer.merge(half);
            self.serialize_chunks(
                compress,
                persist,
                partition_id,
                event_id,
                trigger_time_ms,
                out,
                recursion_level + 1,
            );
            return payload.len();
        }

        let size = payload.len();
        self.part_number += 1;
        out.push(PayloadChunk {
            data: Bytes::from(payload),
            compressed: compress,
            persist,
            partition_id,
            part_number: self.part_number,
            event_id,
            trigger_time_ms,
        });

        let config = if compress {
            &mut self.config_compressed
        } else {
            &mut self.config_uncompressed
        };
        let payload_size_limit_min =
            (max_send_size * config.payload_size_limit_min_percent as usize) / 100;
        if recursion_level == 0 && size > 0 && size < payload_size_limit_min {
            config.transmit_size_threshold = (config.transmit_size_threshold
                * (100 + config.transmit_threshold_adapt_percent as usize))
                / 100;
            trace!(
                component = "telemetry",
                size,
                limit = payload_size_limit_min,
                threshold = config.transmit_size_threshold,
                "payload below minimum limit, increasing transmit threshold"
            );
        }
        debug!(
            component = "telemetry",
            size,
            part_number = self.part_number,
            compressed = compress,
            "payload chunk created"
        );
        size
    }

    /// Re-publish path for spooled or stream-stored payloads.
    pub async fn process_persisted_data(&self, data: Bytes) -> Result<(), SendError> {
        if !self.transport.is_alive() {
            return Err(SendError::NoConnection);
        }
        let topic = self.transport.topic_config().telemetry_data_topic.clone();
        self.transport.send(&topic, data.clone()).await?;
        info!(
            component = "telemetry",
            size = data.len(),
            "a persisted payload has been uploaded"
        );
        Ok(())
    }

    /// Re-reads the spool and republishes, deleting files on success.
    pub async fn replay_spool(&self) {
        let Some(spool) = self.spool.clone() else {
            return;
        };
        spool.replay(self).await;
    }

    pub fn transmit_size_threshold(&self, compressed: bool) -> usize {
        if compressed {
            self.config_compressed.transmit_size_threshold
        } else {
            self.config_uncompressed.transmit_size_threshold
        }
    }
}

/// Upload path for records drained out of the durable streams.
pub struct PersistedUploader {
    transport: Arc<dyn Sender>,
    metrics: Arc<dyn Metrics>,
}

impl PersistedUploader {
    pub fn new(transport: Arc<dyn Sender>, metrics: Arc<dyn Metrics>) -> Self {
        PersistedUploader { transport, metrics }
    }
}

#[async_trait]
impl ForwardTarget for PersistedUploader {
    async fn forward_record(
        &self,
        campaign_sync_id: &str,
        record: &StreamRecord,
    ) -> Result<(), SendError> {
        if !self.transport.is_alive() {
            return Err(SendError::NoConnection);
        }
        let topic = self.transport.topic_config().telemetry_data_topic.clone();
        self.transport
            .send(&topic, Bytes::copy_from_slice(&record.payload))
            .await?;
        debug!(
            component = "telemetry",
            campaign = %campaign_sync_id,
            seq = record.seq,
            size = record.payload.len(),
            "forwarded stored record"
        );
        self.metrics.increment(names::PAYLOADS_PUBLISHED);
        self.metrics
            .add(names::BYTES_PUBLISHED, record.payload.len() as u64);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use ddfleet_common::transport::TopicConfig;
    use ddfleet_common::MutexExt;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug)]
    pub struct MockTransport {
        pub topics: TopicConfig,
        pub max_send_size: usize,
        pub sent: Mutex<Vec<(String, Bytes)>>,
        pub alive: AtomicBool,
        pub failures_left: AtomicUsize,
    }

    impl MockTransport {
        pub fn new(max_send_size: usize) -> Arc<Self> {
            Arc::new(MockTransport {
                topics: TopicConfig {
                    telemetry_data_topic: "dt/vehicle-1/telemetry".into(),
                    ..Default::default()
                },
                max_send_size,
                sent: Mutex::new(Vec::new()),
                alive: AtomicBool::new(true),
                failures_left: AtomicUsize::new(0),
            })
        }

        pub fn sent_sizes(&self) -> Vec<usize> {
            self.sent.lock_or_panic().iter().map(|(_, b)| b.len()).collect()
        }
    }

    #[async_trait]
    impl Sender for MockTransport {
        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn max_send_size(&self) -> usize {
            self.max_send_size
        }

        fn topic_config(&self) -> &TopicConfig {
            &self.topics
        }

        async fn send(&self, topic: &str, data: Bytes) -> Result<(), SendError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SendError::TransmissionError);
            }
            self.sent.lock_or_panic().push((topic.to_string(), data));
            Ok(())
        }
    }
}

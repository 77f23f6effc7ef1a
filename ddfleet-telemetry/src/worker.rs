// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Worker draining the inspection output queue into the telemetry sender,
//! flushing partial batches on an interval and sweeping the spool.

use crate::sender::TelemetryDataSender;
use async_trait::async_trait;
use ddfleet_common::worker::Worker;
use ddfleet_inspection::output::TriggerQueue;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct TelemetrySenderWorker {
    sender: TelemetryDataSender,
    queue: Arc<TriggerQueue>,
    flush_interval: Duration,
    spool_retry_interval: Duration,
    cancellation_token: CancellationToken,
}

impl TelemetrySenderWorker {
    pub fn new(
        sender: TelemetryDataSender,
        queue: Arc<TriggerQueue>,
        flush_interval: Duration,
        spool_retry_interval: Duration,
        cancellation_token: CancellationToken,
    ) -> Self {
        TelemetrySenderWorker {
            sender,
            queue,
            flush_interval,
            spool_retry_interval,
            cancellation_token,
        }
    }
}

#[async_trait]
impl Worker for TelemetrySenderWorker {
    async fn run(&mut self) {
        let mut spool_sweep = tokio::time::interval(self.spool_retry_interval);
        spool_sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            if self.cancellation_token.is_cancelled() {
                // Final flush so a stop does not strand a partial batch.
                self.sender.flush().await;
                return;
            }
            tokio::select! {
                _ = self.cancellation_token.cancelled() => {
                    self.sender.flush().await;
                    return;
                }
                data = self.queue.pop() => {
                    self.sender.process_data(&data).await;
                }
                _ = tokio::time::sleep(self.flush_interval) => {
                    self.sender.flush().await;
                }
                _ = spool_sweep.tick() => {
                    if self.sender.is_alive() {
                        self.sender.replay_spool().await;
                    }
                }
            }
        }
    }

    fn shutdown(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload_writer::JsonPayloadWriter;
    use crate::sender::test_support::MockTransport;
    use crate::sender::PayloadAdaptionConfig;
    use ddfleet_common::ids::SignalId;
    use ddfleet_common::metrics::InMemoryMetrics;
    use ddfleet_common::value::SampleValue;
    use ddfleet_common::MutexExt;
    use ddfleet_inspection::raw_buffer::{RawBufferConfig, RawBufferManager};
    use ddfleet_inspection::types::{CollectedSignal, TriggerMetadata, TriggeredData};

    fn trigger(event_id: u32) -> Arc<TriggeredData> {
        Arc::new(TriggeredData {
            event_id,
            trigger_time_ms: 100,
            metadata: TriggerMetadata {
                campaign_sync_id: "cs-1".into(),
                campaign_name: "cs-1".into(),
                decoder_manifest_id: "dm-1".into(),
                persist: false,
                compress: false,
                priority: 1,
            },
            signals: vec![CollectedSignal {
                signal_id: SignalId(1),
                receive_time_ms: 100,
                value: SampleValue::Number(9.0),
            }],
            dtc_info: None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_flushes_batches_on_interval() {
        let transport = MockTransport::new(100_000);
        let raw = Arc::new(RawBufferManager::new(
            RawBufferConfig::default(),
            Arc::new(InMemoryMetrics::new()),
        ));
        let sender = TelemetryDataSender::new(
            transport.clone(),
            Box::new(JsonPayloadWriter::new(raw.clone())),
            PayloadAdaptionConfig::default_uncompressed(),
            PayloadAdaptionConfig::default_compressed(),
            None,
            None,
            raw,
            Arc::new(InMemoryMetrics::new()),
        );
        let queue = Arc::new(TriggerQueue::new(16, Arc::new(InMemoryMetrics::new())));
        let token = CancellationToken::new();
        let mut worker = TelemetrySenderWorker::new(
            sender,
            queue.clone(),
            Duration::from_millis(200),
            Duration::from_secs(30),
            token.clone(),
        );
        let handle = tokio::spawn(async move { worker.run().await });

        queue.push(trigger(1)).unwrap();
        queue.push(trigger(2)).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        {
            let sent = transport.sent.lock_or_panic();
            assert_eq!(sent.len(), 1, "both triggers flushed as one batch");
            let parsed: serde_json::Value = serde_json::from_slice(&sent[0].1).unwrap();
            assert_eq!(parsed.as_array().unwrap().len(), 2);
        }

        token.cancel();
        handle.await.unwrap();
    }
}

// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The injected upload serializer. The wire codec is a host choice; the
//! pipeline only requires batched appends, a running size estimate and the
//! ability to split a batch in half when a chunk cannot fit the transport.

use ddfleet_common::time::Timestamp;
use ddfleet_common::value::SampleValue;
use ddfleet_common::EdgeError;
use ddfleet_inspection::raw_buffer::RawBufferManager;
use ddfleet_inspection::types::{CollectedSignal, TriggeredData};
use serde::Serialize;
use std::any::Any;
use std::sync::Arc;

/// Serializer contract consumed by the telemetry sender.
///
/// A writer accumulates one or more triggered events into a batch. The
/// estimate must track appends cheaply; exact sizes are only known after
/// [`PayloadWriter::serialize`].
pub trait PayloadWriter: Send + Sync {
    /// Starts a new event section in the current batch.
    fn begin_event(&mut self, data: &TriggeredData);

    fn append_signal(&mut self, signal: &CollectedSignal);

    fn append_dtc(&mut self, code: &str, receive_time_ms: Timestamp);

    /// Messages appended since the batch was last cleared.
    fn appended_messages(&self) -> usize;

    /// Running size estimate of the serialized batch.
    fn estimated_size(&self) -> usize;

    fn serialize(&mut self) -> Result<Vec<u8>, EdgeError>;

    fn clear(&mut self);

    /// Removes roughly half of the appended messages and returns them as an
    /// opaque token for [`PayloadWriter::merge`].
    fn split(&mut self) -> Box<dyn Any + Send>;

    /// Replaces the current batch with a previously split half.
    fn merge(&mut self, half: Box<dyn Any + Send>);
}

#[derive(Debug, Clone, Serialize)]
struct SignalEntry {
    signal_id: u32,
    relative_time_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    number_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bool_value: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    string_value: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct DtcEntry {
    code: String,
    relative_time_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
struct EventSection {
    event_id: u32,
    trigger_time_ms: Timestamp,
    campaign_sync_id: String,
    decoder_manifest_sync_id: String,
    signals: Vec<SignalEntry>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    dtc_data: Vec<DtcEntry>,
}

/// JSON implementation of the payload writer, the default codec.
pub struct JsonPayloadWriter {
    raw_buffer: Arc<RawBufferManager>,
    events: Vec<EventSection>,
    appended: usize,
    estimated: usize,
}

const EVENT_OVERHEAD: usize = 120;
const SIGNAL_OVERHEAD: usize = 56;
const DTC_OVERHEAD: usize = 40;

impl JsonPayloadWriter {
    pub fn new(raw_buffer: Arc<RawBufferManager>) -> Self {
        JsonPayloadWriter {
            raw_buffer,
            events: Vec::new(),
            appended: 0,
            estimated: 0,
        }
    }

    fn current_event(&mut self) -> Option<&mut EventSection> {
        self.events.last_mut()
    }
}

impl PayloadWriter for JsonPayloadWriter {
    fn begin_event(&mut self, data: &TriggeredData) {
        self.events.push(EventSection {
            event_id: data.event_id,
            trigger_time_ms: data.trigger_time_ms,
            campaign_sync_id: data.metadata.campaign_sync_id.clone(),
            decoder_manifest_sync_id: data.metadata.decoder_manifest_id.clone(),
            signals: Vec::new(),
            dtc_data: Vec::new(),
        });
        self.estimated += EVENT_OVERHEAD + data.metadata.campaign_sync_id.len();
    }

    fn append_signal(&mut self, signal: &CollectedSignal) {
        let trigger_time = self
            .current_event()
            .map(|e| e.trigger_time_ms)
            .unwrap_or(signal.receive_time_ms);
        let mut entry = SignalEntry {
            signal_id: signal.signal_id.0,
            relative_time_ms: signal.receive_time_ms as i64 - trigger_time as i64,
            number_value: None,
            bool_value: None,
            string_value: None,
        };
        let mut size = SIGNAL_OVERHEAD;
        match signal.value {
            SampleValue::Number(n) => entry.number_value = Some(n),
            SampleValue::Bool(b) => entry.bool_value = Some(b),
            SampleValue::Raw(handle) => {
                // The raw entry may already be gone when the upload lagged
                // eviction; the sample is then skipped.
                let Some(bytes) = self.raw_buffer.borrow(handle) else {
                    return;
                };
                let text = String::from_utf8_lossy(&bytes).into_owned();
                size += text.len();
                entry.string_value = Some(text);
            }
        }
        if let Some(event) = self.current_event() {
            event.signals.push(entry);
            self.appended += 1;
            self.estimated += size;
        }
    }

    fn append_dtc(&mut self, code: &str, receive_time_ms: Timestamp) {
        let trigger_time = self
            .current_event()
            .map(|e| e.trigger_time_ms)
            .unwrap_or(receive_time_ms);
        let size = DTC_OVERHEAD + code.len();
        if let Some(event) = self.current_event() {
            event.dtc_data.push(DtcEntry {
                code: code.to_string(),
                relative_time_ms: receive_time_ms as i64 - trigger_time as i64,
            });
            self.appended += 1;
            self.estimated += size;
        }
    }

    fn appended_messages(&self) -> usize {
        self.appended
    }

    fn estimated_size(&self) -> usize {
        self.estimated
    }

    fn serialize(&mut self) -> Result<Vec<u8>, EdgeError> {
        serde_json::to_vec(&self.events).map_err(|e| EdgeError::invalid_format(e.to_string()))
    }

    fn clear(&mut self) {
        self.events.clear();
        self.appended = 0;
        self.estimated = 0;
    }

    fn split(&mut self) -> Box<dyn Any + Send> {
        // Take the newer half of the events; with a single event, split its
        // signal list instead.
        let taken: Vec<EventSection> = if self.events.len() >= 2 {
            let keep = self.events.len() / 2;
            self.events.split_off(keep)
        } else if let Some(event) = self.events.first_mut() {
            let keep = event.signals.len() / 2;
            let mut half = event.clone();
            half.signals = event.signals.split_off(keep);
            half.dtc_data = std::mem::take(&mut event.dtc_data);
            vec![half]
        } else {
            Vec::new()
        };
        self.recount();
        Box::new(taken)
    }

    fn merge(&mut self, half: Box<dyn Any + Send>) {
        if let Ok(events) = half.downcast::<Vec<EventSection>>() {
            self.events = *events;
            self.recount();
        }
    }
}

impl JsonPayloadWriter {
    fn recount(&mut self) {
        self.appended = self
            .events
            .iter()
            .map(|e| e.signals.len() + e.dtc_data.len())
            .sum();
        self.estimated = self
            .events
            .iter()
            .map(|e| {
                EVENT_OVERHEAD
                    + e.campaign_sync_id.len()
                    + e.signals
                        .iter()
                        .map(|s| {
                            SIGNAL_OVERHEAD
                                + s.string_value.as_ref().map(|v| v.len()).unwrap_or(0)
                        })
                        .sum::<usize>()
                    + e.dtc_data
                        .iter()
                        .map(|d| DTC_OVERHEAD + d.code.len())
                        .sum::<usize>()
            })
            .sum();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddfleet_common::ids::SignalId;
    use ddfleet_common::metrics::NoopMetrics;
    use ddfleet_inspection::raw_buffer::RawBufferConfig;
    use ddfleet_inspection::types::TriggerMetadata;

    fn writer() -> JsonPayloadWriter {
        JsonPayloadWriter::new(Arc::new(RawBufferManager::new(
            RawBufferConfig::default(),
            Arc::new(NoopMetrics),
        )))
    }

    fn trigger(event_id: u32) -> TriggeredData {
        TriggeredData {
            event_id,
            trigger_time_ms: 1_000,
            metadata: TriggerMetadata {
                campaign_sync_id: "cs-1".into(),
                campaign_name: "cs-1".into(),
                decoder_manifest_id: "dm-1".into(),
                persist: false,
                compress: false,
                priority: 0,
            },
            signals: Vec::new(),
            dtc_info: None,
        }
    }

    fn signal(id: u32, t: u64, v: f64) -> CollectedSignal {
        CollectedSignal {
            signal_id: SignalId(id),
            receive_time_ms: t,
            value: SampleValue::Number(v),
        }
    }

    #[test]
    fn test_serialize_roundtrip_fields() {
        let mut writer = writer();
        writer.begin_event(&trigger(7));
        writer.append_signal(&signal(1, 1_010, 42.0));
        writer.append_dtc("P0123", 1_005);

        let bytes = writer.serialize().unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed[0]["event_id"], 7);
        assert_eq!(parsed[0]["campaign_sync_id"], "cs-1");
        assert_eq!(parsed[0]["decoder_manifest_sync_id"], "dm-1");
        assert_eq!(parsed[0]["signals"][0]["signal_id"], 1);
        assert_eq!(parsed[0]["signals"][0]["relative_time_ms"], 10);
        assert_eq!(parsed[0]["signals"][0]["number_value"], 42.0);
        assert_eq!(parsed[0]["dtc_data"][0]["code"], "P0123");
    }

    #[test]
    fn test_estimate_tracks_appends_and_clear() {
        let mut writer = writer();
        assert_eq!(writer.estimated_size(), 0);
        writer.begin_event(&trigger(1));
        let after_event = writer.estimated_size();
        writer.append_signal(&signal(1, 1_000, 1.0));
        assert!(writer.estimated_size() > after_event);
        assert_eq!(writer.appended_messages(), 1);
        writer.clear();
        assert_eq!(writer.estimated_size(), 0);
        assert_eq!(writer.appended_messages(), 0);
    }

    #[test]
    fn test_split_and_merge_partition_the_batch() {
        let mut writer = writer();
        for event_id in 0..4u32 {
            writer.begin_event(&trigger(event_id));
            writer.append_signal(&signal(1, 1_000, event_id as f64));
        }
        assert_eq!(writer.appended_messages(), 4);

        let half = writer.split();
        assert_eq!(writer.appended_messages(), 2);
        let first = writer.serialize().unwrap();

        writer.merge(half);
        assert_eq!(writer.appended_messages(), 2);
        let second = writer.serialize().unwrap();

        let a: serde_json::Value = serde_json::from_slice(&first).unwrap();
        let b: serde_json::Value = serde_json::from_slice(&second).unwrap();
        let ids: Vec<u64> = a
            .as_array()
            .unwrap()
            .iter()
            .chain(b.as_array().unwrap())
            .map(|e| e["event_id"].as_u64().unwrap())
            .collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_single_event_splits_signals() {
        let mut writer = writer();
        writer.begin_event(&trigger(1));
        for i in 0..10 {
            writer.append_signal(&signal(1, 1_000 + i, i as f64));
        }
        let half = writer.split();
        assert_eq!(writer.appended_messages(), 5);
        writer.merge(half);
        assert_eq!(writer.appended_messages(), 5);
    }
}

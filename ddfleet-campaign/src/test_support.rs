// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Document builders shared by the tests of this crate and its dependents.

use crate::collection_scheme::{CollectionSchemeList, CollectionSchemeListIngestion};
use crate::decoder_manifest::{DecoderManifest, DecoderManifestIngestion};
use serde_json::{json, Value};

/// Minimal valid scheme document; callers override fields as needed.
pub fn scheme_json(sync_id: &str, start: u64, expiry: u64) -> Value {
    json!({
        "sync_id": sync_id,
        "decoder_manifest_id": "dm-1",
        "start_time": start,
        "expiry_time": expiry,
        "signals": [
            {"signal_id": 1, "sample_buffer_size": 10, "min_sample_interval_ms": 0,
             "fixed_window_ms": 0, "condition_only": false}
        ],
        "condition": {"op": "gt", "left": {"signal": 1}, "right": {"number": 100.0}}
    })
}

#[allow(clippy::unwrap_used)]
pub fn build_list(docs: &[Value]) -> CollectionSchemeList {
    let mut ingestion = CollectionSchemeListIngestion::new();
    ingestion
        .copy_data(&serde_json::to_vec(&docs).unwrap())
        .unwrap();
    ingestion.build().unwrap();
    ingestion.into_list().unwrap()
}

/// A manifest with one raw-bus frame (signals 1 and 2), one OBD PID, one
/// custom signal and one complex signal.
pub fn sample_manifest_json() -> Value {
    json!({
        "sync_id": "dm-1",
        "frames": [{
            "frame_id": 0x100,
            "interface_id": "can0",
            "length": 8,
            "signals": [
                {"signal_id": 1, "start_bit": 0, "length": 16,
                 "endianness": "little", "scaling": 0.1, "offset": 0.0, "type": "float"},
                {"signal_id": 2, "start_bit": 16, "length": 1,
                 "endianness": "little", "type": "bool"}
            ]
        }],
        "pid_signals": [
            {"signal_id": 0x2000_0001u32, "pid": 0x0C, "mode": 1,
             "start_byte": 0, "byte_length": 2, "scaling": 0.25, "offset": 0.0}
        ],
        "custom_signals": [
            {"signal_id": 0x4000_0001u32, "interface_id": "gps",
             "decoder_key": "Vehicle.CurrentLocation.Latitude", "type": "float"}
        ],
        "complex_types": [
            [10, {"kind": "primitive", "primitive": "float"}],
            [11, {"kind": "array", "element_type_id": 10}]
        ],
        "complex_signals": [
            {"signal_id": 0x6000_0001u32, "interface_id": "ros2",
             "root_type_id": 11, "message_id": "/points"}
        ]
    })
}

#[allow(clippy::unwrap_used)]
pub fn sample_manifest() -> DecoderManifest {
    let mut ingestion = DecoderManifestIngestion::new();
    ingestion
        .copy_data(&serde_json::to_vec(&sample_manifest_json()).unwrap())
        .unwrap();
    ingestion.build().unwrap();
    ingestion.into_manifest().unwrap()
}

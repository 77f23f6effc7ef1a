// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-signal fetch schedule derived from the enabled schemes.

use crate::collection_scheme::{CollectionScheme, FetchAction, FetchSchedule};
use ddfleet_common::ids::SignalId;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub fetch_request_id: String,
    pub signal_id: SignalId,
    pub actions: Vec<FetchAction>,
    pub schedule: FetchSchedule,
}

#[derive(Debug, Default)]
pub struct FetchMatrix {
    pub requests: HashMap<String, FetchRequest>,
}

/// Unions the fetch plans of all enabled schemes. Two schemes naming the
/// same fetch request id keep the first definition.
pub fn build_fetch_matrix(schemes: &[Arc<CollectionScheme>]) -> Arc<FetchMatrix> {
    let mut matrix = FetchMatrix::default();
    for scheme in schemes {
        for entry in &scheme.fetch_plan {
            if matrix.requests.contains_key(&entry.fetch_request_id) {
                warn!(
                    component = "campaign",
                    scheme = %scheme.sync_id,
                    fetch_request = %entry.fetch_request_id,
                    "duplicate fetch request id across schemes; keeping the first definition"
                );
                continue;
            }
            matrix.requests.insert(
                entry.fetch_request_id.clone(),
                FetchRequest {
                    fetch_request_id: entry.fetch_request_id.clone(),
                    signal_id: entry.signal_id,
                    actions: entry.actions.clone(),
                    schedule: entry.schedule.clone(),
                },
            );
        }
    }
    Arc::new(matrix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{build_list, scheme_json};
    use serde_json::json;

    #[test]
    fn test_union_keeps_first_duplicate() {
        let mut a = scheme_json("cs-a", 0, 100);
        a["fetch_plan"] = json!([
            {"fetch_request_id": "f-1", "signal_id": 1, "period_ms": 500,
             "actions": [{"function_name": "obd_read", "literal_args": [{"number": 12.0}]}]}
        ]);
        let mut b = scheme_json("cs-b", 0, 100);
        b["fetch_plan"] = json!([
            {"fetch_request_id": "f-1", "signal_id": 2, "period_ms": 900},
            {"fetch_request_id": "f-2", "signal_id": 2,
             "condition": {"op": "gt", "left": {"signal": 1}, "right": {"number": 0.0}},
             "trigger_only_on_rising_edge": true}
        ]);
        let list = build_list(&[a, b]);
        let matrix = build_fetch_matrix(&list.schemes);
        assert_eq!(matrix.requests.len(), 2);
        assert_eq!(matrix.requests["f-1"].signal_id, SignalId(1));
        assert!(matches!(
            matrix.requests["f-2"].schedule,
            FetchSchedule::Conditional {
                trigger_only_on_rising_edge: true,
                ..
            }
        ));
    }
}

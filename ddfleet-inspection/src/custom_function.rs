// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Custom condition functions behind interface dispatch: a registry maps
//! function names to stateful implementations keyed by invocation id.

use crate::eval::{EvalError, EvalResult, InspectionValue};
use crate::raw_buffer::{RawBufferManager, UsageStage};
use crate::types::CollectedSignal;
use ddfleet_common::ids::SignalId;
use ddfleet_common::time::Timestamp;
use ddfleet_common::value::SampleValue;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// Unique per call site: condition index in the upper half, node index in
/// the lower.
pub type InvocationId = u64;

/// Passed to [`CustomFunction::condition_end`] so a function can append its
/// own collected signals to a trigger that fired.
pub struct ConditionEndContext<'a> {
    pub collected_signal_ids: &'a HashSet<SignalId>,
    pub timestamp: Timestamp,
    pub extra_signals: &'a mut Vec<CollectedSignal>,
}

pub trait CustomFunction: Send {
    fn invoke(
        &mut self,
        invocation_id: InvocationId,
        args: &[InspectionValue],
    ) -> EvalResult<InspectionValue>;

    /// Called once per trigger emission so the function can contribute
    /// collected data.
    fn condition_end(&mut self, _ctx: &mut ConditionEndContext<'_>) {}

    /// Drop any state kept for the invocation (the owning condition was
    /// retired).
    fn cleanup(&mut self, _invocation_id: InvocationId) {}
}

#[derive(Default)]
pub struct CustomFunctionRegistry {
    functions: HashMap<String, Box<dyn CustomFunction>>,
}

impl CustomFunctionRegistry {
    pub fn register(&mut self, name: impl Into<String>, function: Box<dyn CustomFunction>) {
        self.functions.insert(name.into(), function);
    }

    pub fn invoke(
        &mut self,
        name: &str,
        invocation_id: InvocationId,
        args: &[InspectionValue],
    ) -> EvalResult<InspectionValue> {
        match self.functions.get_mut(name) {
            Some(function) => function.invoke(invocation_id, args),
            None => Err(EvalError::str(format!("unknown custom function {name}"))),
        }
    }

    pub fn condition_end(&mut self, ctx: &mut ConditionEndContext<'_>) {
        for function in self.functions.values_mut() {
            function.condition_end(ctx);
        }
    }

    pub fn cleanup(&mut self, invocation_id: InvocationId) {
        for function in self.functions.values_mut() {
            function.cleanup(invocation_id);
        }
    }
}

impl std::fmt::Debug for CustomFunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomFunctionRegistry")
            .field("functions", &self.functions.keys())
            .finish()
    }
}

/// Built-in `multi_rising_edge_trigger(name1, cond1, name2, cond2, ...)`.
///
/// Fires when any of the named boolean inputs transitions to true and
/// records which names transitioned; at condition end the names are emitted
/// as a JSON array through the raw buffer manager into a designated signal
/// slot.
pub struct MultiRisingEdgeTrigger {
    output_signal_id: SignalId,
    raw_buffer: Arc<RawBufferManager>,
    states: HashMap<InvocationId, Vec<bool>>,
    triggered_names: Vec<String>,
}

impl MultiRisingEdgeTrigger {
    pub const NAME: &'static str = "multi_rising_edge_trigger";

    pub fn new(output_signal_id: SignalId, raw_buffer: Arc<RawBufferManager>) -> Self {
        MultiRisingEdgeTrigger {
            output_signal_id,
            raw_buffer,
            states: HashMap::new(),
            triggered_names: Vec::new(),
        }
    }

    fn check_pair(args: &[InspectionValue], index: usize) -> EvalResult<(String, Option<bool>)> {
        let InspectionValue::String(name) = &args[index] else {
            return Err(EvalError::str("condition name must be a string"));
        };
        let value = &args[index + 1];
        let current = if value.is_undefined() {
            None
        } else {
            match value.as_bool() {
                Some(b) => Some(b),
                None => return Err(EvalError::str("condition value must be a bool or number")),
            }
        };
        Ok((name.to_string(), current))
    }
}

impl CustomFunction for MultiRisingEdgeTrigger {
    fn invoke(
        &mut self,
        invocation_id: InvocationId,
        args: &[InspectionValue],
    ) -> EvalResult<InspectionValue> {
        if args.len() < 2 || args.len() % 2 != 0 {
            return Err(EvalError::str(
                "multi_rising_edge_trigger takes (name, condition) pairs",
            ));
        }
        let Some(state) = self.states.get_mut(&invocation_id) else {
            // First invocation just records the initial levels.
            let mut initial = Vec::with_capacity(args.len() / 2);
            for i in (0..args.len()).step_by(2) {
                let (_, current) = Self::check_pair(args, i)?;
                // An undefined input counts as high so it cannot fire later
                // without a real transition.
                initial.push(current.unwrap_or(true));
            }
            self.states.insert(invocation_id, initial);
            return Ok(InspectionValue::Bool(false));
        };
        if state.len() != args.len() / 2 {
            return Err(EvalError::str(
                "argument count changed since the first invocation",
            ));
        }

        let mut any_rising_edge = false;
        let mut triggered = Vec::new();
        for i in (0..args.len()).step_by(2) {
            let (name, current) = Self::check_pair(args, i)?;
            let level = current.unwrap_or(true);
            if current == Some(true) && !state[i / 2] {
                any_rising_edge = true;
                triggered.push(name);
            }
            state[i / 2] = level;
        }
        self.triggered_names.extend(triggered);
        Ok(InspectionValue::Bool(any_rising_edge))
    }

    fn condition_end(&mut self, ctx: &mut ConditionEndContext<'_>) {
        if self.triggered_names.is_empty() {
            return;
        }
        let triggered = std::mem::take(&mut self.triggered_names);
        if !ctx.collected_signal_ids.contains(&self.output_signal_id) {
            return;
        }
        let json = match serde_json::to_vec(&triggered) {
            Ok(json) => json,
            Err(e) => {
                warn!(component = "inspection", error = %e, "serializing triggered condition names");
                return;
            }
        };
        let handle = match self
            .raw_buffer
            .push(self.output_signal_id, json.into(), ctx.timestamp)
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!(component = "inspection", error = %e, "no room for triggered condition names");
                return;
            }
        };
        // Claim the upload stage immediately so the handle cannot be evicted
        // before the sender takes over.
        self.raw_buffer
            .increase_usage(handle, UsageStage::SelectedForUpload);
        ctx.extra_signals.push(CollectedSignal {
            signal_id: self.output_signal_id,
            receive_time_ms: ctx.timestamp,
            value: SampleValue::Raw(handle),
        });
    }

    fn cleanup(&mut self, invocation_id: InvocationId) {
        self.states.remove(&invocation_id);
    }
}

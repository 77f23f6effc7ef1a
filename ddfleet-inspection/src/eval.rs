// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Recursive evaluation of campaign condition trees over the engine's
//! per-signal state. Unknown or undefined operands propagate; comparisons
//! against unknown yield undefined; `and`/`or` short-circuit and treat
//! undefined as falsey.

use crate::buffers::SignalHistoryBuffer;
use crate::custom_function::{CustomFunctionRegistry, InvocationId};
use crate::raw_buffer::RawBufferManager;
use ddfleet_campaign::condition::{
    BinaryOp, ConditionArena, ExpressionNode, NodeIndex, UnaryOp,
};
use ddfleet_common::ids::SignalId;
use ddfleet_common::value::SampleValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Result of evaluating any expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum InspectionValue {
    Undefined,
    Bool(bool),
    Number(f64),
    String(Arc<str>),
}

impl InspectionValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            InspectionValue::Bool(b) => Some(*b),
            InspectionValue::Number(n) => Some(*n != 0.0),
            _ => None,
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            InspectionValue::Number(n) => Some(*n),
            InspectionValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, InspectionValue::Undefined)
    }

    /// Boolean coercion used at trigger boundaries: undefined is false.
    pub fn truthy(&self) -> bool {
        self.as_bool().unwrap_or(false)
    }
}

impl fmt::Display for InspectionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InspectionValue::Undefined => write!(f, "undefined"),
            InspectionValue::Bool(b) => write!(f, "{b}"),
            InspectionValue::Number(n) => write!(f, "{n}"),
            InspectionValue::String(s) => write!(f, "{s}"),
        }
    }
}

/// Internal evaluation error, logged by the engine and treated as a
/// non-triggering result.
#[derive(Debug)]
pub struct EvalError(pub String);

impl EvalError {
    pub fn str(msg: impl Into<String>) -> Self {
        EvalError(msg.into())
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub type EvalResult<T> = Result<T, EvalError>;

/// Everything a single evaluation pass reads.
pub struct EvalContext<'a> {
    pub buffers: &'a HashMap<SignalId, SignalHistoryBuffer>,
    pub raw_buffer: &'a RawBufferManager,
    pub functions: &'a mut CustomFunctionRegistry,
    /// Upper half of the invocation id; the node index forms the lower half
    /// so each call site keeps distinct custom function state.
    pub invocation_base: u64,
}

impl EvalContext<'_> {
    fn signal_value(&self, signal: SignalId) -> InspectionValue {
        let Some(buffer) = self.buffers.get(&signal) else {
            return InspectionValue::Undefined;
        };
        match buffer.latest() {
            Some((_, SampleValue::Number(n))) => InspectionValue::Number(n),
            Some((_, SampleValue::Bool(b))) => InspectionValue::Bool(b),
            Some((_, SampleValue::Raw(handle))) => match self.raw_buffer.borrow(handle) {
                Some(bytes) => {
                    InspectionValue::String(String::from_utf8_lossy(&bytes).into())
                }
                None => InspectionValue::Undefined,
            },
            None => InspectionValue::Undefined,
        }
    }
}

pub fn evaluate(
    ctx: &mut EvalContext<'_>,
    arena: &ConditionArena,
    node: NodeIndex,
) -> EvalResult<InspectionValue> {
    match arena.node(node) {
        ExpressionNode::BoolLiteral(b) => Ok(InspectionValue::Bool(*b)),
        ExpressionNode::NumberLiteral(n) => Ok(InspectionValue::Number(*n)),
        ExpressionNode::StringLiteral(s) => Ok(InspectionValue::String(s.as_str().into())),
        ExpressionNode::Signal(id) => Ok(ctx.signal_value(*id)),
        ExpressionNode::Unary { op, operand } => {
            let value = evaluate(ctx, arena, *operand)?;
            Ok(match op {
                UnaryOp::IsNull => InspectionValue::Bool(value.is_undefined()),
                UnaryOp::Not => match value.as_bool() {
                    Some(b) => InspectionValue::Bool(!b),
                    None => InspectionValue::Undefined,
                },
            })
        }
        ExpressionNode::Binary { op, left, right } => match op {
            BinaryOp::And => {
                // Short-circuit; undefined is falsey but not triggering.
                let left = evaluate(ctx, arena, *left)?;
                if !left.truthy() {
                    return Ok(InspectionValue::Bool(false));
                }
                let right = evaluate(ctx, arena, *right)?;
                Ok(InspectionValue::Bool(right.truthy()))
            }
            BinaryOp::Or => {
                let left = evaluate(ctx, arena, *left)?;
                if left.truthy() {
                    return Ok(InspectionValue::Bool(true));
                }
                let right = evaluate(ctx, arena, *right)?;
                Ok(InspectionValue::Bool(right.truthy()))
            }
            _ => {
                let left = evaluate(ctx, arena, *left)?;
                let right = evaluate(ctx, arena, *right)?;
                Ok(apply_binary(*op, &left, &right))
            }
        },
        ExpressionNode::Window {
            signal,
            function,
            window_ms: _,
        } => {
            let value = ctx
                .buffers
                .get(signal)
                .and_then(|b| b.window())
                .and_then(|w| w.previous(*function));
            Ok(match value {
                Some(n) => InspectionValue::Number(n),
                None => InspectionValue::Undefined,
            })
        }
        ExpressionNode::Call { function, args } => {
            let mut arg_values = Vec::with_capacity(args.len());
            for arg in args {
                arg_values.push(evaluate(ctx, arena, *arg)?);
            }
            let invocation: InvocationId = ctx.invocation_base | node as u64;
            ctx.functions.invoke(function, invocation, &arg_values)
        }
    }
}

fn apply_binary(op: BinaryOp, left: &InspectionValue, right: &InspectionValue) -> InspectionValue {
    // String equality is the only string comparison; everything else is
    // numeric.
    if let (InspectionValue::String(a), InspectionValue::String(b)) = (left, right) {
        return match op {
            BinaryOp::Eq => InspectionValue::Bool(a == b),
            BinaryOp::Ne => InspectionValue::Bool(a != b),
            _ => InspectionValue::Undefined,
        };
    }
    let (Some(a), Some(b)) = (left.as_number(), right.as_number()) else {
        return InspectionValue::Undefined;
    };
    match op {
        BinaryOp::Add => InspectionValue::Number(a + b),
        BinaryOp::Sub => InspectionValue::Number(a - b),
        BinaryOp::Mul => InspectionValue::Number(a * b),
        BinaryOp::Div => {
            if b == 0.0 {
                InspectionValue::Undefined
            } else {
                InspectionValue::Number(a / b)
            }
        }
        BinaryOp::Eq => InspectionValue::Bool(a == b),
        BinaryOp::Ne => InspectionValue::Bool(a != b),
        BinaryOp::Gt => InspectionValue::Bool(a > b),
        BinaryOp::Ge => InspectionValue::Bool(a >= b),
        BinaryOp::Lt => InspectionValue::Bool(a < b),
        BinaryOp::Le => InspectionValue::Bool(a <= b),
        BinaryOp::And | BinaryOp::Or => InspectionValue::Undefined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custom_function::CustomFunctionRegistry;
    use crate::raw_buffer::RawBufferConfig;
    use ddfleet_common::metrics::NoopMetrics;
    use serde_json::json;

    fn context<'a>(
        buffers: &'a HashMap<SignalId, SignalHistoryBuffer>,
        raw: &'a RawBufferManager,
        functions: &'a mut CustomFunctionRegistry,
    ) -> EvalContext<'a> {
        EvalContext {
            buffers,
            raw_buffer: raw,
            functions,
            invocation_base: 1 << 32,
        }
    }

    fn eval_doc(doc: serde_json::Value, buffers: &HashMap<SignalId, SignalHistoryBuffer>) -> InspectionValue {
        let raw = RawBufferManager::new(RawBufferConfig::default(), Arc::new(NoopMetrics));
        let mut functions = CustomFunctionRegistry::default();
        let arena = ConditionArena::from_document(&doc).unwrap();
        let mut ctx = context(buffers, &raw, &mut functions);
        evaluate(&mut ctx, &arena, arena.root()).unwrap()
    }

    fn buffer_with(signal: SignalId, samples: &[(u64, f64)], window_ms: u64) -> HashMap<SignalId, SignalHistoryBuffer> {
        let mut buffer = SignalHistoryBuffer::new(16, 0, window_ms);
        for (t, v) in samples {
            buffer.append(*t, SampleValue::Number(*v));
        }
        HashMap::from([(signal, buffer)])
    }

    #[test]
    fn test_comparison_over_latest_sample() {
        let buffers = buffer_with(SignalId(1), &[(0, 50.0), (10, 120.0)], 0);
        let result = eval_doc(
            json!({"op": "gt", "left": {"signal": 1}, "right": {"number": 100.0}}),
            &buffers,
        );
        assert_eq!(result, InspectionValue::Bool(true));
    }

    #[test]
    fn test_unknown_signal_propagates_undefined() {
        let buffers = HashMap::new();
        let result = eval_doc(
            json!({"op": "gt", "left": {"signal": 42}, "right": {"number": 1.0}}),
            &buffers,
        );
        assert_eq!(result, InspectionValue::Undefined);

        // ... but an `and` treats it as falsey.
        let result = eval_doc(
            json!({"op": "and",
                "left": {"op": "gt", "left": {"signal": 42}, "right": {"number": 1.0}},
                "right": {"bool": true}}),
            &buffers,
        );
        assert_eq!(result, InspectionValue::Bool(false));
    }

    #[test]
    fn test_is_null_detects_undefined() {
        let buffers = HashMap::new();
        let result = eval_doc(json!({"is_null": {"signal": 42}}), &buffers);
        assert_eq!(result, InspectionValue::Bool(true));
    }

    #[test]
    fn test_or_short_circuits() {
        let buffers = HashMap::new();
        // Right side references an unknown signal and must not matter.
        let result = eval_doc(
            json!({"op": "or", "right": {"signal": 42}, "left": {"bool": true}}),
            &buffers,
        );
        assert_eq!(result, InspectionValue::Bool(true));
    }

    #[test]
    fn test_window_function_reads_previous_window() {
        let buffers = buffer_with(SignalId(7), &[(10, 4.0), (20, 6.0), (150, 99.0)], 100);
        let result = eval_doc(
            json!({"op": "eq",
                "left": {"window_function": "prev_avg", "signal": 7},
                "right": {"number": 5.0}}),
            &buffers,
        );
        assert_eq!(result, InspectionValue::Bool(true));

        // No completed window yet for a fresh signal.
        let buffers = buffer_with(SignalId(7), &[(10, 4.0)], 100);
        let result = eval_doc(
            json!({"window_function": "prev_max", "signal": 7}),
            &buffers,
        );
        assert_eq!(result, InspectionValue::Undefined);
    }

    #[test]
    fn test_division_by_zero_is_undefined() {
        let buffers = buffer_with(SignalId(1), &[(0, 8.0)], 0);
        let result = eval_doc(
            json!({"op": "div", "left": {"signal": 1}, "right": {"number": 0.0}}),
            &buffers,
        );
        assert_eq!(result, InspectionValue::Undefined);
    }

    #[test]
    fn test_arithmetic_composition() {
        let buffers = buffer_with(SignalId(1), &[(0, 8.0)], 0);
        let result = eval_doc(
            json!({"op": "ge",
                "left": {"op": "mul", "left": {"signal": 1}, "right": {"number": 2.0}},
                "right": {"op": "add", "left": {"number": 10.0}, "right": {"number": 6.0}}}),
            &buffers,
        );
        assert_eq!(result, InspectionValue::Bool(true));
    }
}

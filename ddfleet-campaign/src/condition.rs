// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Campaign trigger conditions as immutable expression trees.
//!
//! Nodes live in a flat arena; child links are indices into the arena and
//! children always precede their parent, so the structure is acyclic by
//! construction and evaluation walks are cache-friendly.
//!
//! Wire shape (one JSON object per node):
//!
//! ```json
//! {"op": "and",
//!  "left": {"op": "gt", "left": {"signal": 1234}, "right": {"number": 100.0}},
//!  "right": {"not": {"is_null": {"signal": 1234}}}}
//! ```
//!
//! Window functions reference a signal and get their width from that
//! signal's `fixed_window_ms` collection config when the owning scheme is
//! built:
//!
//! ```json
//! {"window_function": "prev_avg", "signal": 1234}
//! ```

use ddfleet_common::ids::SignalId;
use ddfleet_common::EdgeError;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

pub type NodeIndex = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Not,
    IsNull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    And,
    Or,
}

impl BinaryOp {
    fn parse(op: &str) -> Option<BinaryOp> {
        Some(match op {
            "add" => BinaryOp::Add,
            "sub" => BinaryOp::Sub,
            "mul" => BinaryOp::Mul,
            "div" => BinaryOp::Div,
            "eq" => BinaryOp::Eq,
            "ne" => BinaryOp::Ne,
            "gt" => BinaryOp::Gt,
            "ge" => BinaryOp::Ge,
            "lt" => BinaryOp::Lt,
            "le" => BinaryOp::Le,
            "and" => BinaryOp::And,
            "or" => BinaryOp::Or,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowFunction {
    PrevLast,
    PrevMin,
    PrevMax,
    PrevAvg,
}

impl WindowFunction {
    fn parse(name: &str) -> Option<WindowFunction> {
        Some(match name {
            "prev_last" => WindowFunction::PrevLast,
            "prev_min" => WindowFunction::PrevMin,
            "prev_max" => WindowFunction::PrevMax,
            "prev_avg" => WindowFunction::PrevAvg,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExpressionNode {
    BoolLiteral(bool),
    NumberLiteral(f64),
    StringLiteral(String),
    Signal(SignalId),
    Unary {
        op: UnaryOp,
        operand: NodeIndex,
    },
    Binary {
        op: BinaryOp,
        left: NodeIndex,
        right: NodeIndex,
    },
    Window {
        signal: SignalId,
        function: WindowFunction,
        /// Filled in from the signal's `fixed_window_ms` when the owning
        /// scheme is built; zero until then.
        window_ms: u64,
    },
    Call {
        function: String,
        args: Vec<NodeIndex>,
    },
}

/// Flat arena holding one condition tree. The root is the last node.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionArena {
    nodes: Vec<ExpressionNode>,
}

impl ConditionArena {
    /// A condition that always holds; used for schemes without a trigger
    /// expression (pure time-based collection).
    pub fn always_true() -> Self {
        ConditionArena {
            nodes: vec![ExpressionNode::BoolLiteral(true)],
        }
    }

    pub fn from_document(doc: &Value) -> Result<Self, EdgeError> {
        let mut arena = ConditionArena { nodes: Vec::new() };
        arena.push_node(doc, 0)?;
        Ok(arena)
    }

    const MAX_DEPTH: usize = 64;

    fn push_node(&mut self, doc: &Value, depth: usize) -> Result<NodeIndex, EdgeError> {
        if depth > Self::MAX_DEPTH {
            return Err(EdgeError::invalid_format("condition tree too deep"));
        }
        let obj = doc
            .as_object()
            .ok_or_else(|| EdgeError::invalid_format("condition node is not an object"))?;

        let node = if let Some(b) = obj.get("bool") {
            ExpressionNode::BoolLiteral(
                b.as_bool()
                    .ok_or_else(|| EdgeError::invalid_format("bool literal is not a bool"))?,
            )
        } else if let Some(n) = obj.get("number") {
            ExpressionNode::NumberLiteral(
                n.as_f64()
                    .ok_or_else(|| EdgeError::invalid_format("number literal is not a number"))?,
            )
        } else if let Some(s) = obj.get("string") {
            ExpressionNode::StringLiteral(
                s.as_str()
                    .ok_or_else(|| EdgeError::invalid_format("string literal is not a string"))?
                    .to_owned(),
            )
        } else if let Some(f) = obj.get("window_function") {
            let function = f
                .as_str()
                .and_then(WindowFunction::parse)
                .ok_or_else(|| EdgeError::invalid_format("unknown window function"))?;
            let signal = signal_id(obj.get("signal"))?;
            ExpressionNode::Window {
                signal,
                function,
                window_ms: 0,
            }
        } else if let Some(s) = obj.get("signal") {
            ExpressionNode::Signal(signal_id(Some(s))?)
        } else if let Some(child) = obj.get("not") {
            let operand = self.push_node(child, depth + 1)?;
            ExpressionNode::Unary {
                op: UnaryOp::Not,
                operand,
            }
        } else if let Some(child) = obj.get("is_null") {
            let operand = self.push_node(child, depth + 1)?;
            ExpressionNode::Unary {
                op: UnaryOp::IsNull,
                operand,
            }
        } else if let Some(op) = obj.get("op") {
            let op = op
                .as_str()
                .and_then(BinaryOp::parse)
                .ok_or_else(|| EdgeError::invalid_format("unknown binary operator"))?;
            let left_doc = obj
                .get("left")
                .ok_or_else(|| EdgeError::invalid_format("binary node is missing 'left'"))?;
            let right_doc = obj
                .get("right")
                .ok_or_else(|| EdgeError::invalid_format("binary node is missing 'right'"))?;
            let left = self.push_node(left_doc, depth + 1)?;
            let right = self.push_node(right_doc, depth + 1)?;
            ExpressionNode::Binary { op, left, right }
        } else if let Some(f) = obj.get("function") {
            let function = f
                .as_str()
                .ok_or_else(|| EdgeError::invalid_format("function name is not a string"))?
                .to_owned();
            let mut args = Vec::new();
            if let Some(arg_docs) = obj.get("args") {
                let arg_docs = arg_docs
                    .as_array()
                    .ok_or_else(|| EdgeError::invalid_format("function args is not an array"))?;
                for arg in arg_docs {
                    args.push(self.push_node(arg, depth + 1)?);
                }
            }
            ExpressionNode::Call { function, args }
        } else {
            return Err(EdgeError::invalid_format(format!(
                "unrecognized condition node: {doc}"
            )));
        };

        self.nodes.push(node);
        Ok(self.nodes.len() - 1)
    }

    pub fn root(&self) -> NodeIndex {
        self.nodes.len() - 1
    }

    pub fn node(&self, index: NodeIndex) -> &ExpressionNode {
        &self.nodes[index]
    }

    pub fn nodes(&self) -> &[ExpressionNode] {
        &self.nodes
    }

    /// Every signal the condition reads, including window operands.
    pub fn referenced_signals(&self) -> HashSet<SignalId> {
        let mut signals = HashSet::new();
        for node in &self.nodes {
            match node {
                ExpressionNode::Signal(id) => {
                    signals.insert(*id);
                }
                ExpressionNode::Window { signal, .. } => {
                    signals.insert(*signal);
                }
                _ => {}
            }
        }
        signals
    }

    /// Resolves each window node's width against the owning scheme's
    /// per-signal `fixed_window_ms`. A window over a signal without a fixed
    /// window is a structural error.
    pub fn resolve_windows(
        &mut self,
        fixed_windows: &HashMap<SignalId, u64>,
    ) -> Result<(), EdgeError> {
        for node in &mut self.nodes {
            if let ExpressionNode::Window {
                signal, window_ms, ..
            } = node
            {
                match fixed_windows.get(signal) {
                    Some(width) if *width > 0 => *window_ms = *width,
                    _ => {
                        return Err(EdgeError::invalid_format(format!(
                            "window function over signal {signal} without fixed_window_ms"
                        )))
                    }
                }
            }
        }
        Ok(())
    }
}

fn signal_id(value: Option<&Value>) -> Result<SignalId, EdgeError> {
    let raw = value
        .and_then(Value::as_u64)
        .ok_or_else(|| EdgeError::invalid_format("signal id is not an unsigned integer"))?;
    u32::try_from(raw)
        .map(SignalId)
        .map_err(|_| EdgeError::invalid_format("signal id exceeds 32 bits"))
}

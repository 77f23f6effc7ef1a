// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Store-and-forward subsystem: durable append-only streams per (campaign,
//! partition) with TTL and byte quotas, plus the cooperative worker that
//! later drains them towards the telemetry sender.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod forwarder;
pub mod jobs;
pub mod manager;
pub mod stream;

pub use forwarder::{ForwardController, ForwardTarget, StreamForwarder};
pub use jobs::ForwardJobHandler;
pub use manager::{AppendResult, PartitionPayload, StreamManager, StreamManagerConfig};
pub use stream::StreamRecord;

// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Contract between the core and the injected transport (MQTT, IPC, ...).
//! The core treats topic strings as opaque.

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

/// Failure modes reported by a transport send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    NoConnection,
    QuotaReached,
    WrongInput,
    TransmissionError,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::NoConnection => write!(f, "no connection"),
            SendError::QuotaReached => write!(f, "transport quota reached"),
            SendError::WrongInput => write!(f, "wrong input"),
            SendError::TransmissionError => write!(f, "transmission error"),
        }
    }
}

impl std::error::Error for SendError {}

/// Topic names injected by the host. All strings are opaque to the core.
#[derive(Debug, Clone, Default)]
pub struct TopicConfig {
    pub telemetry_data_topic: String,
    pub checkin_topic: String,
    pub collection_scheme_topic: String,
    pub decoder_manifest_topic: String,
    pub jobs_topic: String,
}

/// Outbound half of the transport. Implementations may complete sends on any
/// thread; the future resolves when the transport has accepted or rejected
/// the payload.
#[async_trait]
pub trait Sender: Send + Sync {
    fn is_alive(&self) -> bool;

    /// Largest payload the transport will accept, in bytes.
    fn max_send_size(&self) -> usize;

    fn topic_config(&self) -> &TopicConfig;

    async fn send(&self, topic: &str, data: Bytes) -> Result<(), SendError>;
}

/// Inbound half of the transport: subscribe to raw bytes on a topic.
#[async_trait]
pub trait Receiver: Send + Sync {
    async fn subscribe(
        &self,
        topic: &str,
        on_data: Box<dyn Fn(Bytes) + Send + Sync>,
    ) -> Result<(), SendError>;
}

// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic heartbeat publishing the ids of every active artifact. Sleeps
//! until the campaign manager has produced an up-to-date document, then
//! publishes on a fixed cadence, falling back to a short retry interval on
//! send failure.

use crate::manager::CheckinDocument;
use async_trait::async_trait;
use ddfleet_common::metrics::{names, Metrics};
use ddfleet_common::time::Clock;
use ddfleet_common::transport::Sender;
use ddfleet_common::worker::Worker;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Used to issue checkins to the cloud as soon as possible after a failure.
const RETRY_CHECKIN_INTERVAL: Duration = Duration::from_secs(5);

pub const DEFAULT_CHECKIN_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub struct CheckinSender {
    clock: Arc<dyn Clock>,
    sender: Arc<dyn Sender>,
    metrics: Arc<dyn Metrics>,
    document_rx: watch::Receiver<Option<Arc<CheckinDocument>>>,
    checkin_interval: Duration,
    cancellation_token: CancellationToken,
}

impl CheckinSender {
    pub fn new(
        clock: Arc<dyn Clock>,
        sender: Arc<dyn Sender>,
        metrics: Arc<dyn Metrics>,
        document_rx: watch::Receiver<Option<Arc<CheckinDocument>>>,
        checkin_interval: Duration,
        cancellation_token: CancellationToken,
    ) -> Self {
        let checkin_interval = if checkin_interval.is_zero() {
            DEFAULT_CHECKIN_INTERVAL
        } else {
            checkin_interval
        };
        CheckinSender {
            clock,
            sender,
            metrics,
            document_rx,
            checkin_interval,
            cancellation_token,
        }
    }

    async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancellation_token.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn send_checkin(&self, document: &CheckinDocument) -> bool {
        let payload = json!({
            "document_sync_ids": document.document_sync_ids,
            "timestamp_ms_epoch": self.clock.system_time_ms(),
        });
        let bytes = match serde_json::to_vec(&payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(component = "checkin", error = %e, "could not serialize checkin");
                return false;
            }
        };
        debug!(
            component = "checkin",
            documents = document.document_sync_ids.len(),
            "sending checkin"
        );
        let topic = self.sender.topic_config().checkin_topic.clone();
        match self.sender.send(&topic, bytes.into()).await {
            Ok(()) => {
                self.metrics.increment(names::CHECKINS_SENT);
                true
            }
            Err(e) => {
                warn!(component = "checkin", error = %e, "checkin send failed, retrying sooner");
                false
            }
        }
    }
}

#[async_trait]
impl Worker for CheckinSender {
    async fn run(&mut self) {
        loop {
            if self.cancellation_token.is_cancelled() {
                return;
            }
            // The list is only produced once the campaign manager has
            // provided an up-to-date document.
            let document = {
                let wait = self.document_rx.wait_for(|doc| doc.is_some());
                tokio::select! {
                    _ = self.cancellation_token.cancelled() => return,
                    changed = wait => match changed {
                        Ok(doc) => {
                            #[allow(clippy::unwrap_used)] // wait_for guarantees Some
                            let doc = doc.clone().unwrap();
                            doc
                        }
                        // The campaign manager is gone; nothing to report.
                        Err(_) => return,
                    },
                }
            };

            let interval = if self.send_checkin(&document).await {
                self.checkin_interval
            } else {
                RETRY_CHECKIN_INTERVAL.min(self.checkin_interval)
            };
            if !self.sleep(interval).await {
                return;
            }
        }
    }
}

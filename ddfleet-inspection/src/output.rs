// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded priority queue between the inspection engine and the data
//! consumers. Higher campaign priority pops first; within a priority,
//! emission order is preserved. When full, the lowest-priority pending
//! trigger is dropped and counted; pushing never blocks.

use crate::types::TriggeredData;
use ddfleet_common::metrics::{names, Metrics};
use ddfleet_common::{EdgeError, MutexExt};
use priority_queue::DoublePriorityQueue;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::debug;

/// Pop order: campaign priority first, then FIFO by emission sequence.
type QueueRank = (u32, Reverse<u64>);

struct QueueInner {
    ranks: DoublePriorityQueue<u64, QueueRank>,
    items: HashMap<u64, Arc<TriggeredData>>,
    next_seq: u64,
}

pub struct TriggerQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
    metrics: Arc<dyn Metrics>,
}

impl TriggerQueue {
    pub fn new(capacity: usize, metrics: Arc<dyn Metrics>) -> Self {
        TriggerQueue {
            inner: Mutex::new(QueueInner {
                ranks: DoublePriorityQueue::new(),
                items: HashMap::new(),
                next_seq: 0,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            metrics,
        }
    }

    /// Enqueues the trigger, evicting the lowest-priority pending entry on
    /// overflow (which may be the incoming one).
    pub fn push(&self, data: Arc<TriggeredData>) -> Result<(), EdgeError> {
        let mut dropped = None;
        {
            let mut inner = self.inner.lock_or_panic();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.ranks.push(seq, (data.metadata.priority, Reverse(seq)));
            inner.items.insert(seq, data);
            if inner.ranks.len() > self.capacity {
                #[allow(clippy::unwrap_used)] // the queue is non-empty here
                let (seq, _) = inner.ranks.pop_min().unwrap();
                dropped = inner.items.remove(&seq);
            }
        }
        self.notify.notify_waiters();
        if let Some(dropped) = dropped {
            self.metrics.increment(names::TRIGGERS_DROPPED);
            debug!(
                component = "inspection",
                campaign = %dropped.metadata.campaign_sync_id,
                event_id = dropped.event_id,
                "output queue full, dropped lowest priority trigger"
            );
            return Err(EdgeError::QuotaExceeded("trigger output queue"));
        }
        Ok(())
    }

    pub fn try_pop(&self) -> Option<Arc<TriggeredData>> {
        let mut inner = self.inner.lock_or_panic();
        let (seq, _) = inner.ranks.pop_max()?;
        inner.items.remove(&seq)
    }

    /// Waits until an entry is available.
    pub async fn pop(&self) -> Arc<TriggeredData> {
        loop {
            let notified = self.notify.notified();
            if let Some(data) = self.try_pop() {
                return data;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock_or_panic().ranks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TriggerMetadata;
    use ddfleet_common::metrics::InMemoryMetrics;

    fn trigger(priority: u32, event_id: u32) -> Arc<TriggeredData> {
        Arc::new(TriggeredData {
            event_id,
            trigger_time_ms: 0,
            metadata: TriggerMetadata {
                campaign_sync_id: "cs".into(),
                campaign_name: "cs".into(),
                decoder_manifest_id: "dm".into(),
                persist: false,
                compress: false,
                priority,
            },
            signals: Vec::new(),
            dtc_info: None,
        })
    }

    #[test]
    fn test_priority_then_fifo_order() {
        let queue = TriggerQueue::new(8, Arc::new(InMemoryMetrics::new()));
        queue.push(trigger(1, 10)).unwrap();
        queue.push(trigger(5, 20)).unwrap();
        queue.push(trigger(5, 21)).unwrap();
        queue.push(trigger(3, 30)).unwrap();

        let order: Vec<u32> = std::iter::from_fn(|| queue.try_pop().map(|t| t.event_id)).collect();
        assert_eq!(order, vec![20, 21, 30, 10]);
    }

    #[test]
    fn test_overflow_drops_lowest_priority() {
        let metrics = Arc::new(InMemoryMetrics::new());
        let queue = TriggerQueue::new(2, metrics.clone());
        queue.push(trigger(5, 1)).unwrap();
        queue.push(trigger(1, 2)).unwrap();
        // The low-priority entry goes, not the new high-priority one.
        assert!(queue.push(trigger(9, 3)).is_err());
        assert_eq!(metrics.value(names::TRIGGERS_DROPPED), 1);

        let order: Vec<u32> = std::iter::from_fn(|| queue.try_pop().map(|t| t.event_id)).collect();
        assert_eq!(order, vec![3, 1]);
    }

    #[test]
    fn test_overflow_may_drop_the_incoming_trigger() {
        let queue = TriggerQueue::new(1, Arc::new(InMemoryMetrics::new()));
        queue.push(trigger(5, 1)).unwrap();
        assert!(queue.push(trigger(1, 2)).is_err());
        assert_eq!(queue.try_pop().unwrap().event_id, 1);
        assert!(queue.try_pop().is_none());
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(TriggerQueue::new(4, Arc::new(InMemoryMetrics::new())));
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await.event_id })
        };
        tokio::task::yield_now().await;
        queue.push(trigger(1, 77)).unwrap();
        assert_eq!(popper.await.unwrap(), 77);
    }
}

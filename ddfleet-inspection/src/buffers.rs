// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-signal sample history: a bounded ring of timestamped values plus the
//! running aggregate of the current fixed window and the finalized aggregate
//! of the previous one. `prev_*` reads never see the in-flight window.

use ddfleet_campaign::condition::WindowFunction;
use ddfleet_common::time::Timestamp;
use ddfleet_common::value::SampleValue;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowAggregate {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub last_value: f64,
    pub last_timestamp: Timestamp,
}

impl WindowAggregate {
    fn new(timestamp: Timestamp, value: f64) -> Self {
        WindowAggregate {
            count: 1,
            sum: value,
            min: value,
            max: value,
            last_value: value,
            last_timestamp: timestamp,
        }
    }

    fn add(&mut self, timestamp: Timestamp, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.last_value = value;
        self.last_timestamp = timestamp;
    }

    pub fn avg(&self) -> f64 {
        self.sum / self.count as f64
    }
}

/// Fixed-width aggregation windows aligned to multiples of the width.
#[derive(Debug, Clone, Copy)]
pub struct FixedWindow {
    width_ms: u64,
    current_index: u64,
    current: Option<WindowAggregate>,
    previous: Option<WindowAggregate>,
}

impl FixedWindow {
    pub fn new(width_ms: u64) -> Self {
        FixedWindow {
            width_ms,
            current_index: 0,
            current: None,
            previous: None,
        }
    }

    pub fn width_ms(&self) -> u64 {
        self.width_ms
    }

    pub fn add(&mut self, timestamp: Timestamp, value: f64) {
        let index = timestamp / self.width_ms;
        match &mut self.current {
            Some(current) if index == self.current_index => current.add(timestamp, value),
            Some(current) => {
                // Crossing a boundary finalizes the in-flight aggregate.
                self.previous = Some(*current);
                self.current = Some(WindowAggregate::new(timestamp, value));
                self.current_index = index;
            }
            None => {
                self.current = Some(WindowAggregate::new(timestamp, value));
                self.current_index = index;
            }
        }
    }

    /// Reads from the previous completed window; `None` when no window has
    /// completed yet.
    pub fn previous(&self, function: WindowFunction) -> Option<f64> {
        let prev = self.previous.as_ref()?;
        Some(match function {
            WindowFunction::PrevLast => prev.last_value,
            WindowFunction::PrevMin => prev.min,
            WindowFunction::PrevMax => prev.max,
            WindowFunction::PrevAvg => prev.avg(),
        })
    }
}

/// Ring buffer of the last `capacity` samples of one signal, with the
/// per-signal sampling interval filter and a monotonic sequence counter.
#[derive(Debug)]
pub struct SignalHistoryBuffer {
    capacity: usize,
    min_sample_interval_ms: u64,
    samples: VecDeque<(Timestamp, SampleValue)>,
    last_sample_time: Option<Timestamp>,
    sequence: u64,
    window: Option<FixedWindow>,
}

/// Outcome of an append; evicted raw handles must have their history
/// reference released by the caller.
#[derive(Debug, PartialEq)]
pub enum AppendOutcome {
    Stored { evicted: Option<SampleValue> },
    /// Dropped by the min-sample-interval filter.
    TooFrequent,
}

impl SignalHistoryBuffer {
    pub fn new(capacity: usize, min_sample_interval_ms: u64, fixed_window_ms: u64) -> Self {
        SignalHistoryBuffer {
            capacity: capacity.max(1),
            min_sample_interval_ms,
            samples: VecDeque::with_capacity(capacity.max(1)),
            last_sample_time: None,
            sequence: 0,
            window: (fixed_window_ms > 0).then(|| FixedWindow::new(fixed_window_ms)),
        }
    }

    pub fn append(&mut self, timestamp: Timestamp, value: SampleValue) -> AppendOutcome {
        if let Some(last) = self.last_sample_time {
            if timestamp < last + self.min_sample_interval_ms {
                return AppendOutcome::TooFrequent;
            }
        }
        self.last_sample_time = Some(timestamp);
        self.sequence += 1;
        let evicted = if self.samples.len() == self.capacity {
            self.samples.pop_front().map(|(_, v)| v)
        } else {
            None
        };
        self.samples.push_back((timestamp, value));
        if let (Some(window), Some(number)) = (&mut self.window, value.as_number()) {
            window.add(timestamp, number);
        }
        AppendOutcome::Stored { evicted }
    }

    pub fn latest(&self) -> Option<(Timestamp, SampleValue)> {
        self.samples.back().copied()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn window(&self) -> Option<&FixedWindow> {
        self.window.as_ref()
    }

    /// Samples taken at or after `since`, oldest first, at most `limit`
    /// newest ones.
    pub fn samples_since(
        &self,
        since: Timestamp,
        limit: usize,
    ) -> impl Iterator<Item = (Timestamp, SampleValue)> + '_ {
        let matching = self.samples.iter().filter(move |(t, _)| *t >= since).count();
        self.samples
            .iter()
            .filter(move |(t, _)| *t >= since)
            .skip(matching.saturating_sub(limit))
            .copied()
    }

    /// Raw handles currently held by the history, released on reconfigure.
    pub fn raw_handles(&self) -> impl Iterator<Item = SampleValue> + '_ {
        self.samples
            .iter()
            .filter(|(_, v)| matches!(v, SampleValue::Raw(_)))
            .map(|(_, v)| *v)
    }

    /// The sampling interval may be retuned without discarding history.
    pub fn set_min_sample_interval(&mut self, min_sample_interval_ms: u64) {
        self.min_sample_interval_ms = min_sample_interval_ms;
    }

    /// True when the new spec can keep the accumulated state.
    pub fn compatible_with(&self, capacity: usize, fixed_window_ms: u64) -> bool {
        self.capacity == capacity.max(1)
            && self.window.map(|w| w.width_ms).unwrap_or(0) == fixed_window_ms
    }
}

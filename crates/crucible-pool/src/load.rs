//! Load statistics: exponentially decaying averages of executor usage.
//!
//! Three time scales per metric (10-second, 1-minute, 1-hour), all fed
//! from the same fixed clock tick: the short series updates every tick,
//! the minute series every 6th, the hour series every 360th. Consumers
//! read immutable snapshots; nothing here is updated per event.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

const DECAY: f64 = 0.9;
const HISTORY: usize = 60;

/// A single decaying time series.
#[derive(Debug, Clone)]
pub struct TimeSeries {
    latest: f64,
    decay: f64,
    history: VecDeque<f64>,
}

impl TimeSeries {
    pub fn new(initial: f64) -> Self {
        Self {
            latest: initial,
            decay: DECAY,
            history: VecDeque::with_capacity(HISTORY),
        }
    }

    pub fn update(&mut self, value: f64) {
        self.latest = self.latest * self.decay + value * (1.0 - self.decay);
        if self.history.len() == HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(self.latest);
    }

    pub fn latest(&self) -> f64 {
        self.latest
    }

    pub fn history(&self) -> impl Iterator<Item = f64> + '_ {
        self.history.iter().copied()
    }
}

/// One metric tracked at three resolutions.
#[derive(Debug, Clone)]
pub struct MultiStageTimeSeries {
    sec10: TimeSeries,
    min: TimeSeries,
    hour: TimeSeries,
    ticks: u64,
}

impl MultiStageTimeSeries {
    pub fn new(initial: f64) -> Self {
        Self {
            sec10: TimeSeries::new(initial),
            min: TimeSeries::new(initial),
            hour: TimeSeries::new(initial),
            ticks: 0,
        }
    }

    /// Feed one sample from the shared 10-second clock.
    pub fn update(&mut self, value: f64) {
        self.ticks += 1;
        self.sec10.update(value);
        if self.ticks % 6 == 0 {
            self.min.update(value);
        }
        if self.ticks % 360 == 0 {
            self.hour.update(value);
        }
    }

    pub fn snapshot(&self) -> StageValues {
        StageValues {
            sec10: self.sec10.latest(),
            min: self.min.latest(),
            hour: self.hour.latest(),
        }
    }
}

/// One raw observation of the system, taken on the statistics tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadSample {
    pub busy_executors: usize,
    pub online_executors: usize,
    pub idle_executors: usize,
    pub queue_length: usize,
}

/// Decaying counters for one scope (a single computer, or engine-wide).
#[derive(Debug, Clone)]
pub struct LoadStatistics {
    busy_executors: MultiStageTimeSeries,
    online_executors: MultiStageTimeSeries,
    idle_executors: MultiStageTimeSeries,
    queue_length: MultiStageTimeSeries,
}

impl LoadStatistics {
    pub fn new() -> Self {
        Self {
            busy_executors: MultiStageTimeSeries::new(0.0),
            online_executors: MultiStageTimeSeries::new(0.0),
            idle_executors: MultiStageTimeSeries::new(0.0),
            queue_length: MultiStageTimeSeries::new(0.0),
        }
    }

    pub fn update(&mut self, sample: LoadSample) {
        self.busy_executors.update(sample.busy_executors as f64);
        self.online_executors.update(sample.online_executors as f64);
        self.idle_executors.update(sample.idle_executors as f64);
        self.queue_length.update(sample.queue_length as f64);
    }

    pub fn snapshot(&self) -> LoadSnapshot {
        LoadSnapshot {
            busy_executors: self.busy_executors.snapshot(),
            online_executors: self.online_executors.snapshot(),
            idle_executors: self.idle_executors.snapshot(),
            queue_length: self.queue_length.snapshot(),
        }
    }
}

impl Default for LoadStatistics {
    fn default() -> Self {
        Self::new()
    }
}

/// The three-scale view of one metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageValues {
    pub sec10: f64,
    pub min: f64,
    pub hour: f64,
}

/// Read-only snapshot consumed by trend views and provisioning logic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LoadSnapshot {
    pub busy_executors: StageValues,
    pub online_executors: StageValues,
    pub idle_executors: StageValues,
    pub queue_length: StageValues,
}

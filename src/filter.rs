//! Sliding-window filters for ranging samples.
//!
//! Raw RSSI and distance readings from a tag are noisy. The Searching
//! operation runs each sample through a [`RollingMinimum`] (rejects spikes
//! above the recent floor), then a [`MovingAverage`], and reports the
//! accumulated mean at a capped rate through [`ProximitySmoother`].
//!
//! # Example
//!
//! ```
//! use rtls_provider::filter::RollingMinimum;
//!
//! let mut filter = RollingMinimum::new(3);
//! for v in [5, 3, 8, 1] {
//!     filter.add(v);
//! }
//! assert_eq!(filter.minimum(), Some(1));
//! ```

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// Minimum over the last `capacity` samples, evicted in arrival order.
#[derive(Debug, Clone)]
pub struct RollingMinimum {
    window: VecDeque<i32>,
    capacity: usize,
    minimum: Option<i32>,
}

impl RollingMinimum {
    /// Create a filter over `capacity` samples (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            minimum: None,
        }
    }

    /// Add a sample and return the minimum of the updated window.
    ///
    /// The window is small, so the minimum is recomputed by linear scan.
    pub fn add(&mut self, value: i32) -> i32 {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(value);

        let minimum = self.window.iter().copied().min().unwrap_or(value);
        self.minimum = Some(minimum);
        minimum
    }

    /// Minimum of the current window, `None` before the first sample.
    pub fn minimum(&self) -> Option<i32> {
        self.minimum
    }

    /// Samples in arrival order.
    pub fn window(&self) -> impl Iterator<Item = i32> + '_ {
        self.window.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.window.clear();
        self.minimum = None;
    }
}

/// Arithmetic mean of the last `window` samples.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    samples: VecDeque<f64>,
    window: usize,
    sum: f64,
}

impl MovingAverage {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            samples: VecDeque::with_capacity(window),
            window,
            sum: 0.0,
        }
    }

    /// Push a sample and return the mean of the updated window.
    pub fn next_value(&mut self, value: f64) -> f64 {
        if self.samples.len() == self.window {
            if let Some(oldest) = self.samples.pop_front() {
                self.sum -= oldest;
            }
        }
        self.samples.push_back(value);
        self.sum += value;
        self.sum / self.samples.len() as f64
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.sum = 0.0;
    }
}

/// Smoothed reading emitted at most once per reporting interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProximityReport {
    /// Mean smoothed RSSI in dBm.
    pub rssi: f64,
    /// Mean smoothed distance in centimetres.
    pub distance_cm: f64,
    /// Raw samples folded into this report.
    pub samples: u32,
}

/// Two-stage RSSI/distance pipeline with a rate-capped report.
#[derive(Debug, Clone)]
pub struct ProximitySmoother {
    rssi_floor: RollingMinimum,
    distance_floor: RollingMinimum,
    rssi_average: MovingAverage,
    distance_average: MovingAverage,
    rssi_sum: f64,
    distance_sum: f64,
    samples: u32,
    min_samples: u32,
    interval: Duration,
    last_report: Instant,
}

impl ProximitySmoother {
    /// Create a smoother.
    ///
    /// `rolling_window` sizes the minimum filters, `average_window` the
    /// moving averages. A report needs at least `min_samples` samples and
    /// `interval` elapsed since `now` or the previous report.
    pub fn new(
        rolling_window: usize,
        average_window: usize,
        min_samples: u32,
        interval: Duration,
        now: Instant,
    ) -> Self {
        Self {
            rssi_floor: RollingMinimum::new(rolling_window),
            distance_floor: RollingMinimum::new(rolling_window),
            rssi_average: MovingAverage::new(average_window),
            distance_average: MovingAverage::new(average_window),
            rssi_sum: 0.0,
            distance_sum: 0.0,
            samples: 0,
            min_samples: min_samples.max(1),
            interval,
            last_report: now,
        }
    }

    /// Feed one raw sample; returns a report when one is due.
    pub fn push(&mut self, rssi: i32, distance_cm: i32, now: Instant) -> Option<ProximityReport> {
        let rssi = self.rssi_average.next_value(self.rssi_floor.add(rssi) as f64);
        let distance = self
            .distance_average
            .next_value(self.distance_floor.add(distance_cm) as f64);

        self.rssi_sum += rssi;
        self.distance_sum += distance;
        self.samples += 1;

        if self.samples < self.min_samples || now.duration_since(self.last_report) < self.interval {
            return None;
        }

        let count = self.samples as f64;
        let report = ProximityReport {
            rssi: self.rssi_sum / count,
            distance_cm: self.distance_sum / count,
            samples: self.samples,
        };

        self.rssi_sum = 0.0;
        self.distance_sum = 0.0;
        self.samples = 0;
        self.last_report = now;
        Some(report)
    }

    /// Samples accumulated since the last report.
    pub fn pending_samples(&self) -> u32 {
        self.samples
    }
}

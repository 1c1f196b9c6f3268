use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Samples older than this (relative to the newest) are discarded.
pub const SAMPLE_WINDOW_MS: i64 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Speed {
    /// Not enough samples yet.
    Calculating,
    BytesPerSecond(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeLeft {
    NotApplicable,
    Infinite,
    Seconds(u64),
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    elapsed_ms: i64,
    position: u64,
}

/// Sliding-window throughput estimator fed with (elapsed, position) pairs.
#[derive(Debug, Clone, Default)]
pub struct ThroughputEstimator {
    samples: VecDeque<Sample>,
}

impl ThroughputEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }

    pub fn sample(&mut self, elapsed_ms: i64, position: u64) {
        if let Some(last) = self.samples.back() {
            if elapsed_ms < last.elapsed_ms {
                // The clock restarted; shift history so it ends at the new reading.
                let shift = last.elapsed_ms - elapsed_ms;
                for sample in self.samples.iter_mut() {
                    sample.elapsed_ms -= shift;
                }
            }
        }

        self.samples.push_back(Sample {
            elapsed_ms,
            position,
        });

        while let Some(oldest) = self.samples.front() {
            if elapsed_ms - oldest.elapsed_ms > SAMPLE_WINDOW_MS {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn current_speed(&self) -> Speed {
        let (Some(oldest), Some(newest)) = (self.samples.front(), self.samples.back()) else {
            return Speed::Calculating;
        };
        if self.samples.len() < 2 || newest.elapsed_ms <= oldest.elapsed_ms {
            return Speed::Calculating;
        }

        let bytes = newest.position.saturating_sub(oldest.position) as f64;
        let millis = (newest.elapsed_ms - oldest.elapsed_ms) as f64;
        Speed::BytesPerSecond(bytes * 1000.0 / millis)
    }

    /// Remaining time; callers pass whether the transfer is moving data.
    pub fn time_left(&self, transferring: bool, file_size: u64, position: u64) -> TimeLeft {
        if !transferring {
            return TimeLeft::NotApplicable;
        }
        match self.current_speed() {
            Speed::BytesPerSecond(speed) if speed > 0.0 && file_size > 0 => {
                let remaining = file_size.saturating_sub(position) as f64;
                TimeLeft::Seconds((remaining / speed).ceil() as u64)
            }
            _ => TimeLeft::Infinite,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.samples.len()
    }
}

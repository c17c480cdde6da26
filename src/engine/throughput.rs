/// One progress observation: milliseconds since the attempt started and the
/// number of bytes handed to the transport so far.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sample {
    pub timestamp_ms: u64,
    pub bytes: u64,
}

/// Estimates transfer rate from consecutive progress samples.
///
/// Only the previous sample is kept. With `smoothing` set, each new rate is
/// blended into the previous estimate as an exponential moving average.
#[derive(Clone, Debug, Default)]
pub struct ThroughputSampler {
    last: Option<Sample>,
    rate: Option<f64>,
    smoothing: Option<f64>,
}

impl ThroughputSampler {
    pub fn new() -> Self {
        Self::default()
    }

    /// `alpha` is the weight of the newest rate, clamped to `0.0..=1.0`.
    #[allow(dead_code)]
    pub fn smoothed(alpha: f64) -> Self {
        Self {
            smoothing: Some(alpha.clamp(0.0, 1.0)),
            ..Self::default()
        }
    }

    /// Forget everything and start over from `origin`.
    pub fn reset(&mut self, origin: Sample) {
        self.last = Some(origin);
        self.rate = None;
    }

    /// Feed a sample and return the current rate in bytes per second.
    ///
    /// Returns `None` until two samples have been seen. A sample that does
    /// not advance the clock keeps the previous rate and the previous sample.
    pub fn sample(&mut self, timestamp_ms: u64, bytes: u64) -> Option<f64> {
        let current = Sample {
            timestamp_ms,
            bytes,
        };
        let Some(previous) = self.last else {
            self.last = Some(current);
            return None;
        };
        if timestamp_ms <= previous.timestamp_ms {
            return self.rate;
        }

        let elapsed_ms = (timestamp_ms - previous.timestamp_ms) as f64;
        let delta = bytes.saturating_sub(previous.bytes) as f64;
        let instant = delta * 1000.0 / elapsed_ms;
        let rate = match (self.smoothing, self.rate) {
            (Some(alpha), Some(prev)) => alpha * instant + (1.0 - alpha) * prev,
            _ => instant,
        };

        self.last = Some(current);
        self.rate = Some(rate);
        Some(rate)
    }

    #[allow(dead_code)]
    pub fn last_sample(&self) -> Option<Sample> {
        self.last
    }

    #[allow(dead_code)]
    pub fn rate(&self) -> Option<f64> {
        self.rate
    }
}

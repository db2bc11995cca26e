//! Per-source clock mapping
//!
//! Maps a source's native timestamps onto the session timeline with an
//! offset-and-slope model. The offset is taken from the first observation;
//! the slope is re-estimated by least squares over recent
//! (native, reference) pairs every `reanchor` of native time. Each
//! re-estimate rebases the line at the current point so the mapping never
//! jumps.

use crate::config::tuning::PipelineTuning;
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ClockMapper {
    window: usize,
    reanchor: f64,
    max_ratio: f64,
    /// (native, session) point the line passes through
    anchor: Option<(f64, f64)>,
    slope: f64,
    samples: VecDeque<(f64, f64)>,
    last_fit: f64,
    last_output: f64,
    reanchor_pending: bool,
}

impl ClockMapper {
    pub fn new(window: usize, reanchor: Duration, max_ratio: f64) -> Self {
        Self {
            window: window.max(2),
            reanchor: reanchor.as_secs_f64(),
            max_ratio: max_ratio.abs(),
            anchor: None,
            slope: 1.0,
            samples: VecDeque::new(),
            last_fit: 0.0,
            last_output: 0.0,
            reanchor_pending: false,
        }
    }

    pub fn from_tuning(tuning: &PipelineTuning) -> Self {
        Self::new(
            tuning.drift_window,
            tuning.drift_reanchor(),
            tuning.max_drift_ratio,
        )
    }

    /// Session seconds per native second
    pub fn slope(&self) -> f64 {
        self.slope
    }

    /// Take a fresh offset from the next observation, keeping the slope.
    /// Used after a pause, where native time ran on but session time did
    /// not.
    pub fn reanchor_next(&mut self) {
        self.reanchor_pending = true;
    }

    /// Record a pair and return the session time for `native`. The result
    /// never decreases from one call to the next.
    pub fn observe(&mut self, native: Duration, reference: Duration) -> Duration {
        let n = native.as_secs_f64();
        let r = reference.as_secs_f64();

        if self.anchor.is_none() || self.reanchor_pending {
            self.anchor = Some((n, r.max(self.last_output)));
            self.samples.clear();
            self.last_fit = n;
            self.reanchor_pending = false;
        }

        self.samples.push_back((n, r));
        while self.samples.len() > self.window {
            self.samples.pop_front();
        }

        if n - self.last_fit >= self.reanchor && self.samples.len() >= 2 {
            if let Some(fitted) = fit_slope(&self.samples) {
                let here = self.line(n);
                self.anchor = Some((n, here));
                self.slope = fitted.clamp(1.0 - self.max_ratio, 1.0 + self.max_ratio);
                tracing::debug!("Clock slope re-estimated: {:.6}", self.slope);
            }
            self.last_fit = n;
        }

        let out = self.line(n).max(self.last_output);
        self.last_output = out;
        Duration::from_secs_f64(out.max(0.0))
    }

    /// Map without recording a pair
    pub fn map(&self, native: Duration) -> Duration {
        let out = self.line(native.as_secs_f64()).max(self.last_output);
        Duration::from_secs_f64(out.max(0.0))
    }

    fn line(&self, n: f64) -> f64 {
        match self.anchor {
            Some((an, ar)) => ar + (n - an) * self.slope,
            None => n,
        }
    }
}

/// Least-squares slope of reference over native
fn fit_slope(samples: &VecDeque<(f64, f64)>) -> Option<f64> {
    let count = samples.len() as f64;
    let mean_n = samples.iter().map(|s| s.0).sum::<f64>() / count;
    let mean_r = samples.iter().map(|s| s.1).sum::<f64>() / count;
    let (mut cov, mut var) = (0.0, 0.0);
    for &(n, r) in samples {
        cov += (n - mean_n) * (r - mean_r);
        var += (n - mean_n) * (n - mean_n);
    }
    if var < 1e-9 {
        return None;
    }
    Some(cov / var)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[test]
    fn offset_fixed_at_first_sample() {
        let mut mapper = ClockMapper::new(32, secs(5.0), 0.05);
        // Device clock started long before the session
        let out = mapper.observe(secs(100.0), secs(0.25));
        assert_relative_eq!(out.as_secs_f64(), 0.25, epsilon = 1e-9);
        let out = mapper.observe(secs(101.0), secs(1.25));
        assert_relative_eq!(out.as_secs_f64(), 1.25, epsilon = 1e-9);
    }

    #[test]
    fn learns_skew_of_fast_device() {
        // Device runs 0.2 % fast: 1.002 native seconds per session second
        let mut mapper = ClockMapper::new(32, secs(1.0), 0.05);
        let mut last = Duration::ZERO;
        for i in 0..200 {
            let session = i as f64 * 0.1;
            let out = mapper.observe(secs(session * 1.002), secs(session));
            assert!(out >= last);
            last = out;
        }
        assert_relative_eq!(mapper.slope(), 1.0 / 1.002, epsilon = 1e-6);
        // Late mapping stays close to the reference
        let mapped = mapper.map(secs(19.9 * 1.002)).as_secs_f64();
        assert!((mapped - 19.9).abs() < 0.01, "{}", mapped);
    }

    #[test]
    fn slope_is_clamped() {
        let mut mapper = ClockMapper::new(8, secs(0.5), 0.05);
        for i in 0..20 {
            let t = i as f64 * 0.1;
            mapper.observe(secs(t), secs(t * 2.0));
        }
        assert_relative_eq!(mapper.slope(), 1.05, epsilon = 1e-9);
    }

    #[test]
    fn output_never_decreases() {
        let mut mapper = ClockMapper::new(8, secs(5.0), 0.05);
        let a = mapper.observe(secs(1.0), secs(1.0));
        // Out-of-order native stamp
        let b = mapper.observe(secs(0.5), secs(1.1));
        assert!(b >= a);
    }

    #[test]
    fn reanchor_after_gap_keeps_monotonic() {
        let mut mapper = ClockMapper::new(8, secs(5.0), 0.05);
        mapper.observe(secs(10.0), secs(0.0));
        mapper.observe(secs(12.0), secs(2.0));
        // Paused for 3 s: native ran on, session did not
        mapper.reanchor_next();
        let out = mapper.observe(secs(15.0), secs(2.0));
        assert_relative_eq!(out.as_secs_f64(), 2.0, epsilon = 1e-9);
        let out = mapper.observe(secs(16.0), secs(3.0));
        assert_relative_eq!(out.as_secs_f64(), 3.0, epsilon = 1e-9);
    }
}

//! Frame-to-frame motion gating.
//!
//! Samples are only taken from a still camera: the mean absolute gray-level
//! difference against the previous frame must be under a threshold. During
//! intrinsic collection a minimum time between accepted samples is also
//! enforced so near-identical views are not collected twice.

use image::GrayImage;
use log::debug;

/// Tunables of the [`MotionGate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionGateConfig {
    /// Maximum mean absolute difference (gray levels) of a still frame.
    pub diff_threshold: f64,
    /// Minimum time between accepted samples, in seconds.
    pub time_threshold: f64,
}

impl Default for MotionGateConfig {
    fn default() -> Self {
        MotionGateConfig {
            diff_threshold: 2.5,
            time_threshold: 4.0,
        }
    }
}

/// Keeps an owned copy of the last frame it saw and the time of the last
/// recorded sample.
#[derive(Debug, Clone, Default)]
pub struct MotionGate {
    config: MotionGateConfig,
    previous: Option<GrayImage>,
    last_sample_time: Option<f64>,
    last_difference: Option<f64>,
}

impl MotionGate {
    pub fn new(config: MotionGateConfig) -> Self {
        MotionGate {
            config,
            ..Default::default()
        }
    }

    pub fn config(&self) -> &MotionGateConfig {
        &self.config
    }

    /// Mean absolute difference between `frame` and the previous frame, then
    /// remembers `frame` as the previous one.
    ///
    /// Returns `None` when there is nothing to compare against: on the first
    /// frame, and when the frame size changed (the gate primes again).
    pub fn difference(&mut self, frame: &GrayImage) -> Option<f64> {
        let diff = match &self.previous {
            Some(previous) if previous.dimensions() == frame.dimensions() => {
                Some(mean_absolute_difference(previous, frame))
            }
            _ => None,
        };
        match (diff, self.previous.as_mut()) {
            (Some(_), Some(previous)) => previous.copy_from_slice(frame.as_raw()),
            _ => self.previous = Some(frame.clone()),
        }
        self.last_difference = diff;
        diff
    }

    /// True when a sample may be taken at time `now` (seconds).
    pub fn time_open(&self, now: f64) -> bool {
        self.last_sample_time
            .map_or(true, |t| now - t > self.config.time_threshold)
    }

    /// Whether `frame` is still enough, and far enough in time from the last
    /// recorded sample, to be used as a sample.
    ///
    /// The previous frame is always replaced by `frame`. The sample time is
    /// not committed here; call [`MotionGate::record_sample`] once the frame
    /// actually produced a sample.
    pub fn accept(&mut self, frame: &GrayImage, now: f64) -> bool {
        let Some(diff) = self.difference(frame) else {
            debug!("Motion gate primed");
            return false;
        };
        let accepted = self.time_open(now) && diff < self.config.diff_threshold;
        debug!("Motion gate diff {:.3} accepted {}", diff, accepted);
        accepted
    }

    pub fn record_sample(&mut self, now: f64) {
        self.last_sample_time = Some(now);
    }

    /// The frame the next difference is taken against.
    pub fn previous_frame(&self) -> Option<&GrayImage> {
        self.previous.as_ref()
    }

    /// Makes `frame` the previous frame without taking a difference.
    pub fn prime(&mut self, frame: &GrayImage) {
        self.previous = Some(frame.clone());
        self.last_difference = None;
    }

    pub fn last_difference(&self) -> Option<f64> {
        self.last_difference
    }

    pub fn reset(&mut self) {
        self.previous = None;
        self.last_sample_time = None;
        self.last_difference = None;
    }
}

fn mean_absolute_difference(a: &GrayImage, b: &GrayImage) -> f64 {
    let total: u64 = a
        .as_raw()
        .iter()
        .zip(b.as_raw().iter())
        .map(|(&x, &y)| x.abs_diff(y) as u64)
        .sum();
    let count = a.as_raw().len().max(1);
    total as f64 / count as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn frame(value: u8) -> GrayImage {
        GrayImage::from_pixel(32, 24, Luma([value]))
    }

    #[test]
    fn test_first_frame_primes() {
        let mut gate = MotionGate::default();
        assert!(!gate.accept(&frame(10), 100.0));
        assert_eq!(gate.last_difference(), None);
    }

    #[test]
    fn test_identical_frames_accepted() {
        let mut gate = MotionGate::default();
        gate.accept(&frame(10), 0.0);
        assert!(gate.accept(&frame(10), 0.1));
        assert_eq!(gate.last_difference(), Some(0.0));
    }

    #[test]
    fn test_motion_rejected() {
        let mut gate = MotionGate::default();
        gate.accept(&frame(10), 0.0);
        assert!(!gate.accept(&frame(20), 10.0));
        assert_eq!(gate.last_difference(), Some(10.0));
        // The moved frame is now the reference.
        assert!(gate.accept(&frame(20), 10.5));
    }

    #[test]
    fn test_time_threshold_after_sample() {
        let mut gate = MotionGate::new(MotionGateConfig {
            diff_threshold: 2.5,
            time_threshold: 4.0,
        });
        gate.accept(&frame(50), 0.0);
        assert!(gate.accept(&frame(50), 1.0));
        gate.record_sample(1.0);

        for t in [1.5, 3.0, 4.9, 5.0] {
            assert!(!gate.accept(&frame(50), t), "accepted at {}", t);
        }
        assert!(gate.accept(&frame(50), 5.01));
    }

    #[test]
    fn test_resolution_change_reprimes() {
        let mut gate = MotionGate::default();
        gate.accept(&frame(10), 0.0);
        let other = GrayImage::from_pixel(16, 16, Luma([10u8]));
        assert!(!gate.accept(&other, 1.0));
        assert!(gate.accept(&other, 2.0));
    }

    #[test]
    fn test_reset_clears_state() {
        let mut gate = MotionGate::default();
        gate.accept(&frame(10), 0.0);
        gate.record_sample(0.0);
        gate.reset();
        assert!(gate.time_open(0.5));
        assert!(!gate.accept(&frame(10), 0.5));
    }

    #[test]
    fn test_primed_gate_compares_first_frame() {
        let mut source = MotionGate::default();
        source.accept(&frame(10), 0.0);
        let mut gate = MotionGate::default();
        gate.prime(source.previous_frame().unwrap());
        assert_eq!(gate.last_difference(), None);
        assert!(gate.accept(&frame(11), 0.0));
        assert_eq!(gate.last_difference(), Some(1.0));
    }
}

//! Track level meters
//!
//! Peak holds the block maximum and falls back exponentially; RMS blends
//! each block's RMS into the running value with a frame-count-aware
//! coefficient, so meters behave the same at any block size.

use crate::effect::time_to_coeff;
use crate::types::StereoBuffer;

use super::controls::TrackControls;

/// Peak fall-back time constant
const PEAK_DECAY_MS: f32 = 300.0;

/// RMS integration time constant
const RMS_WINDOW_MS: f32 = 150.0;

#[derive(Debug, Clone)]
pub(crate) struct MeterState {
    peak: [f32; 2],
    rms: [f32; 2],
    peak_coeff: f32,
    rms_coeff: f32,
}

impl MeterState {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            peak: [0.0; 2],
            rms: [0.0; 2],
            peak_coeff: time_to_coeff(PEAK_DECAY_MS, sample_rate),
            rms_coeff: time_to_coeff(RMS_WINDOW_MS, sample_rate),
        }
    }

    pub fn prepare(&mut self, sample_rate: f32) {
        *self = Self::new(sample_rate);
    }

    /// Fold one block into the meters and publish them
    pub fn update(&mut self, buffer: &StereoBuffer, controls: &TrackControls) {
        let frames = buffer.len();
        if frames == 0 {
            return;
        }

        let mut block_peak = [0.0f32; 2];
        let mut sum_sq = [0.0f32; 2];
        for s in buffer.iter() {
            block_peak[0] = block_peak[0].max(s.left.abs());
            block_peak[1] = block_peak[1].max(s.right.abs());
            sum_sq[0] += s.left * s.left;
            sum_sq[1] += s.right * s.right;
        }

        let peak_decay = self.peak_coeff.powi(frames as i32);
        let rms_keep = self.rms_coeff.powi(frames as i32);
        for ch in 0..2 {
            self.peak[ch] = block_peak[ch].max(self.peak[ch] * peak_decay);
            let block_rms = (sum_sq[ch] / frames as f32).sqrt();
            self.rms[ch] = rms_keep * self.rms[ch] + (1.0 - rms_keep) * block_rms;
        }

        controls.store_meters(self.peak[0], self.peak[1], self.rms[0], self.rms[1]);
    }

    /// Drop to zero immediately (mute, inactive)
    pub fn clear(&mut self, controls: &TrackControls) {
        self.peak = [0.0; 2];
        self.rms = [0.0; 2];
        controls.store_meters(0.0, 0.0, 0.0, 0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StereoSample;

    fn constant(value: f32, frames: usize) -> StereoBuffer {
        StereoBuffer::from_vec(vec![StereoSample::new(value, value * 0.5); frames])
    }

    #[test]
    fn test_peak_tracks_block_maximum() {
        let controls = TrackControls::new();
        let mut meter = MeterState::new(48000.0);
        meter.update(&constant(0.8, 256), &controls);
        let reading = controls.meters();
        assert_eq!(reading.peak_l, 0.8);
        assert_eq!(reading.peak_r, 0.4);
    }

    #[test]
    fn test_peak_decays_monotonically() {
        let controls = TrackControls::new();
        let mut meter = MeterState::new(48000.0);
        meter.update(&constant(1.0, 256), &controls);

        let mut last = controls.meters().peak_l;
        for _ in 0..20 {
            meter.update(&constant(0.0, 256), &controls);
            let now = controls.meters().peak_l;
            assert!(now < last);
            last = now;
        }
        assert!(last > 0.0);
    }

    #[test]
    fn test_rms_converges() {
        let controls = TrackControls::new();
        let mut meter = MeterState::new(48000.0);
        for _ in 0..200 {
            meter.update(&constant(0.5, 512), &controls);
        }
        assert!((controls.meters().rms_l - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_clear_zeroes_meters() {
        let controls = TrackControls::new();
        let mut meter = MeterState::new(48000.0);
        meter.update(&constant(0.9, 64), &controls);
        meter.clear(&controls);
        assert_eq!(controls.meters(), Default::default());
    }
}

//! Feed-forward compressor
//!
//! Peak detector on the louder channel, static gain curve in dB and a
//! smoothed gain that moves at the attack rate when reducing and at the
//! release rate when recovering.

use serde::{Deserialize, Serialize};

use super::{db_to_linear, linear_to_db, time_to_coeff, BankStage};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressorParams {
    pub threshold_db: f32,
    /// Input:output ratio above threshold (≥ 1)
    pub ratio: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
    pub makeup_db: f32,
}

impl Default for CompressorParams {
    fn default() -> Self {
        Self {
            threshold_db: -18.0,
            ratio: 4.0,
            attack_ms: 10.0,
            release_ms: 100.0,
            makeup_db: 0.0,
        }
    }
}

#[derive(Debug, Default)]
pub struct Compressor {
    pub params: CompressorParams,
    sample_rate: f32,
    /// Smoothed gain change in dB (≤ 0)
    gain_db: f32,
}

/// Static gain reduction in dB for a detector level
#[inline]
fn compute_gain_db(level_db: f32, threshold_db: f32, ratio: f32) -> f32 {
    if level_db <= threshold_db {
        0.0
    } else {
        let compressed = threshold_db + (level_db - threshold_db) / ratio;
        compressed - level_db
    }
}

impl BankStage for Compressor {
    fn prepare(&mut self, sample_rate: f32) {
        self.sample_rate = sample_rate;
        self.reset();
    }

    fn reset(&mut self) {
        self.gain_db = 0.0;
    }

    fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
        let threshold_db = self.params.threshold_db.min(0.0);
        let ratio = if self.params.ratio.is_finite() {
            self.params.ratio.max(1.0)
        } else {
            1.0
        };
        let attack = time_to_coeff(self.params.attack_ms, self.sample_rate);
        let release = time_to_coeff(self.params.release_ms, self.sample_rate);
        let makeup_db = self.params.makeup_db;

        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let level_db = linear_to_db(l.abs().max(r.abs()));
            let target_db = compute_gain_db(level_db, threshold_db, ratio);
            let coeff = if target_db < self.gain_db { attack } else { release };
            self.gain_db = coeff * self.gain_db + (1.0 - coeff) * target_db;

            let gain = db_to_linear(self.gain_db + makeup_db);
            *l *= gain;
            *r *= gain;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gain_curve() {
        assert_eq!(compute_gain_db(-30.0, -18.0, 4.0), 0.0);
        // 12 dB over at 4:1 leaves 3 dB over: 9 dB of reduction
        assert!((compute_gain_db(-6.0, -18.0, 4.0) + 9.0).abs() < 1e-5);
    }

    #[test]
    fn test_settles_to_static_curve() {
        let mut comp = Compressor::default();
        comp.prepare(48000.0);
        let level = db_to_linear(-6.0);
        let mut l = vec![level; 48000];
        let mut r = vec![level; 48000];
        comp.process(&mut l, &mut r);
        let out_db = linear_to_db(l[47999]);
        assert!((out_db - -15.0).abs() < 0.1, "got {}", out_db);
    }

    #[test]
    fn test_below_threshold_is_untouched() {
        let mut comp = Compressor::default();
        comp.prepare(48000.0);
        let mut l = vec![0.01; 512];
        let mut r = vec![0.01; 512];
        comp.process(&mut l, &mut r);
        assert!((l[511] - 0.01).abs() < 1e-6);
    }
}

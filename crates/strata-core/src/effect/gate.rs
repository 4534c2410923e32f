//! Noise gate

use serde::{Deserialize, Serialize};

use super::{db_to_linear, time_to_coeff, BankStage};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateParams {
    /// Level below which the gate starts closing
    pub threshold_db: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
}

impl Default for GateParams {
    fn default() -> Self {
        Self {
            threshold_db: -50.0,
            attack_ms: 1.0,
            release_ms: 80.0,
        }
    }
}

/// Envelope-follower gate with a squared (soft-knee) gain curve
///
/// The gain is `(env / threshold)²` below threshold and 1 above it, so the
/// gate fades out quickly as the signal drops instead of snapping shut.
#[derive(Debug, Default)]
pub struct Gate {
    pub params: GateParams,
    sample_rate: f32,
    envelope: f32,
}

impl BankStage for Gate {
    fn prepare(&mut self, sample_rate: f32) {
        self.sample_rate = sample_rate;
        self.reset();
    }

    fn reset(&mut self) {
        self.envelope = 0.0;
    }

    fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
        let threshold = db_to_linear(self.params.threshold_db).max(1e-9);
        let attack = time_to_coeff(self.params.attack_ms, self.sample_rate);
        let release = time_to_coeff(self.params.release_ms, self.sample_rate);

        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let level = l.abs().max(r.abs());
            let coeff = if level > self.envelope { attack } else { release };
            self.envelope = coeff * self.envelope + (1.0 - coeff) * level;

            let ratio = (self.envelope / threshold).min(1.0);
            let gain = ratio * ratio;
            *l *= gain;
            *r *= gain;
        }
    }
}

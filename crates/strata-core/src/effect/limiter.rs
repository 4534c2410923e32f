//! Track peak limiter
//!
//! Instant attack (gain drops to `ceiling / peak` on the sample that
//! overshoots), smoothed release, then a hard clamp so nothing passes
//! above the ceiling even while the gain is recovering.

use serde::{Deserialize, Serialize};

use super::{db_to_linear, time_to_coeff, BankStage};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterParams {
    /// Ceiling in dBFS (≤ 0)
    pub ceiling_db: f32,
    pub release_ms: f32,
}

impl Default for LimiterParams {
    fn default() -> Self {
        Self {
            ceiling_db: -1.0,
            release_ms: 50.0,
        }
    }
}

#[derive(Debug)]
pub struct Limiter {
    pub params: LimiterParams,
    sample_rate: f32,
    gain: f32,
}

impl Default for Limiter {
    fn default() -> Self {
        Self {
            params: LimiterParams::default(),
            sample_rate: 48000.0,
            gain: 1.0,
        }
    }
}

impl BankStage for Limiter {
    fn prepare(&mut self, sample_rate: f32) {
        self.sample_rate = sample_rate;
        self.reset();
    }

    fn reset(&mut self) {
        self.gain = 1.0;
    }

    fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
        let ceiling = db_to_linear(self.params.ceiling_db.min(0.0));
        let release = time_to_coeff(self.params.release_ms, self.sample_rate);

        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let peak = l.abs().max(r.abs());
            let target = if peak > ceiling { ceiling / peak } else { 1.0 };

            if target < self.gain {
                self.gain = target;
            } else if self.gain < target {
                self.gain = (release * self.gain + (1.0 - release) * target).min(target);
            }

            *l = (*l * self.gain).clamp(-ceiling, ceiling);
            *r = (*r * self.gain).clamp(-ceiling, ceiling);
        }
    }
}

//! Three-band channel EQ
//!
//! Low shelf at 100 Hz, peaking mid at 1 kHz (Q 0.7), high shelf at
//! 10 kHz. Coefficients are rebuilt only when a band gain actually
//! changes, so the render path can hand in the control values every
//! block without paying for trigonometry.

/// Band centre frequencies
const EQ_LO_FREQ: f32 = 100.0;
const EQ_MID_FREQ: f32 = 1000.0;
const EQ_HI_FREQ: f32 = 10000.0;
const EQ_MID_Q: f32 = 0.7;

/// Band gains closer to 0 dB than this use a passthrough section
const FLAT_DB: f32 = 0.05;

/// Gain range accepted per band
pub const EQ_MIN_DB: f32 = -24.0;
pub const EQ_MAX_DB: f32 = 12.0;

/// Stereo biquad state (direct form I)
#[derive(Debug, Clone, Copy, Default)]
struct BiquadState {
    x1_l: f32,
    x2_l: f32,
    y1_l: f32,
    y2_l: f32,
    x1_r: f32,
    x2_r: f32,
    y1_r: f32,
    y2_r: f32,
}

impl BiquadState {
    #[inline]
    fn process(&mut self, input_l: f32, input_r: f32, c: &BiquadCoeffs) -> (f32, f32) {
        let out_l = c.b0 * input_l + c.b1 * self.x1_l + c.b2 * self.x2_l
            - c.a1 * self.y1_l
            - c.a2 * self.y2_l;
        self.x2_l = self.x1_l;
        self.x1_l = input_l;
        self.y2_l = self.y1_l;
        self.y1_l = out_l;

        let out_r = c.b0 * input_r + c.b1 * self.x1_r + c.b2 * self.x2_r
            - c.a1 * self.y1_r
            - c.a2 * self.y2_r;
        self.x2_r = self.x1_r;
        self.x1_r = input_r;
        self.y2_r = self.y1_r;
        self.y1_r = out_r;

        (out_l, out_r)
    }
}

/// Normalized biquad coefficients (RBJ cookbook)
#[derive(Debug, Clone, Copy, PartialEq)]
struct BiquadCoeffs {
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
}

impl BiquadCoeffs {
    fn low_shelf(freq: f32, gain_db: f32, sample_rate: f32) -> Self {
        let a = 10.0_f32.powf(gain_db / 40.0);
        let w0 = 2.0 * std::f32::consts::PI * freq / sample_rate;
        let cos_w0 = w0.cos();
        let alpha = w0.sin() / 2.0 * ((a + 1.0 / a) * (1.0 / 0.9 - 1.0) + 2.0).sqrt();
        let sqrt_a = a.sqrt();

        let a0 = (a + 1.0) + (a - 1.0) * cos_w0 + 2.0 * sqrt_a * alpha;
        Self {
            b0: (a * ((a + 1.0) - (a - 1.0) * cos_w0 + 2.0 * sqrt_a * alpha)) / a0,
            b1: (2.0 * a * ((a - 1.0) - (a + 1.0) * cos_w0)) / a0,
            b2: (a * ((a + 1.0) - (a - 1.0) * cos_w0 - 2.0 * sqrt_a * alpha)) / a0,
            a1: (-2.0 * ((a - 1.0) + (a + 1.0) * cos_w0)) / a0,
            a2: ((a + 1.0) + (a - 1.0) * cos_w0 - 2.0 * sqrt_a * alpha) / a0,
        }
    }

    fn peaking(freq: f32, gain_db: f32, q: f32, sample_rate: f32) -> Self {
        let a = 10.0_f32.powf(gain_db / 40.0);
        let w0 = 2.0 * std::f32::consts::PI * freq / sample_rate;
        let cos_w0 = w0.cos();
        let alpha = w0.sin() / (2.0 * q);

        let a0 = 1.0 + alpha / a;
        Self {
            b0: (1.0 + alpha * a) / a0,
            b1: (-2.0 * cos_w0) / a0,
            b2: (1.0 - alpha * a) / a0,
            a1: (-2.0 * cos_w0) / a0,
            a2: (1.0 - alpha / a) / a0,
        }
    }

    fn high_shelf(freq: f32, gain_db: f32, sample_rate: f32) -> Self {
        let a = 10.0_f32.powf(gain_db / 40.0);
        let w0 = 2.0 * std::f32::consts::PI * freq / sample_rate;
        let cos_w0 = w0.cos();
        let alpha = w0.sin() / 2.0 * ((a + 1.0 / a) * (1.0 / 0.9 - 1.0) + 2.0).sqrt();
        let sqrt_a = a.sqrt();

        let a0 = (a + 1.0) - (a - 1.0) * cos_w0 + 2.0 * sqrt_a * alpha;
        Self {
            b0: (a * ((a + 1.0) + (a - 1.0) * cos_w0 + 2.0 * sqrt_a * alpha)) / a0,
            b1: (-2.0 * a * ((a - 1.0) + (a + 1.0) * cos_w0)) / a0,
            b2: (a * ((a + 1.0) + (a - 1.0) * cos_w0 - 2.0 * sqrt_a * alpha)) / a0,
            a1: (2.0 * ((a - 1.0) - (a + 1.0) * cos_w0)) / a0,
            a2: ((a + 1.0) - (a - 1.0) * cos_w0 - 2.0 * sqrt_a * alpha) / a0,
        }
    }

    fn passthrough() -> Self {
        Self {
            b0: 1.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
        }
    }
}

impl Default for BiquadCoeffs {
    fn default() -> Self {
        Self::passthrough()
    }
}

/// Low shelf, mid peak and high shelf in series
#[derive(Debug, Clone)]
pub struct ThreeBandEq {
    sample_rate: f32,
    /// Gains the current coefficients were built for (dB)
    gains_db: [f32; 3],
    coeffs: [BiquadCoeffs; 3],
    state: [BiquadState; 3],
    /// Coefficient rebuilds since creation
    rebuilds: u64,
}

impl Default for ThreeBandEq {
    fn default() -> Self {
        Self::new(crate::types::DEFAULT_SAMPLE_RATE as f32)
    }
}

impl ThreeBandEq {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            sample_rate,
            gains_db: [0.0; 3],
            coeffs: [BiquadCoeffs::passthrough(); 3],
            state: [BiquadState::default(); 3],
            rebuilds: 0,
        }
    }

    /// Set the sample rate, rebuild coefficients and clear state
    pub fn prepare(&mut self, sample_rate: f32) {
        self.sample_rate = sample_rate.max(1.0);
        self.rebuild();
        self.reset();
    }

    pub fn reset(&mut self) {
        self.state = [BiquadState::default(); 3];
    }

    pub fn gains_db(&self) -> [f32; 3] {
        self.gains_db
    }

    /// Number of coefficient rebuilds so far
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds
    }

    /// Update band gains; coefficients are rebuilt only if a gain changed
    pub fn set_gains_db(&mut self, gains_db: [f32; 3]) {
        let clamped = gains_db.map(|g| {
            if g.is_finite() {
                g.clamp(EQ_MIN_DB, EQ_MAX_DB)
            } else {
                0.0
            }
        });
        if clamped != self.gains_db {
            self.gains_db = clamped;
            self.rebuild();
        }
    }

    fn rebuild(&mut self) {
        let sr = self.sample_rate;
        let [lo, mid, hi] = self.gains_db;
        self.coeffs = [
            if lo.abs() > FLAT_DB {
                BiquadCoeffs::low_shelf(EQ_LO_FREQ, lo, sr)
            } else {
                BiquadCoeffs::passthrough()
            },
            if mid.abs() > FLAT_DB {
                BiquadCoeffs::peaking(EQ_MID_FREQ, mid, EQ_MID_Q, sr)
            } else {
                BiquadCoeffs::passthrough()
            },
            // Keep the high shelf below Nyquist at low sample rates
            if hi.abs() > FLAT_DB {
                BiquadCoeffs::high_shelf(EQ_HI_FREQ.min(sr * 0.45), hi, sr)
            } else {
                BiquadCoeffs::passthrough()
            },
        ];
        self.rebuilds += 1;
    }

    /// Filter equal-length left/right slices in place
    pub fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let (mut out_l, mut out_r) = (*l, *r);
            for (state, coeffs) in self.state.iter_mut().zip(self.coeffs.iter()) {
                (out_l, out_r) = state.process(out_l, out_r, coeffs);
            }
            *l = out_l;
            *r = out_r;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::TAU;

    fn rms_after(eq: &mut ThreeBandEq, freq: f32) -> f32 {
        let frames = 9600;
        let mut l: Vec<f32> = (0..frames)
            .map(|i| (TAU * freq * i as f32 / 48000.0).sin())
            .collect();
        let mut r = l.clone();
        eq.process(&mut l, &mut r);
        let tail = &l[frames / 2..];
        (tail.iter().map(|s| s * s).sum::<f32>() / tail.len() as f32).sqrt()
    }

    #[test]
    fn test_flat_is_passthrough() {
        let mut eq = ThreeBandEq::new(48000.0);
        let mut l = vec![0.3, -0.2, 0.1];
        let mut r = l.clone();
        eq.process(&mut l, &mut r);
        assert_eq!(l, vec![0.3, -0.2, 0.1]);
    }

    #[test]
    fn test_low_cut_attenuates_bass_only() {
        let mut eq = ThreeBandEq::new(48000.0);
        eq.set_gains_db([-12.0, 0.0, 0.0]);
        let low = rms_after(&mut eq, 40.0);
        eq.reset();
        let high = rms_after(&mut eq, 5000.0);
        let unity = std::f32::consts::FRAC_1_SQRT_2;
        assert!(low < unity * 0.5);
        assert!((high - unity).abs() < 0.05);
    }

    #[test]
    fn test_rebuild_only_on_change() {
        let mut eq = ThreeBandEq::new(48000.0);
        let before = eq.rebuild_count();
        eq.set_gains_db([3.0, 0.0, -3.0]);
        eq.set_gains_db([3.0, 0.0, -3.0]);
        eq.set_gains_db([3.0, 0.0, -3.0]);
        assert_eq!(eq.rebuild_count(), before + 1);
        eq.set_gains_db([3.0, 1.0, -3.0]);
        assert_eq!(eq.rebuild_count(), before + 2);
    }

    #[test]
    fn test_gains_are_clamped() {
        let mut eq = ThreeBandEq::new(48000.0);
        eq.set_gains_db([-100.0, f32::NAN, 100.0]);
        assert_eq!(eq.gains_db(), [EQ_MIN_DB, 0.0, EQ_MAX_DB]);
    }
}

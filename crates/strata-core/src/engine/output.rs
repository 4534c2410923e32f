//! Master output stage
//!
//! The last thing every block passes through before the device:
//!
//! ```text
//! master gain (dezippered) → soft clip → peak limiter → DC blocker → safety pass
//! ```
//!
//! The safety pass is not optional. Any sample that is non-finite or wildly
//! out of range (|x| > 24) is replaced with exact silence and raises a
//! sticky fault flag the UI can poll; everything else is clamped to ±1.25.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::OutputConfig;
use crate::effect::{db_to_linear, time_to_coeff, DcBlocker};
use crate::types::StereoBuffer;

/// Samples beyond this magnitude are treated as a fault
const FAULT_THRESHOLD: f32 = 24.0;

/// Final hard clamp
const OUTPUT_CLAMP: f32 = 1.25;

/// Master DC blocker pole
const DC_COEFF: f32 = 0.995;

/// Coefficients derived from [`OutputConfig`] and the sample rate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputParams {
    /// Linear master gain the dezipper moves toward
    pub target_gain: f32,
    pub dezipper_coeff: f32,
    pub soft_clip: bool,
    pub soft_clip_bound: f32,
    pub limiter: bool,
    /// Limiter ceiling (linear)
    pub ceiling: f32,
    pub attack_coeff: f32,
    pub release_coeff: f32,
    pub dc_block: bool,
}

impl OutputParams {
    pub fn from_config(config: &OutputConfig, sample_rate: f64) -> Self {
        let sr = sample_rate.max(1.0) as f32;
        Self {
            target_gain: db_to_linear(config.master_gain_db.clamp(-96.0, 24.0)),
            dezipper_coeff: time_to_coeff(config.dezipper_ms, sr),
            soft_clip: config.soft_clip,
            soft_clip_bound: config.soft_clip_bound.clamp(0.1, OUTPUT_CLAMP),
            limiter: config.limiter,
            ceiling: db_to_linear(config.limiter_ceiling_db.min(0.0)),
            attack_coeff: time_to_coeff(config.limiter_attack_ms, sr),
            release_coeff: time_to_coeff(config.limiter_release_ms, sr),
            dc_block: config.dc_block,
        }
    }
}

impl Default for OutputParams {
    fn default() -> Self {
        Self::from_config(&OutputConfig::default(), crate::types::DEFAULT_SAMPLE_RATE as f64)
    }
}

/// Per-channel state carried between blocks
#[derive(Debug)]
pub struct OutputState {
    gain: f32,
    clip_prev: [f32; 2],
    limiter_gain: f32,
    dc: [DcBlocker; 2],
    fault: Arc<AtomicBool>,
}

impl OutputState {
    pub fn new() -> Self {
        Self {
            gain: 1.0,
            clip_prev: [0.0; 2],
            limiter_gain: 1.0,
            dc: [DcBlocker::new(DC_COEFF); 2],
            fault: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Clear filter state and jump the dezipper to the target gain
    ///
    /// The fault flag is left alone; only [`Self::clear_fault`] resets it.
    pub fn reset(&mut self, params: &OutputParams) {
        self.gain = params.target_gain;
        self.clip_prev = [0.0; 2];
        self.limiter_gain = 1.0;
        for dc in &mut self.dc {
            dc.reset();
        }
    }

    /// Sticky output fault flag (shared with the UI thread)
    pub fn fault_indicator(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.fault)
    }

    pub fn has_fault(&self) -> bool {
        self.fault.load(Ordering::Relaxed)
    }

    pub fn clear_fault(&self) {
        self.fault.store(false, Ordering::Relaxed);
    }
}

impl Default for OutputState {
    fn default() -> Self {
        Self::new()
    }
}

/// 2x oversampled tanh clip: the midpoint with the previous input and the
/// current input are shaped separately and averaged.
#[inline]
fn oversampled_clip(x: f32, prev: &mut f32, bound: f32) -> f32 {
    let mid = 0.5 * (*prev + x);
    if x.is_finite() {
        *prev = x;
    }
    0.5 * (bound * (mid / bound).tanh() + bound * (x / bound).tanh())
}

/// Run the master chain over `master` in place
///
/// Never allocates and never panics, whatever the input contains.
pub fn apply_output_limiting(
    master: &mut StereoBuffer,
    state: &mut OutputState,
    params: &OutputParams,
) {
    for s in master.iter_mut() {
        state.gain = params.target_gain + (state.gain - params.target_gain) * params.dezipper_coeff;
        let mut l = s.left * state.gain;
        let mut r = s.right * state.gain;

        if params.soft_clip {
            l = oversampled_clip(l, &mut state.clip_prev[0], params.soft_clip_bound);
            r = oversampled_clip(r, &mut state.clip_prev[1], params.soft_clip_bound);
        }

        if params.limiter {
            let peak = l.abs().max(r.abs());
            let target = if peak > params.ceiling {
                params.ceiling / peak
            } else {
                1.0
            };
            let coeff = if target < state.limiter_gain {
                params.attack_coeff
            } else {
                params.release_coeff
            };
            state.limiter_gain = target + (state.limiter_gain - target) * coeff;
            l = (l * state.limiter_gain).clamp(-params.ceiling, params.ceiling);
            r = (r * state.limiter_gain).clamp(-params.ceiling, params.ceiling);
        }

        s.left = l;
        s.right = r;
    }

    if params.dc_block {
        for s in master.iter_mut() {
            s.left = state.dc[0].process(s.left);
            s.right = state.dc[1].process(s.right);
            if !s.left.is_finite() {
                state.dc[0].reset();
            }
            if !s.right.is_finite() {
                state.dc[1].reset();
            }
        }
    }

    let mut faulted = false;
    for s in master.iter_mut() {
        for x in [&mut s.left, &mut s.right] {
            if !x.is_finite() || x.abs() > FAULT_THRESHOLD {
                *x = 0.0;
                faulted = true;
            } else {
                *x = x.clamp(-OUTPUT_CLAMP, OUTPUT_CLAMP);
            }
        }
    }
    if faulted {
        state.fault.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StereoSample;

    fn bare_params() -> OutputParams {
        OutputParams {
            soft_clip: false,
            limiter: false,
            dc_block: false,
            ..OutputParams::default()
        }
    }

    fn sine(amplitude: f32, frames: usize) -> StereoBuffer {
        StereoBuffer::from_vec(
            (0..frames)
                .map(|i| StereoSample::mono((i as f32 * 0.05).sin() * amplitude))
                .collect(),
        )
    }

    #[test]
    fn test_soft_clip_respects_bound() {
        let params = OutputParams {
            soft_clip: true,
            soft_clip_bound: 0.8,
            ..bare_params()
        };
        let mut state = OutputState::new();
        state.reset(&params);
        let mut master = sine(10.0, 4096);
        apply_output_limiting(&mut master, &mut state, &params);
        assert!(master.iter().all(|s| s.left.abs() <= 0.8 && s.right.abs() <= 0.8));
        assert!(!state.has_fault());
    }

    #[test]
    fn test_limiter_holds_ceiling() {
        let config = OutputConfig {
            soft_clip: false,
            dc_block: false,
            limiter_ceiling_db: -6.0,
            ..Default::default()
        };
        let params = OutputParams::from_config(&config, 48000.0);
        let mut state = OutputState::new();
        state.reset(&params);
        let mut master = sine(4.0, 9600);
        apply_output_limiting(&mut master, &mut state, &params);
        assert!(master.peak() <= params.ceiling);
    }

    #[test]
    fn test_fault_zeroes_and_latches() {
        let params = bare_params();
        let mut state = OutputState::new();
        state.reset(&params);
        let indicator = state.fault_indicator();

        let mut master = StereoBuffer::from_vec(vec![
            StereoSample::new(0.5, f32::NAN),
            StereoSample::new(30.0, -0.25),
            StereoSample::new(2.0, f32::NEG_INFINITY),
        ]);
        apply_output_limiting(&mut master, &mut state, &params);

        assert_eq!(master[0], StereoSample::new(0.5, 0.0));
        assert_eq!(master[1], StereoSample::new(0.0, -0.25));
        assert_eq!(master[2], StereoSample::new(1.25, 0.0));
        assert!(indicator.load(Ordering::Relaxed));

        // Clean blocks do not clear it
        let mut clean = StereoBuffer::silence(16);
        apply_output_limiting(&mut clean, &mut state, &params);
        assert!(state.has_fault());
        state.clear_fault();
        assert!(!indicator.load(Ordering::Relaxed));
    }

    #[test]
    fn test_full_chain_survives_garbage() {
        let params = OutputParams::default();
        let mut state = OutputState::new();
        state.reset(&params);
        let mut master = StereoBuffer::from_vec(vec![StereoSample::mono(f32::NAN); 64]);
        apply_output_limiting(&mut master, &mut state, &params);
        assert!(master.iter().all(|s| *s == StereoSample::silence()));

        // The chain recovers on the next clean block
        let mut next = sine(0.5, 256);
        apply_output_limiting(&mut next, &mut state, &params);
        assert!(next.iter().all(|s| s.left.is_finite()));
        assert!(next.peak() > 0.0);
    }

    #[test]
    fn test_dezipper_glides_to_new_gain() {
        let mut config = OutputConfig {
            soft_clip: false,
            limiter: false,
            dc_block: false,
            ..Default::default()
        };
        let mut state = OutputState::new();
        state.reset(&OutputParams::from_config(&config, 48000.0));

        config.master_gain_db = -6.0;
        let params = OutputParams::from_config(&config, 48000.0);
        let mut master = StereoBuffer::from_vec(vec![StereoSample::mono(1.0); 9600]);
        apply_output_limiting(&mut master, &mut state, &params);

        assert!(master[0].left > 0.99);
        assert!((master[9599].left - params.target_gain).abs() < 1e-3);
        assert!(master.iter().zip(master.iter().skip(1)).all(|(a, b)| b.left <= a.left));
    }
}

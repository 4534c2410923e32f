//! Live input monitoring
//!
//! Conditions the device input once per block into a track-owned buffer
//! that the render path then mixes at the selected tap point. The safe
//! path runs a DC blocker and a soft limiter that can never exceed full
//! scale; the direct path copies the input untouched and the caller has to
//! treat the track's send as unsafe for that block.

use crate::effect::DcBlocker;
use crate::types::{StereoBuffer, StereoSample};

/// Level where the soft limiter starts bending
const SOFT_KNEE: f32 = 0.8;

/// Soft limiter: linear below the knee, tanh-shaped above, bounded by 1.0
#[inline]
pub(crate) fn soft_limit(x: f32) -> f32 {
    let magnitude = x.abs();
    if magnitude <= SOFT_KNEE {
        return x;
    }
    let span = 1.0 - SOFT_KNEE;
    let shaped = SOFT_KNEE + span * ((magnitude - SOFT_KNEE) / span).tanh();
    shaped.copysign(x)
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LiveMonitor {
    dc_l: DcBlocker,
    dc_r: DcBlocker,
}

impl LiveMonitor {
    pub fn reset(&mut self) {
        self.dc_l.reset();
        self.dc_r.reset();
    }

    /// Write the conditioned input into `out` (length = `frames`)
    ///
    /// Returns true when the safe path was used.
    pub fn condition(
        &mut self,
        input: &StereoBuffer,
        frames: usize,
        safe_monitoring: bool,
        clip_threshold: f32,
        out: &mut StereoBuffer,
    ) -> bool {
        out.set_len_from_capacity(frames);
        out.replay_from(input);

        let safe = safe_monitoring || input.peak() > clip_threshold;
        if safe {
            for s in out.iter_mut() {
                let l = self.dc_l.process(sanitize(s.left).clamp(-8.0, 8.0));
                let r = self.dc_r.process(sanitize(s.right).clamp(-8.0, 8.0));
                *s = StereoSample::new(soft_limit(l), soft_limit(r));
            }
        } else {
            // History from an earlier safe block would be stale
            self.reset();
        }
        safe
    }
}

#[inline]
fn sanitize(x: f32) -> f32 {
    if x.is_finite() {
        x
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_limit_bounded() {
        assert_eq!(soft_limit(0.5), 0.5);
        assert_eq!(soft_limit(-0.5), -0.5);
        for x in [0.9f32, 1.0, 2.0, 50.0, -3.0] {
            let y = soft_limit(x);
            assert!(y.abs() < 1.0 + 1e-6);
            assert_eq!(y.signum(), x.signum());
        }
    }

    #[test]
    fn test_hot_input_forces_safe_path() {
        let mut monitor = LiveMonitor::default();
        let input = StereoBuffer::from_vec(vec![StereoSample::mono(0.95); 64]);
        let mut out = StereoBuffer::with_capacity(64);
        assert!(monitor.condition(&input, 64, false, 0.9, &mut out));
        assert!(out.peak() <= 1.0);
    }

    #[test]
    fn test_quiet_input_passes_direct_when_unsafe_allowed() {
        let mut monitor = LiveMonitor::default();
        let input = StereoBuffer::from_vec(vec![StereoSample::new(0.25, -0.25); 64]);
        let mut out = StereoBuffer::with_capacity(64);
        assert!(!monitor.condition(&input, 64, false, 0.9, &mut out));
        assert_eq!(out, input);
    }

    #[test]
    fn test_short_input_is_padded() {
        let mut monitor = LiveMonitor::default();
        let input = StereoBuffer::from_vec(vec![StereoSample::mono(0.25); 16]);
        let mut out = StereoBuffer::with_capacity(32);
        monitor.condition(&input, 32, false, 0.9, &mut out);
        assert_eq!(out.len(), 32);
        assert_eq!(out[31], StereoSample::silence());
    }
}

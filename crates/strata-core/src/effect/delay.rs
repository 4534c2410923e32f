//! Stereo feedback delay
//!
//! Circular buffers sized for up to two seconds at the prepared rate,
//! read with linear interpolation so fractional (and smoothly changing)
//! delay times work. The feedback path is lowpassed and DC-blocked so
//! long feedback tails darken instead of building up offset.

use serde::{Deserialize, Serialize};

use super::{BankStage, DcBlocker};

/// Longest delay the buffer holds
pub const MAX_DELAY_SECONDS: f32 = 2.0;

/// Fractional-read circular delay line
#[derive(Debug, Default)]
pub(crate) struct FractionalDelay {
    buffer: Vec<f32>,
    write_pos: usize,
}

impl FractionalDelay {
    /// Allocate for delays up to `max_samples`
    pub fn allocate(&mut self, max_samples: usize) {
        self.buffer = vec![0.0; max_samples.max(1) + 2];
        self.write_pos = 0;
    }

    pub fn reset(&mut self) {
        self.buffer.fill(0.0);
        self.write_pos = 0;
    }

    /// Longest readable delay in samples
    #[inline]
    pub fn max_delay(&self) -> f32 {
        self.buffer.len().saturating_sub(2) as f32
    }

    /// Read `delay` samples behind the write head (linear interpolation)
    #[inline]
    pub fn read(&self, delay: f32) -> f32 {
        let len = self.buffer.len();
        if len < 3 {
            return 0.0;
        }
        let delay = delay.clamp(1.0, self.max_delay());
        let whole = delay as usize;
        let frac = delay - whole as f32;

        let a = self.buffer[(self.write_pos + len - whole) % len];
        let b = self.buffer[(self.write_pos + len - whole - 1) % len];
        a + (b - a) * frac
    }

    #[inline]
    pub fn write(&mut self, value: f32) {
        if self.buffer.is_empty() {
            return;
        }
        self.buffer[self.write_pos] = value;
        self.write_pos = (self.write_pos + 1) % self.buffer.len();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayParams {
    /// Delay time in milliseconds (1 - 2000)
    pub time_ms: f32,
    /// Amount fed back (0 - 0.95)
    pub feedback: f32,
    /// Dry/wet balance (0 - 1)
    pub mix: f32,
    /// Cutoff of the feedback lowpass in Hz
    pub tone_hz: f32,
}

impl Default for DelayParams {
    fn default() -> Self {
        Self {
            time_ms: 375.0,
            feedback: 0.4,
            mix: 0.3,
            tone_hz: 6000.0,
        }
    }
}

#[derive(Debug, Default)]
pub struct Delay {
    pub params: DelayParams,
    sample_rate: f32,
    line_l: FractionalDelay,
    line_r: FractionalDelay,
    lowpass_l: f32,
    lowpass_r: f32,
    dc_l: DcBlocker,
    dc_r: DcBlocker,
}

impl BankStage for Delay {
    fn prepare(&mut self, sample_rate: f32) {
        self.sample_rate = sample_rate;
        let max = (sample_rate * MAX_DELAY_SECONDS).ceil() as usize;
        self.line_l.allocate(max);
        self.line_r.allocate(max);
        self.reset();
    }

    fn reset(&mut self) {
        self.line_l.reset();
        self.line_r.reset();
        self.lowpass_l = 0.0;
        self.lowpass_r = 0.0;
        self.dc_l.reset();
        self.dc_r.reset();
    }

    fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
        let delay = self.params.time_ms.clamp(1.0, MAX_DELAY_SECONDS * 1000.0) / 1000.0
            * self.sample_rate;
        let feedback = self.params.feedback.clamp(0.0, 0.95);
        let mix = self.params.mix.clamp(0.0, 1.0);
        let cutoff = self.params.tone_hz.max(20.0).min(self.sample_rate * 0.45);
        let lp = 1.0 - (-std::f32::consts::TAU * cutoff / self.sample_rate).exp();

        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let wet_l = self.line_l.read(delay);
            let wet_r = self.line_r.read(delay);

            self.lowpass_l += lp * (wet_l - self.lowpass_l);
            self.lowpass_r += lp * (wet_r - self.lowpass_r);
            let fb_l = self.dc_l.process(self.lowpass_l) * feedback;
            let fb_r = self.dc_r.process(self.lowpass_r) * feedback;

            self.line_l.write(*l + fb_l);
            self.line_r.write(*r + fb_r);

            *l += (wet_l - *l) * mix;
            *r += (wet_r - *r) * mix;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fractional_read() {
        let mut line = FractionalDelay::default();
        line.allocate(16);
        for i in 0..8 {
            line.write(i as f32);
        }
        // Last written is 7 at delay 1
        assert_eq!(line.read(1.0), 7.0);
        assert_eq!(line.read(3.0), 5.0);
        assert!((line.read(2.5) - 5.5).abs() < 1e-6);
    }

    #[test]
    fn test_impulse_arrives_after_delay_time() {
        let mut delay = Delay::default();
        delay.params.time_ms = 10.0;
        delay.params.mix = 1.0;
        delay.params.feedback = 0.0;
        delay.prepare(48000.0);

        let mut l = vec![0.0; 1024];
        let mut r = vec![0.0; 1024];
        l[0] = 1.0;
        r[0] = 1.0;
        delay.process(&mut l, &mut r);

        let peak_at = l
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak_at, 480);
    }

    #[test]
    fn test_buffer_holds_two_seconds() {
        let mut delay = Delay::default();
        delay.prepare(96000.0);
        assert!(delay.line_l.max_delay() >= 192000.0);
    }
}

//! LFO-modulated effects: chorus, flanger, phaser
//!
//! Chorus and flanger sweep a fractional delay line around a base time;
//! the flanger is shorter and feeds back. The phaser sweeps the corner
//! frequency of four first-order all-pass sections. The right channel's
//! LFO runs a quarter cycle ahead for stereo width.

use std::f32::consts::{PI, TAU};

use serde::{Deserialize, Serialize};

use super::delay::FractionalDelay;
use super::BankStage;

/// Right-channel LFO phase offset (fraction of a cycle)
const STEREO_PHASE: f32 = 0.25;

/// Sine LFO with a phase in cycles
#[derive(Debug, Default, Clone, Copy)]
struct Lfo {
    phase: f32,
}

impl Lfo {
    /// Current value for a phase offset, in [-1, 1]
    #[inline]
    fn value(&self, offset: f32) -> f32 {
        ((self.phase + offset) * TAU).sin()
    }

    #[inline]
    fn advance(&mut self, rate_hz: f32, sample_rate: f32) {
        self.phase += rate_hz / sample_rate;
        if self.phase >= 1.0 {
            self.phase -= 1.0;
        }
    }
}

/// Stereo modulated delay shared by chorus and flanger
#[derive(Debug, Default)]
struct ModulatedDelay {
    sample_rate: f32,
    line_l: FractionalDelay,
    line_r: FractionalDelay,
    lfo: Lfo,
}

impl ModulatedDelay {
    fn prepare(&mut self, sample_rate: f32, max_ms: f32) {
        self.sample_rate = sample_rate;
        let max = (max_ms / 1000.0 * sample_rate).ceil() as usize;
        self.line_l.allocate(max);
        self.line_r.allocate(max);
        self.reset();
    }

    fn reset(&mut self) {
        self.line_l.reset();
        self.line_r.reset();
        self.lfo = Lfo::default();
    }

    #[allow(clippy::too_many_arguments)]
    fn process(
        &mut self,
        left: &mut [f32],
        right: &mut [f32],
        base_ms: f32,
        depth_ms: f32,
        rate_hz: f32,
        feedback: f32,
        mix: f32,
    ) {
        let to_samples = self.sample_rate / 1000.0;
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let delay_l = (base_ms + depth_ms * 0.5 * (1.0 + self.lfo.value(0.0))) * to_samples;
            let delay_r =
                (base_ms + depth_ms * 0.5 * (1.0 + self.lfo.value(STEREO_PHASE))) * to_samples;

            let wet_l = self.line_l.read(delay_l);
            let wet_r = self.line_r.read(delay_r);
            self.line_l.write(*l + wet_l * feedback);
            self.line_r.write(*r + wet_r * feedback);

            *l += (wet_l - *l) * mix;
            *r += (wet_r - *r) * mix;
            self.lfo.advance(rate_hz, self.sample_rate);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChorusParams {
    pub rate_hz: f32,
    /// Modulation depth in milliseconds
    pub depth_ms: f32,
    pub mix: f32,
}

impl Default for ChorusParams {
    fn default() -> Self {
        Self {
            rate_hz: 0.8,
            depth_ms: 3.0,
            mix: 0.5,
        }
    }
}

/// Chorus: 15 ms base delay, no feedback
#[derive(Debug, Default)]
pub struct Chorus {
    pub params: ChorusParams,
    line: ModulatedDelay,
}

impl Chorus {
    const BASE_MS: f32 = 15.0;
    const MAX_MS: f32 = 40.0;
}

impl BankStage for Chorus {
    fn prepare(&mut self, sample_rate: f32) {
        self.line.prepare(sample_rate, Self::MAX_MS);
    }

    fn reset(&mut self) {
        self.line.reset();
    }

    fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
        let p = self.params;
        self.line.process(
            left,
            right,
            Self::BASE_MS,
            p.depth_ms.clamp(0.0, Self::MAX_MS - Self::BASE_MS),
            p.rate_hz.clamp(0.01, 10.0),
            0.0,
            p.mix.clamp(0.0, 1.0),
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlangerParams {
    pub rate_hz: f32,
    pub depth_ms: f32,
    /// Feedback (-0.95 - 0.95)
    pub feedback: f32,
    pub mix: f32,
}

impl Default for FlangerParams {
    fn default() -> Self {
        Self {
            rate_hz: 0.25,
            depth_ms: 2.0,
            feedback: 0.5,
            mix: 0.5,
        }
    }
}

/// Flanger: 1 ms base delay with feedback
#[derive(Debug, Default)]
pub struct Flanger {
    pub params: FlangerParams,
    line: ModulatedDelay,
}

impl Flanger {
    const BASE_MS: f32 = 1.0;
    const MAX_MS: f32 = 12.0;
}

impl BankStage for Flanger {
    fn prepare(&mut self, sample_rate: f32) {
        self.line.prepare(sample_rate, Self::MAX_MS);
    }

    fn reset(&mut self) {
        self.line.reset();
    }

    fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
        let p = self.params;
        self.line.process(
            left,
            right,
            Self::BASE_MS,
            p.depth_ms.clamp(0.0, Self::MAX_MS - Self::BASE_MS),
            p.rate_hz.clamp(0.01, 10.0),
            p.feedback.clamp(-0.95, 0.95),
            p.mix.clamp(0.0, 1.0),
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaserParams {
    pub rate_hz: f32,
    /// Lowest swept corner frequency in Hz
    pub min_hz: f32,
    /// Highest swept corner frequency in Hz
    pub max_hz: f32,
    pub feedback: f32,
    pub mix: f32,
}

impl Default for PhaserParams {
    fn default() -> Self {
        Self {
            rate_hz: 0.5,
            min_hz: 200.0,
            max_hz: 2000.0,
            feedback: 0.5,
            mix: 0.5,
        }
    }
}

const PHASER_STAGES: usize = 4;

/// First-order all-pass section: `y = a·x + x1 - a·y1`
#[derive(Debug, Default, Clone, Copy)]
struct AllPass {
    x1: f32,
    y1: f32,
}

impl AllPass {
    #[inline]
    fn process(&mut self, input: f32, a: f32) -> f32 {
        let output = a * input + self.x1 - a * self.y1;
        self.x1 = input;
        self.y1 = output;
        output
    }
}

#[derive(Debug, Default)]
pub struct Phaser {
    pub params: PhaserParams,
    sample_rate: f32,
    lfo: Lfo,
    stages_l: [AllPass; PHASER_STAGES],
    stages_r: [AllPass; PHASER_STAGES],
    fb_l: f32,
    fb_r: f32,
}

impl Phaser {
    /// All-pass coefficient for a corner frequency
    #[inline]
    fn coefficient(freq: f32, sample_rate: f32) -> f32 {
        let t = (PI * freq / sample_rate).tan();
        (t - 1.0) / (t + 1.0)
    }
}

impl BankStage for Phaser {
    fn prepare(&mut self, sample_rate: f32) {
        self.sample_rate = sample_rate;
        self.reset();
    }

    fn reset(&mut self) {
        self.lfo = Lfo::default();
        self.stages_l = [AllPass::default(); PHASER_STAGES];
        self.stages_r = [AllPass::default(); PHASER_STAGES];
        self.fb_l = 0.0;
        self.fb_r = 0.0;
    }

    fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
        let nyquist_guard = self.sample_rate * 0.45;
        let min_hz = self.params.min_hz.max(20.0).min(nyquist_guard);
        let max_hz = self.params.max_hz.min(nyquist_guard).max(min_hz);
        let rate = self.params.rate_hz.clamp(0.01, 10.0);
        let feedback = self.params.feedback.clamp(-0.95, 0.95);
        let mix = self.params.mix.clamp(0.0, 1.0);
        let ratio = max_hz / min_hz;

        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            // Exponential sweep so the movement sounds even across octaves
            let sweep_l = 0.5 * (1.0 + self.lfo.value(0.0));
            let sweep_r = 0.5 * (1.0 + self.lfo.value(STEREO_PHASE));
            let a_l = Self::coefficient(min_hz * ratio.powf(sweep_l), self.sample_rate);
            let a_r = Self::coefficient(min_hz * ratio.powf(sweep_r), self.sample_rate);

            let mut wet_l = *l + self.fb_l * feedback;
            let mut wet_r = *r + self.fb_r * feedback;
            for stage in &mut self.stages_l {
                wet_l = stage.process(wet_l, a_l);
            }
            for stage in &mut self.stages_r {
                wet_r = stage.process(wet_r, a_r);
            }
            self.fb_l = wet_l;
            self.fb_r = wet_r;

            *l += (wet_l - *l) * mix;
            *r += (wet_r - *r) * mix;
            self.lfo.advance(rate, self.sample_rate);
        }
    }
}

//! Built-in effect bank
//!
//! Every track carries the same nine DSP stages in a fixed order:
//!
//! ```text
//! gate → compressor → saturation → chorus → flanger → phaser → delay → reverb → limiter
//! ```
//!
//! Each stage is switched by one bit of the track's effect mask
//! ([`EffectKind::bit`]); the mask lives in the track's control atomics so
//! the UI can toggle stages without taking the track lock. Parameters are
//! plain structs ([`EffectParams`]) written from the control thread under
//! the track lock.
//!
//! The bank always processes two channels. Buffers are allocated in
//! [`EffectBank::prepare`]; `process` never allocates.

mod compressor;
mod delay;
pub mod eq;
mod gate;
mod limiter;
mod modulation;
mod reverb;
mod saturation;

pub use compressor::{Compressor, CompressorParams};
pub use delay::{Delay, DelayParams};
pub use eq::ThreeBandEq;
pub use gate::{Gate, GateParams};
pub use limiter::{Limiter, LimiterParams};
pub use modulation::{Chorus, ChorusParams, Flanger, FlangerParams, Phaser, PhaserParams};
pub use reverb::{Reverb, ReverbParams};
pub use saturation::{Saturation, SaturationParams};

use serde::{Deserialize, Serialize};

use crate::types::DEFAULT_SAMPLE_RATE;

/// One stage of the bank, in processing order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EffectKind {
    Gate,
    Compressor,
    Saturation,
    Chorus,
    Flanger,
    Phaser,
    Delay,
    Reverb,
    Limiter,
}

impl EffectKind {
    /// All stages in processing order
    pub const ALL: [EffectKind; 9] = [
        EffectKind::Gate,
        EffectKind::Compressor,
        EffectKind::Saturation,
        EffectKind::Chorus,
        EffectKind::Flanger,
        EffectKind::Phaser,
        EffectKind::Delay,
        EffectKind::Reverb,
        EffectKind::Limiter,
    ];

    /// Bit of this stage in the effect mask
    #[inline]
    pub const fn bit(self) -> u32 {
        1 << (self as u32)
    }

    pub fn name(self) -> &'static str {
        match self {
            EffectKind::Gate => "Gate",
            EffectKind::Compressor => "Compressor",
            EffectKind::Saturation => "Saturation",
            EffectKind::Chorus => "Chorus",
            EffectKind::Flanger => "Flanger",
            EffectKind::Phaser => "Phaser",
            EffectKind::Delay => "Delay",
            EffectKind::Reverb => "Reverb",
            EffectKind::Limiter => "Limiter",
        }
    }

    /// Build a mask enabling exactly `kinds`
    pub fn mask(kinds: &[EffectKind]) -> u32 {
        kinds.iter().fold(0, |mask, kind| mask | kind.bit())
    }
}

/// Mask bits that name a stage; anything else is ignored
pub const EFFECT_MASK_ALL: u32 = (1 << EffectKind::ALL.len()) - 1;

/// Common shape of every bank stage
pub(crate) trait BankStage: Send {
    /// Size buffers and coefficients for a sample rate (allocates, control thread)
    fn prepare(&mut self, sample_rate: f32);

    /// Clear all signal state
    fn reset(&mut self);

    /// Process equal-length left/right slices in place
    fn process(&mut self, left: &mut [f32], right: &mut [f32]);
}

/// Parameters of every stage, as one serializable preset
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectParams {
    pub gate: GateParams,
    pub compressor: CompressorParams,
    pub saturation: SaturationParams,
    pub chorus: ChorusParams,
    pub flanger: FlangerParams,
    pub phaser: PhaserParams,
    pub delay: DelayParams,
    pub reverb: ReverbParams,
    pub limiter: LimiterParams,
}

/// The nine built-in stages of one track
pub struct EffectBank {
    sample_rate: f32,
    /// Mask seen on the previous block; newly enabled stages start clean
    last_mask: u32,
    gate: Gate,
    compressor: Compressor,
    saturation: Saturation,
    chorus: Chorus,
    flanger: Flanger,
    phaser: Phaser,
    delay: Delay,
    reverb: Reverb,
    limiter: Limiter,
}

impl EffectBank {
    /// Create a bank prepared at the default sample rate
    pub fn new() -> Self {
        let mut bank = Self {
            sample_rate: DEFAULT_SAMPLE_RATE as f32,
            last_mask: 0,
            gate: Gate::default(),
            compressor: Compressor::default(),
            saturation: Saturation::default(),
            chorus: Chorus::default(),
            flanger: Flanger::default(),
            phaser: Phaser::default(),
            delay: Delay::default(),
            reverb: Reverb::default(),
            limiter: Limiter::default(),
        };
        bank.prepare(DEFAULT_SAMPLE_RATE as f64, 0);
        bank
    }

    /// Rebuild all stages for a new sample rate or block size
    ///
    /// Always resets state, even when the rate is unchanged.
    pub fn prepare(&mut self, sample_rate: f64, _max_block: usize) {
        let sr = sample_rate.max(1.0) as f32;
        self.sample_rate = sr;
        self.last_mask = 0;
        for stage in self.stages_mut() {
            stage.prepare(sr);
        }
    }

    /// Clear all delay lines and envelopes
    pub fn reset(&mut self) {
        for stage in self.stages_mut() {
            stage.reset();
        }
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    /// Run every stage enabled in `mask`, in order
    pub fn process(&mut self, left: &mut [f32], right: &mut [f32], mask: u32) {
        let mask = mask & EFFECT_MASK_ALL;
        let newly_enabled = mask & !self.last_mask;
        self.last_mask = mask;
        if mask == 0 {
            return;
        }

        let frames = left.len().min(right.len());
        let (left, right) = (&mut left[..frames], &mut right[..frames]);

        for (kind, stage) in EffectKind::ALL.into_iter().zip(self.stages_mut()) {
            if mask & kind.bit() == 0 {
                continue;
            }
            if newly_enabled & kind.bit() != 0 {
                stage.reset();
            }
            stage.process(left, right);
        }
    }

    /// Snapshot of all stage parameters
    pub fn params(&self) -> EffectParams {
        EffectParams {
            gate: self.gate.params,
            compressor: self.compressor.params,
            saturation: self.saturation.params,
            chorus: self.chorus.params,
            flanger: self.flanger.params,
            phaser: self.phaser.params,
            delay: self.delay.params,
            reverb: self.reverb.params,
            limiter: self.limiter.params,
        }
    }

    /// Apply a full parameter set
    pub fn set_params(&mut self, params: &EffectParams) {
        self.gate.params = params.gate;
        self.compressor.params = params.compressor;
        self.saturation.params = params.saturation;
        self.chorus.params = params.chorus;
        self.flanger.params = params.flanger;
        self.phaser.params = params.phaser;
        self.delay.params = params.delay;
        self.reverb.params = params.reverb;
        self.limiter.params = params.limiter;
    }

    pub fn gate_mut(&mut self) -> &mut GateParams {
        &mut self.gate.params
    }

    pub fn compressor_mut(&mut self) -> &mut CompressorParams {
        &mut self.compressor.params
    }

    pub fn saturation_mut(&mut self) -> &mut SaturationParams {
        &mut self.saturation.params
    }

    pub fn chorus_mut(&mut self) -> &mut ChorusParams {
        &mut self.chorus.params
    }

    pub fn flanger_mut(&mut self) -> &mut FlangerParams {
        &mut self.flanger.params
    }

    pub fn phaser_mut(&mut self) -> &mut PhaserParams {
        &mut self.phaser.params
    }

    pub fn delay_mut(&mut self) -> &mut DelayParams {
        &mut self.delay.params
    }

    pub fn reverb_mut(&mut self) -> &mut ReverbParams {
        &mut self.reverb.params
    }

    pub fn limiter_mut(&mut self) -> &mut LimiterParams {
        &mut self.limiter.params
    }

    /// Stages in processing order
    fn stages_mut(&mut self) -> [&mut dyn BankStage; 9] {
        [
            &mut self.gate,
            &mut self.compressor,
            &mut self.saturation,
            &mut self.chorus,
            &mut self.flanger,
            &mut self.phaser,
            &mut self.delay,
            &mut self.reverb,
            &mut self.limiter,
        ]
    }
}

impl Default for EffectBank {
    fn default() -> Self {
        Self::new()
    }
}

/// One-pole smoothing coefficient for a time constant in milliseconds
pub(crate) fn time_to_coeff(time_ms: f32, sample_rate: f32) -> f32 {
    if time_ms <= 0.0 || !time_ms.is_finite() {
        return 0.0;
    }
    let t = time_ms / 1000.0;
    (-1.0 / (t * sample_rate)).exp()
}

/// Convert dB to linear gain
#[inline]
pub fn db_to_linear(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

/// Convert linear gain to dB
#[inline]
pub fn linear_to_db(value: f32) -> f32 {
    20.0 * value.max(f32::MIN_POSITIVE).log10()
}

/// One-pole DC blocker: `y[n] = x[n] - x[n-1] + R·y[n-1]`
#[derive(Debug, Clone, Copy)]
pub struct DcBlocker {
    coeff: f32,
    x1: f32,
    y1: f32,
}

impl DcBlocker {
    pub const fn new(coeff: f32) -> Self {
        Self {
            coeff,
            x1: 0.0,
            y1: 0.0,
        }
    }

    #[inline]
    pub fn process(&mut self, input: f32) -> f32 {
        let output = input - self.x1 + self.coeff * self.y1;
        self.x1 = input;
        self.y1 = output;
        output
    }

    pub fn reset(&mut self) {
        self.x1 = 0.0;
        self.y1 = 0.0;
    }
}

impl Default for DcBlocker {
    fn default() -> Self {
        Self::new(0.995)
    }
}

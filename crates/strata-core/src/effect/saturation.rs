//! Tanh saturation
//!
//! Drive and mix are ramped per sample from the previous block's values
//! to the current ones, so moving the knob never steps the waveform. The
//! wet path is DC-blocked because asymmetric input through tanh leaves an
//! offset behind.

use serde::{Deserialize, Serialize};

use super::{BankStage, DcBlocker};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaturationParams {
    /// Input gain into the waveshaper (1 - 20)
    pub drive: f32,
    /// Dry/wet balance (0 - 1)
    pub mix: f32,
}

impl Default for SaturationParams {
    fn default() -> Self {
        Self { drive: 2.0, mix: 1.0 }
    }
}

#[derive(Debug, Default)]
pub struct Saturation {
    pub params: SaturationParams,
    drive: f32,
    mix: f32,
    dc_l: DcBlocker,
    dc_r: DcBlocker,
}

impl Saturation {
    fn target(&self) -> (f32, f32) {
        (
            self.params.drive.clamp(1.0, 20.0),
            self.params.mix.clamp(0.0, 1.0),
        )
    }

    #[inline]
    fn shape(x: f32, drive: f32) -> f32 {
        (x * drive).tanh() / drive.tanh()
    }
}

impl BankStage for Saturation {
    fn prepare(&mut self, _sample_rate: f32) {
        self.reset();
    }

    fn reset(&mut self) {
        let (drive, mix) = self.target();
        self.drive = drive;
        self.mix = mix;
        self.dc_l.reset();
        self.dc_r.reset();
    }

    fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
        let frames = left.len();
        if frames == 0 {
            return;
        }

        let (drive_target, mix_target) = self.target();
        let drive_step = (drive_target - self.drive) / frames as f32;
        let mix_step = (mix_target - self.mix) / frames as f32;

        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            self.drive += drive_step;
            self.mix += mix_step;

            let wet_l = self.dc_l.process(Self::shape(*l, self.drive));
            let wet_r = self.dc_r.process(Self::shape(*r, self.drive));
            *l += (wet_l - *l) * self.mix;
            *r += (wet_r - *r) * self.mix;
        }

        self.drive = drive_target;
        self.mix = mix_target;
    }
}

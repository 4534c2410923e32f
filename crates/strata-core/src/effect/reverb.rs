//! Freeverb-style stereo reverb
//!
//! Eight damped comb filters in parallel into four series all-passes per
//! channel, right channel offset by a fixed spread. Delay lengths are the
//! classic 44.1kHz tunings scaled to the prepared sample rate.

use serde::{Deserialize, Serialize};

use super::BankStage;

/// Comb filter lengths in samples at 44.1kHz
const COMB_LENGTHS: [usize; 8] = [1557, 1617, 1491, 1422, 1277, 1356, 1188, 1116];

/// All-pass lengths in samples at 44.1kHz
const ALLPASS_LENGTHS: [usize; 4] = [225, 556, 441, 341];

/// Right-channel length offset (samples at 44.1kHz)
const STEREO_SPREAD: usize = 23;

const ALLPASS_FEEDBACK: f32 = 0.5;

/// Gain into the comb bank
const COMB_GAIN: f32 = 0.2;

#[derive(Debug, Default)]
struct CombFilter {
    buffer: Vec<f32>,
    pos: usize,
    filter_state: f32,
}

impl CombFilter {
    fn allocate(&mut self, length: usize) {
        self.buffer = vec![0.0; length.max(1)];
        self.pos = 0;
        self.filter_state = 0.0;
    }

    #[inline]
    fn process(&mut self, input: f32, feedback: f32, damp: f32) -> f32 {
        let output = self.buffer[self.pos];
        self.filter_state = output * (1.0 - damp) + self.filter_state * damp;
        self.buffer[self.pos] = input + self.filter_state * feedback;
        self.pos = (self.pos + 1) % self.buffer.len();
        output
    }

    fn reset(&mut self) {
        self.buffer.fill(0.0);
        self.pos = 0;
        self.filter_state = 0.0;
    }
}

#[derive(Debug, Default)]
struct AllpassFilter {
    buffer: Vec<f32>,
    pos: usize,
}

impl AllpassFilter {
    fn allocate(&mut self, length: usize) {
        self.buffer = vec![0.0; length.max(1)];
        self.pos = 0;
    }

    #[inline]
    fn process(&mut self, input: f32) -> f32 {
        let buffered = self.buffer[self.pos];
        let output = -input + buffered;
        self.buffer[self.pos] = input + buffered * ALLPASS_FEEDBACK;
        self.pos = (self.pos + 1) % self.buffer.len();
        output
    }

    fn reset(&mut self) {
        self.buffer.fill(0.0);
        self.pos = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReverbParams {
    /// Decay length (0 - 1)
    pub room_size: f32,
    /// High-frequency damping (0 = bright, 1 = dark)
    pub damping: f32,
    /// Stereo width (0 = mono, 1 = full)
    pub width: f32,
    pub mix: f32,
}

impl Default for ReverbParams {
    fn default() -> Self {
        Self {
            room_size: 0.5,
            damping: 0.5,
            width: 1.0,
            mix: 0.3,
        }
    }
}

#[derive(Debug, Default)]
pub struct Reverb {
    pub params: ReverbParams,
    combs_l: [CombFilter; 8],
    combs_r: [CombFilter; 8],
    allpass_l: [AllpassFilter; 4],
    allpass_r: [AllpassFilter; 4],
}

impl BankStage for Reverb {
    fn prepare(&mut self, sample_rate: f32) {
        let scale = sample_rate / 44100.0;
        let scaled = |len: usize| ((len as f32 * scale) as usize).max(1);

        for (i, &len) in COMB_LENGTHS.iter().enumerate() {
            self.combs_l[i].allocate(scaled(len));
            self.combs_r[i].allocate(scaled(len + STEREO_SPREAD));
        }
        for (i, &len) in ALLPASS_LENGTHS.iter().enumerate() {
            self.allpass_l[i].allocate(scaled(len));
            self.allpass_r[i].allocate(scaled(len + STEREO_SPREAD));
        }
    }

    fn reset(&mut self) {
        self.combs_l.iter_mut().for_each(CombFilter::reset);
        self.combs_r.iter_mut().for_each(CombFilter::reset);
        self.allpass_l.iter_mut().for_each(AllpassFilter::reset);
        self.allpass_r.iter_mut().for_each(AllpassFilter::reset);
    }

    fn process(&mut self, left: &mut [f32], right: &mut [f32]) {
        // Feedback range 0.7 - 0.98
        let feedback = 0.7 + self.params.room_size.clamp(0.0, 1.0) * 0.28;
        let damp = self.params.damping.clamp(0.0, 1.0);
        let width = self.params.width.clamp(0.0, 1.0);
        let wet = self.params.mix.clamp(0.0, 1.0);
        let dry = 1.0 - wet;
        let wet1 = wet * (width / 2.0 + 0.5);
        let wet2 = wet * ((1.0 - width) / 2.0);

        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let input = (*l + *r) * 0.5 * COMB_GAIN;

            let mut out_l = 0.0f32;
            let mut out_r = 0.0f32;
            for comb in &mut self.combs_l {
                out_l += comb.process(input, feedback, damp);
            }
            for comb in &mut self.combs_r {
                out_r += comb.process(input, feedback, damp);
            }
            for ap in &mut self.allpass_l {
                out_l = ap.process(out_l);
            }
            for ap in &mut self.allpass_r {
                out_r = ap.process(out_r);
            }

            let new_l = out_l * wet1 + out_r * wet2 + *l * dry;
            let new_r = out_r * wet1 + out_l * wet2 + *r * dry;
            *l = new_l;
            *r = new_r;
        }
    }
}

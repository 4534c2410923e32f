//! Built-in sampler instrument
//!
//! Plays one stereo sample pitched across the keyboard relative to a root
//! note. Linear interpolation, eight voices with oldest-voice stealing and
//! a short release fade so note-offs never click.

use crate::types::{AudioBlock, StereoBuffer};

use super::midi::{render_with_events, EventRenderer};
use super::{ChannelCounts, ChannelLayout, HostedPlugin, MidiEvent, MidiMessage, PluginError};

const MAX_VOICES: usize = 8;

/// Release fade length in milliseconds
const RELEASE_MS: f64 = 5.0;

#[derive(Debug, Clone, Copy, Default)]
struct SamplerVoice {
    active: bool,
    note: u8,
    position: f64,
    step: f64,
    gain: f32,
    /// Per-sample release decrement; 0 while held
    release_step: f32,
    envelope: f32,
    age: u64,
}

/// One-shot stereo sample player
#[derive(Debug, Default)]
pub struct Sampler {
    sample: Option<StereoBuffer>,
    source_rate: f64,
    root_note: u8,
    sample_rate: f64,
    voices: [SamplerVoice; MAX_VOICES],
    note_counter: u64,
}

impl Sampler {
    pub fn new() -> Self {
        Self {
            source_rate: 48000.0,
            root_note: 60,
            sample_rate: 48000.0,
            ..Default::default()
        }
    }

    /// Replace the sample (control thread); returns the previous one
    pub fn load_sample(
        &mut self,
        sample: StereoBuffer,
        source_rate: f64,
        root_note: u8,
    ) -> Option<StereoBuffer> {
        self.voices = [SamplerVoice::default(); MAX_VOICES];
        self.source_rate = source_rate.max(1.0);
        self.root_note = root_note.min(127);
        if sample.is_empty() {
            return self.sample.take();
        }
        self.sample.replace(sample)
    }

    /// Remove the sample, returning it
    pub fn clear_sample(&mut self) -> Option<StereoBuffer> {
        self.voices = [SamplerVoice::default(); MAX_VOICES];
        self.sample.take()
    }

    pub fn has_sample(&self) -> bool {
        self.sample.is_some()
    }

    fn note_on(&mut self, note: u8, velocity: u8) {
        let ratio = 2.0_f64.powf((note as f64 - self.root_note as f64) / 12.0);
        let step = ratio * self.source_rate / self.sample_rate;

        self.note_counter += 1;
        let index = self
            .voices
            .iter()
            .position(|v| !v.active)
            .unwrap_or_else(|| oldest(&self.voices));

        self.voices[index] = SamplerVoice {
            active: true,
            note,
            position: 0.0,
            step,
            gain: velocity as f32 / 127.0,
            release_step: 0.0,
            envelope: 1.0,
            age: self.note_counter,
        };
    }

    fn note_off(&mut self, note: u8) {
        let step = (1000.0 / (RELEASE_MS * self.sample_rate)) as f32;
        for voice in self.voices.iter_mut().filter(|v| v.active && v.note == note) {
            voice.release_step = step;
        }
    }
}

fn oldest(voices: &[SamplerVoice]) -> usize {
    voices
        .iter()
        .enumerate()
        .min_by_key(|(_, v)| v.age)
        .map(|(i, _)| i)
        .unwrap_or(0)
}

impl EventRenderer for Sampler {
    fn handle_event(&mut self, message: MidiMessage) {
        match message {
            MidiMessage::NoteOn { note, velocity } => self.note_on(note, velocity),
            MidiMessage::NoteOff { note } => self.note_off(note),
            MidiMessage::AllNotesOff => {
                for voice in &mut self.voices {
                    voice.active = false;
                }
            }
        }
    }

    fn render_range(&mut self, left: &mut [f32], right: &mut [f32]) {
        let Some(sample) = self.sample.as_ref() else {
            return;
        };
        let data = sample.as_slice();
        let last = data.len().saturating_sub(1);

        for voice in self.voices.iter_mut().filter(|v| v.active) {
            for (l, r) in left.iter_mut().zip(right.iter_mut()) {
                let index = voice.position as usize;
                if index >= last {
                    voice.active = false;
                    break;
                }
                let frac = (voice.position - index as f64) as f32;
                let a = data[index];
                let b = data[index + 1];
                let gain = voice.gain * voice.envelope;
                *l += (a.left + (b.left - a.left) * frac) * gain;
                *r += (a.right + (b.right - a.right) * frac) * gain;

                voice.position += voice.step;
                if voice.release_step > 0.0 {
                    voice.envelope -= voice.release_step;
                    if voice.envelope <= 0.0 {
                        voice.active = false;
                        break;
                    }
                }
            }
        }
    }
}

impl HostedPlugin for Sampler {
    fn prepare(&mut self, sample_rate: f64, _max_block: usize, _: ChannelLayout) -> Result<(), PluginError> {
        self.sample_rate = sample_rate.max(1.0);
        self.voices = [SamplerVoice::default(); MAX_VOICES];
        Ok(())
    }

    fn process(&mut self, block: &mut AudioBlock<'_>, midi: &[MidiEvent]) -> Result<(), PluginError> {
        if block.num_channels() < 2 {
            return Err(PluginError::Unsupported("sampler needs two channels".into()));
        }
        let (left, right) = block.stereo_mut();
        render_with_events(self, left, right, midi);
        Ok(())
    }

    fn release(&mut self) {
        self.voices = [SamplerVoice::default(); MAX_VOICES];
    }

    fn latency_samples(&self) -> u32 {
        0
    }

    fn channel_counts(&self) -> ChannelCounts {
        ChannelCounts {
            inputs: 0,
            outputs: 2,
        }
    }

    fn supports_layout(&self, layout: ChannelLayout) -> bool {
        layout == ChannelLayout::NO_INPUT
    }
}

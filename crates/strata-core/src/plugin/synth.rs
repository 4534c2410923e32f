//! Built-in basic synth
//!
//! The fallback instrument when a track has neither a hosted instrument
//! nor a sample: eight voices of sine plus a touch of second harmonic
//! with a linear attack/release envelope. Fully deterministic, so the
//! same MIDI always renders the same samples.

use std::f64::consts::TAU;

use crate::types::AudioBlock;

use super::midi::{note_to_hz, render_with_events, EventRenderer};
use super::{ChannelCounts, ChannelLayout, HostedPlugin, MidiEvent, MidiMessage, PluginError};

const MAX_VOICES: usize = 8;
const ATTACK_MS: f64 = 5.0;
const RELEASE_MS: f64 = 150.0;
/// Headroom so a full chord stays below 0 dBFS
const OUTPUT_GAIN: f32 = 0.2;
const HARMONIC_MIX: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Stage {
    #[default]
    Idle,
    Attack,
    Sustain,
    Release,
}

#[derive(Debug, Clone, Copy, Default)]
struct SynthVoice {
    stage: Stage,
    note: u8,
    phase: f64,
    phase_inc: f64,
    velocity: f32,
    envelope: f32,
    age: u64,
}

impl SynthVoice {
    #[inline]
    fn is_active(&self) -> bool {
        self.stage != Stage::Idle
    }
}

/// Polyphonic sine synth
#[derive(Debug)]
pub struct BasicSynth {
    sample_rate: f64,
    voices: [SynthVoice; MAX_VOICES],
    attack_step: f32,
    release_step: f32,
    note_counter: u64,
}

impl Default for BasicSynth {
    fn default() -> Self {
        Self::new()
    }
}

impl BasicSynth {
    pub fn new() -> Self {
        let mut synth = Self {
            sample_rate: 48000.0,
            voices: [SynthVoice::default(); MAX_VOICES],
            attack_step: 0.0,
            release_step: 0.0,
            note_counter: 0,
        };
        synth.set_sample_rate(48000.0);
        synth
    }

    fn set_sample_rate(&mut self, sample_rate: f64) {
        self.sample_rate = sample_rate.max(1.0);
        self.attack_step = (1000.0 / (ATTACK_MS * self.sample_rate)) as f32;
        self.release_step = (1000.0 / (RELEASE_MS * self.sample_rate)) as f32;
    }

    /// Number of voices currently sounding
    pub fn active_voices(&self) -> usize {
        self.voices.iter().filter(|v| v.is_active()).count()
    }

    fn note_on(&mut self, note: u8, velocity: u8) {
        self.note_counter += 1;
        let index = self
            .voices
            .iter()
            .position(|v| v.is_active() && v.note == note)
            .or_else(|| self.voices.iter().position(|v| !v.is_active()))
            .unwrap_or_else(|| {
                self.voices
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, v)| v.age)
                    .map(|(i, _)| i)
                    .unwrap_or(0)
            });

        let voice = &mut self.voices[index];
        *voice = SynthVoice {
            stage: Stage::Attack,
            note,
            phase: 0.0,
            phase_inc: note_to_hz(note) / self.sample_rate,
            velocity: velocity as f32 / 127.0,
            envelope: 0.0,
            age: self.note_counter,
        };
    }

    fn note_off(&mut self, note: u8) {
        for voice in self.voices.iter_mut().filter(|v| v.is_active() && v.note == note) {
            voice.stage = Stage::Release;
        }
    }
}

impl EventRenderer for BasicSynth {
    fn handle_event(&mut self, message: MidiMessage) {
        match message {
            MidiMessage::NoteOn { note, velocity } => self.note_on(note, velocity),
            MidiMessage::NoteOff { note } => self.note_off(note),
            MidiMessage::AllNotesOff => {
                for voice in self.voices.iter_mut().filter(|v| v.is_active()) {
                    voice.stage = Stage::Release;
                }
            }
        }
    }

    fn render_range(&mut self, left: &mut [f32], right: &mut [f32]) {
        let attack_step = self.attack_step;
        let release_step = self.release_step;

        for voice in self.voices.iter_mut().filter(|v| v.is_active()) {
            for (l, r) in left.iter_mut().zip(right.iter_mut()) {
                match voice.stage {
                    Stage::Attack => {
                        voice.envelope += attack_step;
                        if voice.envelope >= 1.0 {
                            voice.envelope = 1.0;
                            voice.stage = Stage::Sustain;
                        }
                    }
                    Stage::Release => {
                        voice.envelope -= release_step;
                        if voice.envelope <= 0.0 {
                            voice.envelope = 0.0;
                            voice.stage = Stage::Idle;
                            break;
                        }
                    }
                    Stage::Sustain | Stage::Idle => {}
                }

                let angle = voice.phase * TAU;
                let tone = angle.sin() + HARMONIC_MIX * (2.0 * angle).sin();
                let out = tone as f32 * voice.envelope * voice.velocity * OUTPUT_GAIN;
                *l += out;
                *r += out;

                voice.phase += voice.phase_inc;
                if voice.phase >= 1.0 {
                    voice.phase -= 1.0;
                }
            }
        }
    }
}

impl HostedPlugin for BasicSynth {
    fn prepare(&mut self, sample_rate: f64, _max_block: usize, _: ChannelLayout) -> Result<(), PluginError> {
        self.set_sample_rate(sample_rate);
        self.voices = [SynthVoice::default(); MAX_VOICES];
        Ok(())
    }

    fn process(&mut self, block: &mut AudioBlock<'_>, midi: &[MidiEvent]) -> Result<(), PluginError> {
        if block.num_channels() < 2 {
            return Err(PluginError::Unsupported("synth needs two channels".into()));
        }
        let (left, right) = block.stereo_mut();
        render_with_events(self, left, right, midi);
        Ok(())
    }

    fn release(&mut self) {
        self.voices = [SynthVoice::default(); MAX_VOICES];
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PlanarBuffer;

    fn render(synth: &mut BasicSynth, midi: &[MidiEvent], frames: usize) -> Vec<f32> {
        let mut scratch = PlanarBuffer::new(2, frames);
        let mut block = scratch.block(2, frames);
        synth.process(&mut block, midi).unwrap();
        scratch.channel(0).to_vec()
    }

    #[test]
    fn test_silent_without_notes() {
        let mut synth = BasicSynth::new();
        assert!(render(&mut synth, &[], 256).iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_deterministic() {
        let events = [MidiEvent::note_on(0, 60, 100), MidiEvent::note_on(32, 67, 80)];
        let mut a = BasicSynth::new();
        let mut b = BasicSynth::new();
        assert_eq!(render(&mut a, &events, 512), render(&mut b, &events, 512));
    }

    #[test]
    fn test_note_sounds_and_releases() {
        let mut synth = BasicSynth::new();
        synth.prepare(48000.0, 512, ChannelLayout::NO_INPUT).unwrap();

        let out = render(&mut synth, &[MidiEvent::note_on(0, 69, 127)], 512);
        let peak = out.iter().fold(0.0_f32, |m, s| m.max(s.abs()));
        assert!(peak > 0.1 && peak <= 1.0);
        assert_eq!(synth.active_voices(), 1);

        // 150 ms release at 48kHz
        render(&mut synth, &[MidiEvent::note_off(0, 69)], 8000);
        assert_eq!(synth.active_voices(), 0);
    }

    #[test]
    fn test_voice_stealing() {
        let mut synth = BasicSynth::new();
        let events: Vec<_> = (0..12).map(|n| MidiEvent::note_on(0, 40 + n, 100)).collect();
        render(&mut synth, &events, 64);
        assert_eq!(synth.active_voices(), MAX_VOICES);
    }
}

//! MIDI events for instruments
//!
//! Events reach a track through an `rtrb` ring buffer: the sequencer or a
//! live controller pushes from its own thread, the audio thread drains the
//! queue once per block into a fixed-size event list. Both push and pop are
//! wait-free and never allocate.

/// Capacity of each track's MIDI queue
pub const MIDI_QUEUE_CAPACITY: usize = 512;

/// Maximum events delivered to an instrument in one block
pub const MAX_BLOCK_EVENTS: usize = 256;

/// Sending half of a track's MIDI queue (owned by the producer thread)
pub type MidiSender = rtrb::Producer<MidiEvent>;

/// Receiving half of a track's MIDI queue (owned by the audio thread)
pub type MidiReceiver = rtrb::Consumer<MidiEvent>;

/// Channel-voice message understood by the engine's instruments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiMessage {
    NoteOn { note: u8, velocity: u8 },
    NoteOff { note: u8 },
    AllNotesOff,
}

/// A MIDI message stamped with its frame offset inside the block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiEvent {
    /// Offset from the start of the block
    pub frame: u32,
    pub message: MidiMessage,
}

impl MidiEvent {
    pub fn note_on(frame: u32, note: u8, velocity: u8) -> Self {
        Self {
            frame,
            message: MidiMessage::NoteOn { note, velocity },
        }
    }

    pub fn note_off(frame: u32, note: u8) -> Self {
        Self {
            frame,
            message: MidiMessage::NoteOff { note },
        }
    }

    /// Decode a raw 3-byte channel message
    ///
    /// Note-on with velocity 0 is a note-off; CC 123 is all-notes-off.
    /// Anything else returns `None`.
    pub fn from_bytes(frame: u32, bytes: [u8; 3]) -> Option<Self> {
        let message = match bytes[0] & 0xF0 {
            0x90 if bytes[2] > 0 => MidiMessage::NoteOn {
                note: bytes[1] & 0x7F,
                velocity: bytes[2] & 0x7F,
            },
            0x90 | 0x80 => MidiMessage::NoteOff {
                note: bytes[1] & 0x7F,
            },
            0xB0 if bytes[1] == 123 => MidiMessage::AllNotesOff,
            _ => return None,
        };
        Some(Self { frame, message })
    }
}

/// Something that renders audio between sample-accurate MIDI events
pub(crate) trait EventRenderer {
    fn handle_event(&mut self, message: MidiMessage);
    fn render_range(&mut self, left: &mut [f32], right: &mut [f32]);
}

/// Render `frames` of stereo, applying each event at its frame offset
///
/// Events are expected in frame order; late or out-of-range offsets are
/// clamped so no event is dropped.
pub(crate) fn render_with_events<R: EventRenderer>(
    renderer: &mut R,
    left: &mut [f32],
    right: &mut [f32],
    midi: &[MidiEvent],
) {
    let frames = left.len().min(right.len());
    let mut cursor = 0;
    for event in midi {
        let at = (event.frame as usize).clamp(cursor, frames);
        if at > cursor {
            renderer.render_range(&mut left[cursor..at], &mut right[cursor..at]);
            cursor = at;
        }
        renderer.handle_event(event.message);
    }
    if cursor < frames {
        renderer.render_range(&mut left[cursor..frames], &mut right[cursor..frames]);
    }
}

/// Create a MIDI queue (producer/consumer pair)
pub fn midi_channel() -> (MidiSender, MidiReceiver) {
    rtrb::RingBuffer::new(MIDI_QUEUE_CAPACITY)
}

/// Frequency in Hz of a MIDI note number (A4 = 440 Hz)
#[inline]
pub fn note_to_hz(note: u8) -> f64 {
    440.0 * 2.0_f64.powf((note as f64 - 69.0) / 12.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode() {
        assert_eq!(
            MidiEvent::from_bytes(3, [0x91, 60, 100]),
            Some(MidiEvent::note_on(3, 60, 100))
        );
        assert_eq!(
            MidiEvent::from_bytes(0, [0x90, 60, 0]),
            Some(MidiEvent::note_off(0, 60))
        );
        assert_eq!(
            MidiEvent::from_bytes(0, [0xB0, 123, 0]).map(|e| e.message),
            Some(MidiMessage::AllNotesOff)
        );
        assert_eq!(MidiEvent::from_bytes(0, [0xE0, 0, 64]), None);
    }

    #[test]
    fn test_channel() {
        let (mut tx, mut rx) = midi_channel();
        tx.push(MidiEvent::note_on(0, 64, 90)).unwrap();
        assert_eq!(rx.pop().unwrap(), MidiEvent::note_on(0, 64, 90));
        assert!(rx.pop().is_err());
    }

    struct Recorder {
        ranges: Vec<usize>,
        events: usize,
    }

    impl EventRenderer for Recorder {
        fn handle_event(&mut self, _: MidiMessage) {
            self.events += 1;
        }
        fn render_range(&mut self, left: &mut [f32], _: &mut [f32]) {
            self.ranges.push(left.len());
        }
    }

    #[test]
    fn test_render_splits_at_events() {
        let mut rec = Recorder { ranges: Vec::new(), events: 0 };
        let mut l = [0.0; 64];
        let mut r = [0.0; 64];
        let events = [
            MidiEvent::note_on(10, 60, 100),
            MidiEvent::note_off(10, 60),
            MidiEvent::note_on(500, 62, 100),
        ];
        render_with_events(&mut rec, &mut l, &mut r, &events);
        assert_eq!(rec.events, 3);
        assert_eq!(rec.ranges, vec![10, 54]);
    }

    #[test]
    fn test_note_to_hz() {
        assert!((note_to_hz(69) - 440.0).abs() < 1e-9);
        assert!((note_to_hz(81) - 880.0).abs() < 1e-9);
    }
}

//! Plugin delay compensation across the track graph
//!
//! Every track's main and send paths must reach the buses sample-aligned
//! with the slowest path in the graph. Each track gets two delay lines,
//! allocated once at `prepare`; the reduction sets the compensation per
//! block from the snapshot (`graph max - path latency`) and runs the
//! track's buffers through them.
//!
//! Requests longer than a line are clamped. The audio thread only records
//! the largest one in a shared atomic; the control thread reports it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::types::{StereoBuffer, StereoSample, MAX_LATENCY_SAMPLES, MAX_TRACKS};

/// Which of a track's two outputs a delay line serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyPath {
    Main,
    Send,
}

/// Ring buffer for delay line
struct DelayLine {
    buffer: Vec<StereoSample>,
    write_pos: usize,
    delay_samples: usize,
}

impl DelayLine {
    fn new(max_samples: usize) -> Self {
        Self {
            buffer: vec![StereoSample::silence(); max_samples.max(1)],
            write_pos: 0,
            delay_samples: 0,
        }
    }

    /// Set the delay amount in samples; returns false if it was clamped
    #[inline]
    fn set_delay(&mut self, samples: usize) -> bool {
        self.delay_samples = samples.min(self.buffer.len() - 1);
        self.delay_samples == samples
    }

    #[inline]
    fn process(&mut self, input: StereoSample) -> StereoSample {
        self.buffer[self.write_pos] = input;

        let read_pos = if self.write_pos >= self.delay_samples {
            self.write_pos - self.delay_samples
        } else {
            self.buffer.len() - (self.delay_samples - self.write_pos)
        };
        let output = self.buffer[read_pos];

        self.write_pos = (self.write_pos + 1) % self.buffer.len();
        output
    }

    fn clear(&mut self) {
        self.buffer.fill(StereoSample::silence());
        self.write_pos = 0;
    }
}

/// Take and reset a clamp record, logging it (control thread)
pub fn take_overflow(indicator: &AtomicUsize) -> Option<usize> {
    match indicator.swap(0, Ordering::Relaxed) {
        0 => None,
        samples => {
            log::warn!(
                "[LATENCY] Compensation of {} samples exceeded the line size and was clamped",
                samples
            );
            Some(samples)
        }
    }
}

/// Per-track main and send compensation lines
pub struct LatencyCompensator {
    main: Vec<DelayLine>,
    send: Vec<DelayLine>,
    line_capacity: usize,
    /// Largest clamped request since last taken (0 = none)
    overflow: Arc<AtomicUsize>,
}

impl LatencyCompensator {
    /// Allocate lines for `MAX_TRACKS` tracks, each holding `max_delay` samples
    pub fn new(max_delay: usize) -> Self {
        let line_capacity = max_delay.clamp(1, MAX_LATENCY_SAMPLES) + 1;
        log::debug!(
            "[LATENCY] Allocating {} compensation lines of {} samples",
            MAX_TRACKS * 2,
            line_capacity
        );
        Self {
            main: (0..MAX_TRACKS).map(|_| DelayLine::new(line_capacity)).collect(),
            send: (0..MAX_TRACKS).map(|_| DelayLine::new(line_capacity)).collect(),
            line_capacity,
            overflow: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Record clamps into an existing indicator (kept across rebuilds)
    pub(crate) fn with_overflow(mut self, overflow: Arc<AtomicUsize>) -> Self {
        self.overflow = overflow;
        self
    }

    /// Shared record of the largest clamped request (0 = none)
    pub fn overflow_indicator(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.overflow)
    }

    /// Take and reset the largest clamped request
    pub fn take_overflow(&self) -> Option<usize> {
        take_overflow(&self.overflow)
    }

    /// Largest compensation a line can apply
    pub fn max_delay(&self) -> usize {
        self.line_capacity - 1
    }

    /// Delay `buffer` in place by `delay` samples on one track path
    pub fn process(
        &mut self,
        track: usize,
        path: LatencyPath,
        delay: usize,
        buffer: &mut StereoBuffer,
    ) {
        let lines = match path {
            LatencyPath::Main => &mut self.main,
            LatencyPath::Send => &mut self.send,
        };
        let Some(line) = lines.get_mut(track) else {
            return;
        };
        if !line.set_delay(delay) {
            self.overflow.fetch_max(delay, Ordering::Relaxed);
        }
        for sample in buffer.iter_mut() {
            *sample = line.process(*sample);
        }
    }

    /// Clear both lines of one track
    pub fn clear_track(&mut self, track: usize) {
        for lines in [&mut self.main, &mut self.send] {
            if let Some(line) = lines.get_mut(track) {
                line.clear();
            }
        }
    }

    /// Clear all delay lines
    pub fn clear(&mut self) {
        for line in self.main.iter_mut().chain(self.send.iter_mut()) {
            line.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_line() {
        let mut delay = DelayLine::new(10);
        delay.set_delay(3);

        let s1 = StereoSample::new(1.0, 1.0);
        let s2 = StereoSample::new(2.0, 2.0);
        let s3 = StereoSample::new(3.0, 3.0);
        let s4 = StereoSample::new(4.0, 4.0);

        assert_eq!(delay.process(s1), StereoSample::silence());
        assert_eq!(delay.process(s2), StereoSample::silence());
        assert_eq!(delay.process(s3), StereoSample::silence());
        assert_eq!(delay.process(s4), s1);
    }

    #[test]
    fn test_zero_delay_is_passthrough() {
        let mut comp = LatencyCompensator::new(64);
        let mut buffer = StereoBuffer::from_interleaved(&[0.1, 0.2, 0.3, 0.4]);
        let original = buffer.clone();
        comp.process(5, LatencyPath::Main, 0, &mut buffer);
        assert_eq!(buffer, original);
    }

    #[test]
    fn test_paths_are_independent() {
        let mut comp = LatencyCompensator::new(64);
        let impulse = || {
            let mut b = StereoBuffer::silence(16);
            b[0] = StereoSample::mono(1.0);
            b
        };

        let mut main = impulse();
        let mut send = impulse();
        comp.process(0, LatencyPath::Main, 4, &mut main);
        comp.process(0, LatencyPath::Send, 9, &mut send);
        assert_eq!(main[4], StereoSample::mono(1.0));
        assert_eq!(send[9], StereoSample::mono(1.0));
        assert_eq!(send[4], StereoSample::silence());
    }

    #[test]
    fn test_delay_spans_blocks() {
        let mut comp = LatencyCompensator::new(64);
        let mut first = StereoBuffer::silence(8);
        first[6] = StereoSample::mono(1.0);
        comp.process(1, LatencyPath::Main, 5, &mut first);
        assert_eq!(first.peak(), 0.0);

        let mut second = StereoBuffer::silence(8);
        comp.process(1, LatencyPath::Main, 5, &mut second);
        assert_eq!(second[3], StereoSample::mono(1.0));
    }

    #[test]
    fn test_oversized_delay_is_clamped() {
        let mut comp = LatencyCompensator::new(16);
        assert_eq!(comp.max_delay(), 16);
        let mut buffer = StereoBuffer::silence(40);
        buffer[0] = StereoSample::mono(1.0);
        comp.process(0, LatencyPath::Send, 1000, &mut buffer);
        assert_eq!(buffer[16], StereoSample::mono(1.0));

        comp.process(1, LatencyPath::Main, 400, &mut StereoBuffer::silence(4));
        assert_eq!(comp.take_overflow(), Some(1000));
        assert_eq!(comp.take_overflow(), None);

        comp.process(0, LatencyPath::Main, 16, &mut StereoBuffer::silence(4));
        assert_eq!(comp.take_overflow(), None);
    }

    #[test]
    fn test_clear_track_drops_tail() {
        let mut comp = LatencyCompensator::new(64);
        let mut tail = StereoBuffer::silence(8);
        tail[6] = StereoSample::mono(1.0);
        comp.process(3, LatencyPath::Main, 5, &mut tail.clone());
        comp.process(3, LatencyPath::Send, 5, &mut tail);

        comp.clear_track(3);
        let mut main = StereoBuffer::silence(8);
        let mut send = StereoBuffer::silence(8);
        comp.process(3, LatencyPath::Main, 5, &mut main);
        comp.process(3, LatencyPath::Send, 5, &mut send);
        assert_eq!(main.peak(), 0.0);
        assert_eq!(send.peak(), 0.0);
    }

    #[test]
    fn test_out_of_range_track_is_ignored() {
        let mut comp = LatencyCompensator::new(16);
        let mut buffer = StereoBuffer::silence(4);
        buffer[0] = StereoSample::mono(1.0);
        comp.process(MAX_TRACKS, LatencyPath::Main, 2, &mut buffer);
        assert_eq!(buffer[0], StereoSample::mono(1.0));
    }
}

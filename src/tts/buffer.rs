//! Adaptive stream buffer between the TTS body reader and the output device.
//!
//! Decides when playback may begin and tracks how much audio is ahead of the
//! playback cursor. Two gates guard the start: a hard minimum of buffered
//! milliseconds, and an early-start fraction of the estimated clip length.
//! The estimate (`words / WPM`) is advisory; the minimum-buffer gate always
//! applies, and stream completion always permits starting.

use std::collections::VecDeque;

/// Underrun accounting: any `drain` call after playback start that returns
/// fewer samples than requested while the stream is still incomplete counts
/// as one underrun. A short drain at end-of-stream is the natural tail, not
/// an underrun.
#[derive(Debug)]
pub struct AdaptiveStreamBuffer {
    queue: VecDeque<i16>,
    sample_rate: u32,
    min_buffer_samples: u64,
    early_start_threshold: f64,
    max_buffer_samples: usize,
    estimated_total_samples: Option<u64>,
    received_samples: u64,
    started: bool,
    complete: bool,
    underruns: u64,
}

impl AdaptiveStreamBuffer {
    pub fn new(
        sample_rate: u32,
        min_buffer_ms: u64,
        early_start_threshold: f64,
        max_buffer_s: f64,
    ) -> Self {
        Self {
            queue: VecDeque::new(),
            sample_rate,
            min_buffer_samples: sample_rate as u64 * min_buffer_ms / 1000,
            early_start_threshold: early_start_threshold.clamp(0.0, 1.0),
            max_buffer_samples: (sample_rate as f64 * max_buffer_s.max(0.1)) as usize,
            estimated_total_samples: None,
            received_samples: 0,
            started: false,
            complete: false,
            underruns: 0,
        }
    }

    /// Estimate the clip length from the message text and a voice speaking
    /// rate. Empty text leaves the estimate unset and the minimum-buffer
    /// gate alone governs.
    pub fn set_estimate_from_text(&mut self, text: &str, wpm: f64) {
        let words = text.split_whitespace().count();
        if words == 0 || wpm <= 0.0 {
            return;
        }
        let seconds = words as f64 / wpm * 60.0;
        self.estimated_total_samples = Some((seconds * self.sample_rate as f64) as u64);
    }

    /// Append decoded PCM samples.
    pub fn push(&mut self, samples: &[i16]) {
        self.received_samples += samples.len() as u64;
        self.queue.extend(samples.iter().copied());
    }

    /// No more samples will arrive.
    pub fn mark_complete(&mut self) {
        self.complete = true;
    }

    /// Whether playback may begin. Latches: once true, stays true.
    pub fn should_start_playback(&mut self) -> bool {
        if self.started {
            return true;
        }
        if self.received_samples == 0 {
            return false;
        }
        let start = if self.complete {
            true
        } else {
            self.queue.len() as u64 >= self.min_buffer_samples && self.early_gate_open()
        };
        if start {
            self.started = true;
        }
        start
    }

    /// The early-start fraction gate. Open when disabled (threshold 0), when
    /// no estimate exists, or when enough of the estimated clip has arrived.
    fn early_gate_open(&self) -> bool {
        if self.early_start_threshold == 0.0 {
            return true;
        }
        match self.estimated_total_samples {
            None => true,
            Some(total) if total == 0 => true,
            Some(total) => self.received_samples as f64 / total as f64 >= self.early_start_threshold,
        }
    }

    /// Pull up to `out.len()` samples toward the output device.
    pub fn drain(&mut self, out: &mut [i16]) -> usize {
        let n = out.len().min(self.queue.len());
        for slot in out.iter_mut().take(n) {
            // n is bounded by queue length, so pop_front cannot miss.
            *slot = self.queue.pop_front().unwrap_or(0);
        }
        if self.started && !self.complete && n < out.len() {
            self.underruns += 1;
        }
        n
    }

    /// Milliseconds of audio currently ahead of the playback cursor.
    pub fn buffered_ms(&self) -> u64 {
        self.queue.len() as u64 * 1000 / self.sample_rate as u64
    }

    /// Whether pushes should pause to respect the buffer cap.
    pub fn at_capacity(&self) -> bool {
        self.queue.len() >= self.max_buffer_samples
    }

    /// Stream finished and everything buffered was drained.
    pub fn is_exhausted(&self) -> bool {
        self.complete && self.queue.is_empty()
    }

    /// Discard buffered audio (cancellation path). Marks the stream complete
    /// so any attached source terminates.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.complete = true;
    }

    pub fn underruns(&self) -> u64 {
        self.underruns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 24_000;

    fn samples(ms: u64) -> Vec<i16> {
        vec![0i16; (RATE as u64 * ms / 1000) as usize]
    }

    #[test]
    fn waits_for_minimum_buffer() {
        let mut buf = AdaptiveStreamBuffer::new(RATE, 100, 0.0, 2.0);
        buf.push(&samples(50));
        assert!(!buf.should_start_playback());
        buf.push(&samples(60));
        assert!(buf.should_start_playback());
        assert!(buf.buffered_ms() >= 100);
    }

    #[test]
    fn zero_gates_start_on_first_chunk() {
        let mut buf = AdaptiveStreamBuffer::new(RATE, 0, 0.0, 2.0);
        assert!(!buf.should_start_playback(), "no audio yet");
        buf.push(&[0i16; 16]);
        assert!(buf.should_start_playback());
    }

    #[test]
    fn estimate_gate_delays_start() {
        let mut buf = AdaptiveStreamBuffer::new(RATE, 100, 0.35, 10.0);
        // ~60 words at 170 WPM ≈ 21 s estimated.
        let text = "word ".repeat(60);
        buf.set_estimate_from_text(&text, 170.0);
        // Minimum met, but only a sliver of the estimate has arrived.
        buf.push(&samples(200));
        assert!(!buf.should_start_playback());
        // Push past 35% of the estimate.
        buf.push(&samples(8_000));
        assert!(buf.should_start_playback());
    }

    #[test]
    fn unknown_estimate_uses_minimum_gate_alone() {
        let mut buf = AdaptiveStreamBuffer::new(RATE, 100, 0.35, 2.0);
        buf.push(&samples(120));
        assert!(buf.should_start_playback());
    }

    #[test]
    fn completion_permits_start_below_minimum() {
        let mut buf = AdaptiveStreamBuffer::new(RATE, 150, 0.35, 2.0);
        buf.push(&samples(40));
        assert!(!buf.should_start_playback());
        buf.mark_complete();
        assert!(buf.should_start_playback());
    }

    #[test]
    fn start_latches() {
        let mut buf = AdaptiveStreamBuffer::new(RATE, 100, 0.0, 2.0);
        buf.push(&samples(120));
        assert!(buf.should_start_playback());
        let mut out = vec![0i16; buf.buffered_ms() as usize * 24];
        buf.drain(&mut out);
        // Queue is drained, but the start decision does not revert.
        assert!(buf.should_start_playback());
    }

    #[test]
    fn underrun_counted_only_after_start_and_before_completion() {
        let mut buf = AdaptiveStreamBuffer::new(RATE, 0, 0.0, 2.0);
        let mut out = [0i16; 64];
        // Not started yet: short drain is not an underrun.
        assert_eq!(buf.drain(&mut out), 0);
        assert_eq!(buf.underruns(), 0);

        buf.push(&[1i16; 32]);
        assert!(buf.should_start_playback());
        assert_eq!(buf.drain(&mut out), 32);
        assert_eq!(buf.underruns(), 1);

        // After completion the short tail drain is normal.
        buf.push(&[1i16; 16]);
        buf.mark_complete();
        assert_eq!(buf.drain(&mut out), 16);
        assert_eq!(buf.underruns(), 1);
        assert!(buf.is_exhausted());
    }

    #[test]
    fn cap_reports_capacity() {
        let mut buf = AdaptiveStreamBuffer::new(RATE, 0, 0.0, 1.0);
        assert!(!buf.at_capacity());
        buf.push(&samples(1_100));
        assert!(buf.at_capacity());
    }

    #[test]
    fn clear_discards_and_terminates() {
        let mut buf = AdaptiveStreamBuffer::new(RATE, 0, 0.0, 2.0);
        buf.push(&samples(500));
        buf.clear();
        assert_eq!(buf.buffered_ms(), 0);
        assert!(buf.is_exhausted());
    }
}

//! Silence-detection recorder.
//!
//! Captures microphone audio and decides when the user has finished talking.
//! The temporal logic lives in [`SilenceTracker`], a pure per-frame state
//! machine over the VAD's speech/silence decisions; the async [`record`]
//! loop owns the device, the cancel/stop signals, and the one-restart
//! device-resilience policy.
//!
//! The same loop serves push-to-talk: an external stop signal (watch
//! channel) ends the recording, and the hybrid mode keeps VAD-based stop
//! active alongside it.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::audio::{CaptureSession, CAPTURE_SAMPLE_RATE, FRAME_MS, FRAME_SAMPLES};
use crate::cancel::CancelFlag;
use crate::error::Result;
use crate::vad::{is_valid_frame_len, to_vad_rate, VoiceActivityDetector};

/// Phases of an in-progress recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderPhase {
    WaitingForSpeech,
    SpeechActive,
    SilenceAfterSpeech,
}

/// Why a recording ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    /// End-of-utterance silence was observed.
    Silence,
    /// The external stop signal fired (PTT release / toggle / timeout).
    ExternalStop,
    /// The hard duration cap was reached.
    MaxDuration,
    Cancelled,
    /// The input stream failed twice.
    DeviceError,
}

/// A completed recording.
#[derive(Debug)]
pub struct Recording {
    pub pcm: Vec<i16>,
    pub sample_rate: u32,
    /// Any frame was classified as speech during the recording.
    pub speech_detected: bool,
    pub stop_cause: StopCause,
    /// The external stop arrived before the minimum-duration floor; the
    /// recording ran to the floor but the press was a sub-minimum tap.
    pub early_release: bool,
    /// Capture-queue overflow observed during the recording.
    pub dropped_samples: u64,
}

impl Recording {
    pub fn duration_s(&self) -> f64 {
        self.pcm.len() as f64 / self.sample_rate as f64
    }
}

#[derive(Debug, Clone)]
pub struct RecorderOptions {
    pub min_duration_s: f64,
    pub max_duration_s: f64,
    pub grace_period_s: f64,
    pub silence_threshold_ms: u64,
    /// Whether end-of-utterance silence may end the recording. Off for PTT
    /// hold/toggle, on for VAD capture and PTT hybrid.
    pub vad_stop: bool,
    pub input_device: Option<String>,
}

/// Pure per-frame decision core. Feeds on VAD verdicts, tracks the phase
/// machine, and says when to stop.
#[derive(Debug)]
pub struct SilenceTracker {
    phase: RecorderPhase,
    elapsed_ms: u64,
    silence_ms: u64,
    speech_detected: bool,
    min_ms: u64,
    max_ms: u64,
    grace_ms: u64,
    silence_threshold_ms: u64,
    vad_stop: bool,
}

impl SilenceTracker {
    pub fn new(opts: &RecorderOptions) -> Self {
        Self {
            phase: RecorderPhase::WaitingForSpeech,
            elapsed_ms: 0,
            silence_ms: 0,
            speech_detected: false,
            min_ms: (opts.min_duration_s * 1000.0) as u64,
            max_ms: (opts.max_duration_s * 1000.0) as u64,
            grace_ms: (opts.grace_period_s * 1000.0) as u64,
            silence_threshold_ms: opts.silence_threshold_ms,
            vad_stop: opts.vad_stop,
        }
    }

    pub fn phase(&self) -> RecorderPhase {
        self.phase
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }

    pub fn speech_detected(&self) -> bool {
        self.speech_detected
    }

    /// The minimum-duration floor has elapsed.
    pub fn past_min_duration(&self) -> bool {
        self.elapsed_ms >= self.min_ms
    }

    /// Observe one frame's VAD verdict. Returns a stop cause when the
    /// recording should end.
    pub fn observe(&mut self, is_speech: bool, frame_ms: u64) -> Option<StopCause> {
        self.elapsed_ms += frame_ms;

        if self.elapsed_ms >= self.max_ms {
            return Some(StopCause::MaxDuration);
        }

        if is_speech {
            self.speech_detected = true;
            self.silence_ms = 0;
            self.phase = RecorderPhase::SpeechActive;
            return None;
        }

        match self.phase {
            RecorderPhase::WaitingForSpeech => {
                // During the grace window silence cannot end the recording.
                if self.elapsed_ms > self.grace_ms {
                    self.silence_ms += frame_ms;
                }
            }
            RecorderPhase::SpeechActive => {
                self.phase = RecorderPhase::SilenceAfterSpeech;
                self.silence_ms = frame_ms;
            }
            RecorderPhase::SilenceAfterSpeech => {
                self.silence_ms += frame_ms;
            }
        }

        if self.vad_stop
            && self.silence_ms >= self.silence_threshold_ms
            && self.past_min_duration()
        {
            return Some(StopCause::Silence);
        }
        None
    }
}

/// Record until end-of-utterance, external stop, hard cap, cancellation, or
/// device failure. Device-open errors return fast so callers can retry.
///
/// `ready_tx` fires once the input stream is armed; the PTT controller uses
/// it to distinguish start failures (retried with backoff) from completed
/// recordings.
pub async fn record(
    opts: RecorderOptions,
    vad: VoiceActivityDetector,
    cancel: CancelFlag,
    mut stop_rx: Option<watch::Receiver<bool>>,
    ready_tx: Option<tokio::sync::oneshot::Sender<()>>,
) -> Result<Recording> {
    let mut session = CaptureSession::open(opts.input_device.as_deref())?;
    if let Some(tx) = ready_tx {
        let _ = tx.send(());
    }
    debug!(
        vad_stop = opts.vad_stop,
        aggressiveness = vad.aggressiveness(),
        min_s = opts.min_duration_s,
        max_s = opts.max_duration_s,
        "recording started"
    );

    let mut tracker = SilenceTracker::new(&opts);
    let mut pcm: Vec<i16> = Vec::new();
    let mut frame = vec![0i16; FRAME_SAMPLES];
    let mut frame_index: u64 = 0;
    let mut restarted = false;
    let mut stop_requested = false;
    let mut early_release = false;

    let finish = |pcm: Vec<i16>,
                  tracker: &SilenceTracker,
                  cause: StopCause,
                  early_release: bool,
                  dropped: u64| {
        info!(
            duration_s = pcm.len() as f64 / CAPTURE_SAMPLE_RATE as f64,
            speech = tracker.speech_detected(),
            ?cause,
            dropped,
            "recording finished"
        );
        Recording {
            pcm,
            sample_rate: CAPTURE_SAMPLE_RATE,
            speech_detected: tracker.speech_detected(),
            stop_cause: cause,
            early_release,
            dropped_samples: dropped,
        }
    };

    loop {
        if cancel.is_cancelled() {
            let dropped = session.dropped_samples();
            return Ok(finish(Vec::new(), &tracker, StopCause::Cancelled, false, dropped));
        }

        if let Some(rx) = &mut stop_rx {
            if *rx.borrow_and_update() && !stop_requested {
                stop_requested = true;
                early_release = !tracker.past_min_duration();
            }
        }
        // An early stop request is remembered and honored once the
        // minimum-duration floor elapses. Keep the tail captured since the
        // last full frame.
        if stop_requested && tracker.past_min_duration() {
            let remaining = session.drain_remaining();
            pcm.extend_from_slice(&remaining);
            let dropped = session.dropped_samples();
            return Ok(finish(pcm, &tracker, StopCause::ExternalStop, early_release, dropped));
        }

        if session.failed() {
            if restarted {
                warn!("input stream failed twice, surfacing device error");
                let dropped = session.dropped_samples();
                return Ok(finish(pcm, &tracker, StopCause::DeviceError, false, dropped));
            }
            warn!(
                phase = ?tracker.phase(),
                elapsed_ms = tracker.elapsed_ms(),
                "input stream failed, attempting one restart"
            );
            restarted = true;
            drop(session);
            tokio::time::sleep(Duration::from_millis(200)).await;
            session = CaptureSession::open(opts.input_device.as_deref())?;
            continue;
        }

        if session.available() < FRAME_SAMPLES {
            tokio::time::sleep(Duration::from_millis(10)).await;
            continue;
        }

        let n = session.read(&mut frame);
        if n < FRAME_SAMPLES {
            continue;
        }
        frame_index += 1;
        pcm.extend_from_slice(&frame);

        let vad_frame = to_vad_rate(&frame, CAPTURE_SAMPLE_RATE);
        debug_assert!(is_valid_frame_len(vad_frame.len()));
        let is_speech = vad.is_speech(&vad_frame);

        if let Some(cause) = tracker.observe(is_speech, FRAME_MS) {
            let dropped = session.dropped_samples();
            debug!(
                frames = frame_index,
                elapsed_ms = tracker.elapsed_ms(),
                ?cause,
                "recorder stop condition met"
            );
            return Ok(finish(pcm, &tracker, cause, false, dropped));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> RecorderOptions {
        RecorderOptions {
            min_duration_s: 0.3,
            max_duration_s: 120.0,
            grace_period_s: 1.5,
            silence_threshold_ms: 1000,
            vad_stop: true,
            input_device: None,
        }
    }

    /// Feed `speech_ms` of speech frames, then silence until the tracker
    /// stops or `max_ms` total elapses.
    fn run_frames(tracker: &mut SilenceTracker, speech_ms: u64, max_ms: u64) -> Option<StopCause> {
        let mut t = 0;
        while t < speech_ms {
            if let Some(c) = tracker.observe(true, FRAME_MS) {
                return Some(c);
            }
            t += FRAME_MS;
        }
        while t < max_ms {
            if let Some(c) = tracker.observe(false, FRAME_MS) {
                return Some(c);
            }
            t += FRAME_MS;
        }
        None
    }

    #[test]
    fn end_of_utterance_timing() {
        // 2.0 s of speech then silence; threshold 1000 ms, min 0.3 s.
        // Stop lands between 3.0 and 3.1 s of elapsed audio.
        let mut tracker = SilenceTracker::new(&opts());
        let cause = run_frames(&mut tracker, 2_000, 10_000);
        assert_eq!(cause, Some(StopCause::Silence));
        assert!(tracker.speech_detected());
        assert!(
            (3_000..=3_100).contains(&tracker.elapsed_ms()),
            "stopped at {} ms",
            tracker.elapsed_ms()
        );
    }

    #[test]
    fn speech_resets_the_silence_accumulator() {
        let mut tracker = SilenceTracker::new(&opts());
        // Speech, then 900 ms of silence (below threshold), then speech again.
        assert!(run_frames(&mut tracker, 600, 600).is_none());
        for _ in 0..30 {
            assert_eq!(tracker.observe(false, FRAME_MS), None);
        }
        assert_eq!(tracker.phase(), RecorderPhase::SilenceAfterSpeech);
        assert_eq!(tracker.observe(true, FRAME_MS), None);
        assert_eq!(tracker.phase(), RecorderPhase::SpeechActive);
        // A fresh full threshold of silence is needed again.
        let mut silent = 0;
        let cause = loop {
            if let Some(c) = tracker.observe(false, FRAME_MS) {
                break c;
            }
            silent += FRAME_MS;
            assert!(silent <= 1_100);
        };
        assert_eq!(cause, StopCause::Silence);
    }

    #[test]
    fn grace_period_defers_no_speech_stop() {
        // All silence: nothing can stop inside the 1.5 s grace window; the
        // silence threshold then runs from the end of grace.
        let mut tracker = SilenceTracker::new(&opts());
        let cause = run_frames(&mut tracker, 0, 30_000);
        assert_eq!(cause, Some(StopCause::Silence));
        assert!(!tracker.speech_detected());
        assert!(
            tracker.elapsed_ms() >= 2_500,
            "stopped too early at {} ms",
            tracker.elapsed_ms()
        );
    }

    #[test]
    fn minimum_duration_floors_the_stop() {
        let mut o = opts();
        o.min_duration_s = 5.0;
        o.grace_period_s = 0.0;
        let mut tracker = SilenceTracker::new(&o);
        let cause = run_frames(&mut tracker, 0, 60_000);
        assert_eq!(cause, Some(StopCause::Silence));
        assert!(tracker.elapsed_ms() >= 5_000);
    }

    #[test]
    fn fixed_duration_when_min_equals_max() {
        let mut o = opts();
        o.min_duration_s = 2.0;
        o.max_duration_s = 2.0;
        let mut tracker = SilenceTracker::new(&o);
        // Continuous speech cannot extend past the cap, and silence cannot
        // stop before it.
        let cause = run_frames(&mut tracker, 10_000, 0);
        assert_eq!(cause, Some(StopCause::MaxDuration));
        assert!((1_980..=2_040).contains(&tracker.elapsed_ms()));
    }

    #[test]
    fn vad_stop_disabled_never_stops_on_silence() {
        let mut o = opts();
        o.vad_stop = false;
        o.max_duration_s = 4.0;
        let mut tracker = SilenceTracker::new(&o);
        let cause = run_frames(&mut tracker, 500, 60_000);
        // Only the hard cap ends it.
        assert_eq!(cause, Some(StopCause::MaxDuration));
    }
}

//! Push-to-talk controller.
//!
//! Gates the recorder on keyboard input. The state machine lives in
//! [`state`]; this module owns the side effects: starting the keyboard
//! listener, arming the recorder (with retries), forwarding stop/cancel
//! signals, and enforcing the recording hard cap.
//!
//! Invalid events for the current state are logged and dropped; they never
//! abort the controller.

pub mod state;

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

pub use state::{transition, PttEvent, PttMode, PttState};

use crate::cancel::CancelFlag;
use crate::config::Config;
use crate::error::{Result, VoiceError};
use crate::hotkey::{HotkeyConfig, KeyEvent, KeyboardHandler};
use crate::recorder::{record, Recording, RecorderOptions, StopCause};
use crate::vad::VoiceActivityDetector;

/// Bounded key-event queue between the listener thread and the controller.
const KEY_QUEUE_CAPACITY: usize = 100;

/// Recorder arm attempts before giving up.
const START_RETRIES: u32 = 3;

/// Backoff base for arm retries; doubles per attempt.
const START_BACKOFF_MS: u64 = 100;

pub struct PttController {
    mode: PttMode,
    timeout_s: f64,
    min_duration_s: f64,
    handler: KeyboardHandler,
    key_rx: Option<mpsc::Receiver<KeyEvent>>,
    state: Arc<AtomicU8>,
    enabled: bool,
}

impl PttController {
    pub fn new(config: &Config) -> Self {
        let handler = KeyboardHandler::new(HotkeyConfig {
            combo: config.ptt_key_combo.clone(),
            cancel_key: config.ptt_cancel_key.clone(),
            debounce_ms: config.ptt_debounce_ms,
        });
        Self {
            mode: config.ptt_mode,
            timeout_s: config.ptt_timeout_s,
            min_duration_s: config.ptt_min_duration_s,
            handler,
            key_rx: None,
            state: Arc::new(AtomicU8::new(PttState::Idle as u8)),
            enabled: false,
        }
    }

    /// Observable state snapshot.
    pub fn current_state(&self) -> PttState {
        PttState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Start the keyboard listener and arm the state machine. Idempotent.
    pub fn enable(&mut self) -> Result<()> {
        if self.enabled {
            return Ok(());
        }
        let (tx, rx) = mpsc::channel(KEY_QUEUE_CAPACITY);
        self.handler.start(tx)?;
        self.key_rx = Some(rx);
        self.apply(PttEvent::Enable);
        self.enabled = true;
        info!(mode = %self.mode, "ptt controller enabled");
        Ok(())
    }

    /// Stop the listener and return to idle. Calling twice is a no-op the
    /// second time.
    pub fn disable(&mut self) {
        if !self.enabled {
            return;
        }
        self.handler.stop();
        self.key_rx = None;
        self.state.store(PttState::Idle as u8, Ordering::Release);
        self.enabled = false;
        info!("ptt controller disabled");
    }

    /// Transcription finished (or the turn short-circuited); release the
    /// turn. A no-op outside the processing state.
    pub fn turn_done(&self) {
        if self.current_state() == PttState::Processing {
            self.apply(PttEvent::TurnDone);
        }
    }

    /// Apply an event through the transition table. Invalid pairs are logged
    /// and dropped, leaving state unchanged.
    fn apply(&self, event: PttEvent) -> bool {
        let current = self.current_state();
        match transition(current, event, self.mode) {
            Some(next) => {
                debug!(from = %current, to = %next, ?event, "ptt transition");
                self.state.store(next as u8, Ordering::Release);
                true
            }
            None => {
                warn!(state = %current, ?event, "invalid ptt event dropped");
                false
            }
        }
    }

    /// Internal re-arm outside the event table (sub-minimum tap discard and
    /// the start-failure path).
    fn force_state(&self, state: PttState) {
        debug!(to = %state, "ptt state forced");
        self.state.store(state as u8, Ordering::Release);
    }

    /// Run one key-gated recording: wait for the combo, record until the
    /// mode's stop condition, and return the captured audio. Sub-minimum
    /// taps in hold/hybrid mode are discarded and the controller re-arms.
    ///
    /// `opts.max_duration_s` also bounds the wait for the first key press.
    pub async fn acquire(
        &mut self,
        opts: &RecorderOptions,
        vad: &VoiceActivityDetector,
        cancel: &CancelFlag,
    ) -> Result<Recording> {
        self.enable()?;
        // Re-arm after a previous turn released back to idle; the listener
        // itself stays up across turns.
        if self.current_state() == PttState::Idle {
            self.apply(PttEvent::Enable);
        }

        let wait_deadline =
            Instant::now() + Duration::from_secs_f64(opts.max_duration_s.max(1.0));

        // Silence may stop the recording only in hybrid mode; hold and
        // toggle are gated purely by the key (and the hard cap). The PTT
        // minimum-duration floor applies on top of the turn's.
        let mut rec_opts = opts.clone();
        rec_opts.vad_stop = self.mode == PttMode::Hybrid;
        rec_opts.min_duration_s = rec_opts.min_duration_s.max(self.min_duration_s);

        loop {
            self.wait_for_key(cancel, wait_deadline).await?;

            let recording = self.run_recording(&rec_opts, vad, cancel).await?;

            // Correctness requires queue overflow to be rare and observed.
            let dropped_events = self.handler.dropped_events();
            if dropped_events > 0 {
                warn!(dropped_events, "key events lost to queue overflow");
            }

            match recording.stop_cause {
                StopCause::Cancelled => {
                    self.apply(PttEvent::CleanupDone);
                    return Ok(recording);
                }
                StopCause::DeviceError => {
                    self.force_state(PttState::Idle);
                    return Ok(recording);
                }
                StopCause::Silence => {
                    self.apply(PttEvent::SilenceDetected);
                }
                StopCause::MaxDuration => {
                    self.apply(PttEvent::Timeout);
                }
                StopCause::ExternalStop => {}
            }

            if recording.early_release && matches!(self.mode, PttMode::Hold | PttMode::Hybrid) {
                info!(
                    duration_s = recording.duration_s(),
                    "sub-minimum tap discarded, waiting for next press"
                );
                self.force_state(PttState::WaitingForKey);
                continue;
            }

            self.apply(PttEvent::ProcessingStarted);
            return Ok(recording);
        }
    }

    /// Phase 1: consume key events until the combo press arrives.
    async fn wait_for_key(&mut self, cancel: &CancelFlag, deadline: Instant) -> Result<()> {
        loop {
            cancel.check("ptt wait")?;
            if Instant::now() >= deadline {
                return Err(VoiceError::Timeout {
                    phase: "waiting for ptt key",
                    seconds: 0.0,
                });
            }
            let rx = self
                .key_rx
                .as_mut()
                .ok_or_else(|| VoiceError::InvalidState("ptt controller not enabled".into()))?;
            match tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Some(KeyEvent::ComboDown)) => {
                    if self.apply(PttEvent::KeyDown) {
                        return Ok(());
                    }
                }
                Ok(Some(KeyEvent::ComboUp)) => {
                    self.apply(PttEvent::KeyUp);
                }
                Ok(Some(KeyEvent::CancelDown)) => {
                    self.apply(PttEvent::Cancel);
                }
                Ok(None) => {
                    return Err(VoiceError::InvalidState(
                        "keyboard listener channel closed".into(),
                    ))
                }
                Err(_) => {} // tick; re-check cancel and deadline
            }
        }
    }

    /// Phases 2–3: arm the recorder (with retries) and drive it to
    /// completion.
    async fn run_recording(
        &mut self,
        opts: &RecorderOptions,
        vad: &VoiceActivityDetector,
        cancel: &CancelFlag,
    ) -> Result<Recording> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let rec_cancel = CancelFlag::new();

        // Arm with exponential backoff; a failed open resolves the join
        // handle quickly with an error.
        let mut handle = None;
        let mut last_err = None;
        for attempt in 0..START_RETRIES {
            let (ready_tx, ready_rx) = oneshot::channel();
            let task = tokio::spawn(record(
                opts.clone(),
                vad.clone(),
                rec_cancel.clone(),
                Some(stop_rx.clone()),
                Some(ready_tx),
            ));
            match ready_rx.await {
                Ok(()) => {
                    handle = Some(task);
                    break;
                }
                Err(_) => {
                    let err = match task.await {
                        Ok(Err(e)) => e,
                        Ok(Ok(_)) => VoiceError::device("recorder exited before arming"),
                        Err(e) => VoiceError::device(format!("recorder panicked: {e}")),
                    };
                    warn!(attempt, error = %err, "recording start failed");
                    last_err = Some(err);
                    tokio::time::sleep(Duration::from_millis(START_BACKOFF_MS << attempt)).await;
                }
            }
        }

        let Some(mut handle) = handle else {
            self.force_state(PttState::Idle);
            return Err(last_err.unwrap_or_else(|| VoiceError::device("recording start failed")));
        };

        self.apply(PttEvent::RecordingStarted);
        let deadline = Instant::now() + Duration::from_secs_f64(self.timeout_s.max(1.0));

        let result = loop {
            let rx = self
                .key_rx
                .as_mut()
                .ok_or_else(|| VoiceError::InvalidState("ptt controller not enabled".into()))?;

            tokio::select! {
                res = &mut handle => break res,
                event = rx.recv() => match event {
                    Some(KeyEvent::ComboUp) => {
                        // Stops hold/hybrid; invalid (dropped) in toggle.
                        if self.apply(PttEvent::KeyUp) {
                            let _ = stop_tx.send(true);
                        }
                    }
                    Some(KeyEvent::ComboDown) => {
                        // Stops toggle; invalid (dropped) in hold/hybrid.
                        if self.apply(PttEvent::KeyDown) {
                            let _ = stop_tx.send(true);
                        }
                    }
                    Some(KeyEvent::CancelDown) => {
                        if self.apply(PttEvent::Cancel) {
                            rec_cancel.cancel();
                        }
                    }
                    None => {
                        warn!("keyboard listener channel closed mid-recording");
                        rec_cancel.cancel();
                    }
                },
                _ = tokio::time::sleep(Duration::from_millis(50)) => {
                    if cancel.is_cancelled() && !rec_cancel.is_cancelled() {
                        if self.apply(PttEvent::Cancel) {
                            rec_cancel.cancel();
                        }
                    } else if Instant::now() >= deadline && !*stop_rx.borrow() {
                        if self.apply(PttEvent::Timeout) {
                            let _ = stop_tx.send(true);
                        }
                    }
                }
            }
        };

        let recording = result
            .map_err(|e| VoiceError::device(format!("recorder panicked: {e}")))??;
        Ok(recording)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(mode: PttMode) -> PttController {
        let mut config = test_config();
        config.ptt_mode = mode;
        PttController::new(&config)
    }

    fn test_config() -> Config {
        // Env-independent baseline for controller construction.
        Config::from_env()
    }

    #[test]
    fn starts_idle() {
        let c = controller(PttMode::Hold);
        assert_eq!(c.current_state(), PttState::Idle);
    }

    #[test]
    fn apply_walks_the_table() {
        let c = controller(PttMode::Hold);
        assert!(c.apply(PttEvent::Enable));
        assert_eq!(c.current_state(), PttState::WaitingForKey);
        assert!(c.apply(PttEvent::KeyDown));
        assert!(c.apply(PttEvent::RecordingStarted));
        assert_eq!(c.current_state(), PttState::Recording);
        assert!(c.apply(PttEvent::KeyUp));
        assert!(c.apply(PttEvent::ProcessingStarted));
        assert!(c.apply(PttEvent::TurnDone));
        assert_eq!(c.current_state(), PttState::Idle);
    }

    #[test]
    fn invalid_events_are_dropped_without_state_change() {
        let c = controller(PttMode::Hold);
        assert!(!c.apply(PttEvent::KeyUp));
        assert_eq!(c.current_state(), PttState::Idle);
        assert!(!c.apply(PttEvent::SilenceDetected));
        assert_eq!(c.current_state(), PttState::Idle);
    }

    #[test]
    fn toggle_ignores_release_during_recording() {
        let c = controller(PttMode::Toggle);
        c.apply(PttEvent::Enable);
        c.apply(PttEvent::KeyDown);
        c.apply(PttEvent::RecordingStarted);
        assert!(!c.apply(PttEvent::KeyUp));
        assert_eq!(c.current_state(), PttState::Recording);
        // The next press stops it.
        assert!(c.apply(PttEvent::KeyDown));
        assert_eq!(c.current_state(), PttState::RecordingStopped);
    }

    #[test]
    fn cancel_path_returns_to_idle() {
        let c = controller(PttMode::Toggle);
        c.apply(PttEvent::Enable);
        c.apply(PttEvent::KeyDown);
        c.apply(PttEvent::RecordingStarted);
        assert!(c.apply(PttEvent::Cancel));
        assert_eq!(c.current_state(), PttState::RecordingCancelled);
        assert!(c.apply(PttEvent::CleanupDone));
        assert_eq!(c.current_state(), PttState::Idle);
    }

    #[test]
    fn disable_is_idempotent() {
        let mut c = controller(PttMode::Hold);
        // Never enabled: both calls are no-ops.
        c.disable();
        c.disable();
        assert_eq!(c.current_state(), PttState::Idle);
    }
}

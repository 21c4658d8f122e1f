//! Turn orchestration: speak → listen → transcribe → return text.
//!
//! One [`TurnRequest`] drives one full conversation turn. The process-wide
//! audio-operation lock guarantees at most one turn holds the microphone and
//! speaker at a time; a second concurrent turn fails fast as busy. Errors
//! from the subsystems fold into the result's outcome, so `run_turn` itself
//! never fails.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cancel::CancelFlag;
use crate::config::Config;
use crate::error::{Result, VoiceError};
use crate::hotkey::KeyboardHandler;
use crate::providers::{ProviderKind, ProviderRegistry, SelectionRequest};
use crate::ptt::PttController;
use crate::recorder::{record, Recording, RecorderOptions, StopCause};
use crate::stt::SttClient;
use crate::tts::playback::AudioPlayer;
use crate::tts::stream::{TtsRequest, TtsStreamPlayer};
use crate::tts::{AudioFormat, PlaybackOutcome, StreamMetrics};
use crate::vad::VoiceActivityDetector;

/// Where capture runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Local,
    /// Capture is delegated to an external LiveKit session that owns the
    /// audio device; PTT is never applied.
    Livekit,
    Auto,
}

impl Default for Transport {
    fn default() -> Self {
        Self::Auto
    }
}

/// One conversation turn. Immutable for the turn's duration.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub message: String,
    pub wait_for_response: bool,
    pub listen_duration_max_s: f64,
    pub listen_duration_min_s: f64,
    pub vad_aggressiveness: u8,
    pub ptt_enabled: bool,
    pub transport: Transport,
    pub audio_format: AudioFormat,
    pub voice: String,
    pub tts_provider_hint: Option<String>,
    pub stt_provider_hint: Option<String>,
}

impl TurnRequest {
    /// Defaults drawn from the runtime configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            message: String::new(),
            wait_for_response: true,
            listen_duration_max_s: config.max_recording_duration_s,
            listen_duration_min_s: config.min_recording_duration_s,
            vad_aggressiveness: config.vad_aggressiveness,
            ptt_enabled: config.ptt_enabled,
            transport: Transport::Auto,
            audio_format: config.tts_audio_format,
            voice: config.tts_voice.clone(),
            tts_provider_hint: None,
            stt_provider_hint: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_duration_min_s > self.listen_duration_max_s {
            return Err(VoiceError::InvalidState(format!(
                "listen_duration_min_s {} exceeds listen_duration_max_s {}",
                self.listen_duration_min_s, self.listen_duration_max_s
            )));
        }
        if self.vad_aggressiveness > 3 {
            return Err(VoiceError::InvalidState(format!(
                "vad_aggressiveness {} out of range 0..=3",
                self.vad_aggressiveness
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    Ok,
    /// Nothing was classified as speech; a normal outcome, not an error.
    NoSpeech,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Timings {
    pub tts_s: f64,
    pub listen_s: f64,
    pub stt_s: f64,
    pub total_s: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SelectedProviders {
    pub tts: Option<String>,
    pub stt: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnResult {
    pub turn_id: String,
    pub transcribed_text: Option<String>,
    pub timings: Timings,
    pub tts_metrics: Option<StreamMetrics>,
    pub stt_latency_s: Option<f64>,
    pub selected_providers: SelectedProviders,
    pub outcome: TurnOutcome,
    /// Human-readable failure or cancellation reason.
    pub reason: Option<String>,
}

/// Capture delegated to an external session (LiveKit transport). The
/// external side owns the device and applies its own VAD.
pub trait ExternalCapture: Send + Sync {
    fn capture(
        &self,
        max_duration_s: f64,
        min_duration_s: f64,
        cancel: CancelFlag,
    ) -> Pin<Box<dyn Future<Output = Result<Recording>> + Send + '_>>;

    fn name(&self) -> String;
}

pub struct Orchestrator {
    config: Arc<Config>,
    registry: Arc<ProviderRegistry>,
    http: reqwest::Client,
    /// Process-wide audio operation lock: microphone + speaker, exclusive.
    audio_lock: tokio::sync::Mutex<()>,
    /// Long-lived PTT controller; the global key listener thread is created
    /// once and reused across turns.
    ptt: tokio::sync::Mutex<Option<PttController>>,
    external_capture: Option<Box<dyn ExternalCapture>>,
}

impl Orchestrator {
    pub fn new(config: Arc<Config>, registry: Arc<ProviderRegistry>, http: reqwest::Client) -> Self {
        Self {
            config,
            registry,
            http,
            audio_lock: tokio::sync::Mutex::new(()),
            ptt: tokio::sync::Mutex::new(None),
            external_capture: None,
        }
    }

    pub fn with_external_capture(mut self, capture: Box<dyn ExternalCapture>) -> Self {
        self.external_capture = Some(capture);
        self
    }

    /// Run one conversation turn.
    pub async fn run_turn(&self, req: TurnRequest, cancel: CancelFlag) -> TurnResult {
        let mut ctx = TurnCtx::new();
        info!(turn_id = %ctx.turn_id, message_len = req.message.len(), "turn started");

        if let Err(e) = req.validate() {
            return ctx.failed(e.kind(), &e.to_string());
        }

        // Step 1: exclusive audio ownership, or fail fast.
        let Ok(_audio_guard) = self.audio_lock.try_lock() else {
            let e = VoiceError::Busy;
            return ctx.failed(e.kind(), &e.to_string());
        };

        // Step 2: speak.
        if !req.message.trim().is_empty() {
            match self.speak_phase(&req, &cancel, &mut ctx).await {
                Ok(SpeakPhase::Done) => {}
                Ok(SpeakPhase::Cancelled) => return ctx.cancelled("playback interrupted"),
                Err(e) => {
                    let msg = e.to_string();
                    return match e {
                        VoiceError::Cancelled { .. } => ctx.cancelled(&msg),
                        other => ctx.failed(other.kind(), &msg),
                    };
                }
            }
        }

        // Step 3: a speak-only turn ends here.
        if !req.wait_for_response {
            return ctx.ok(None);
        }

        // Step 4: fixed pause so the tail of playback does not bleed into
        // the recording.
        if self.pause(self.config.post_tts_pause_s, &cancel).await.is_err() {
            return ctx.cancelled("cancelled during pause");
        }

        // Step 5: capture.
        let listen_start = Instant::now();
        let captured = self.listen_phase(&req, &cancel).await;
        ctx.timings.listen_s = listen_start.elapsed().as_secs_f64();

        let recording = match captured {
            Ok(r) => r,
            Err(e) => {
                let msg = e.to_string();
                return match e {
                    VoiceError::Cancelled { .. } => ctx.cancelled(&msg),
                    VoiceError::Timeout { .. } => ctx.no_speech(),
                    other => ctx.failed(other.kind(), &msg),
                };
            }
        };

        match recording.stop_cause {
            StopCause::Cancelled => return ctx.cancelled("recording cancelled"),
            StopCause::DeviceError => {
                return ctx.failed("device_error", "audio input failed during recording")
            }
            _ => {}
        }

        // Step 6: no speech is a normal short-circuit, not an error.
        if !recording.speech_detected || recording.pcm.is_empty() {
            self.release_ptt().await;
            return ctx.no_speech();
        }

        // Step 7: transcribe with failover.
        let stt_start = Instant::now();
        let stt_client = SttClient::new(&self.http, &self.config);
        let selection = SelectionRequest {
            hint: req.stt_provider_hint.as_deref(),
            voice: None,
            model: Some(&self.config.stt_model),
        };
        let sample_rate = recording.sample_rate;
        let transcription = self
            .registry
            .with_failover(ProviderKind::Stt, selection, |ep| {
                let pcm = &recording.pcm;
                let stt_client = &stt_client;
                let cancel = cancel.clone();
                async move {
                    stt_client
                        .transcribe(&ep.id, &ep.base_url, pcm, sample_rate, &cancel)
                        .await
                }
            })
            .await;
        ctx.timings.stt_s = stt_start.elapsed().as_secs_f64();

        // Release the PTT turn regardless of how transcription went.
        self.release_ptt().await;

        match transcription {
            Ok(t) => {
                ctx.selected_providers.stt = Some(t.provider_id.clone());
                ctx.stt_latency_s = Some(t.latency_s);
                ctx.ok(Some(t.text))
            }
            Err(VoiceError::Cancelled { reason }) => ctx.cancelled(&reason),
            Err(e) => {
                let msg = e.to_string();
                ctx.failed(e.kind(), &msg)
            }
        }
    }

    /// TTS with failover. A mid-stream partial failure after audible
    /// playback is a success from failover's point of view: the listener
    /// heard a prefix, so re-speaking from scratch would duplicate audio.
    async fn speak_phase(
        &self,
        req: &TurnRequest,
        cancel: &CancelFlag,
        ctx: &mut TurnCtx,
    ) -> Result<SpeakPhase> {
        let tts_start = Instant::now();
        let player = AudioPlayer::new(self.config.output_device.as_deref())?;
        player.set_volume(self.config.volume);
        let streamer = TtsStreamPlayer::new(&self.http, &self.config);

        let selection = SelectionRequest {
            hint: req.tts_provider_hint.as_deref(),
            voice: Some(&req.voice),
            model: Some(&self.config.tts_model),
        };

        let report = self
            .registry
            .with_failover(ProviderKind::Tts, selection, |ep| {
                let player = &player;
                let streamer = &streamer;
                let cancel = cancel.clone();
                let tts_req = TtsRequest {
                    provider_id: ep.id.clone(),
                    base_url: ep.base_url.clone(),
                    voice: req.voice.clone(),
                    model: self.config.tts_model.clone(),
                    text: req.message.clone(),
                    format: req.audio_format,
                    speed: self.config.tts_speed,
                };
                async move { streamer.speak(&tts_req, player, &cancel).await }
            })
            .await?;

        ctx.timings.tts_s = tts_start.elapsed().as_secs_f64();
        ctx.selected_providers.tts = Some(report.metrics.provider_id.clone());
        let cancelled = report.outcome == PlaybackOutcome::Cancelled;
        if let PlaybackOutcome::PartialFailure(reason) = &report.outcome {
            warn!(reason = %reason, "tts ended in partial failure, proceeding to listen");
        }
        ctx.tts_metrics = Some(report.metrics);
        Ok(if cancelled {
            SpeakPhase::Cancelled
        } else {
            SpeakPhase::Done
        })
    }

    /// Capture one utterance: LiveKit delegation, PTT when enabled and
    /// permitted, VAD otherwise.
    async fn listen_phase(&self, req: &TurnRequest, cancel: &CancelFlag) -> Result<Recording> {
        if req.transport == Transport::Livekit {
            let Some(external) = &self.external_capture else {
                return Err(VoiceError::InvalidState(
                    "livekit transport requested but no external capture is attached".into(),
                ));
            };
            info!(session = %external.name(), "capture delegated to external transport");
            return external
                .capture(
                    req.listen_duration_max_s,
                    req.listen_duration_min_s,
                    cancel.clone(),
                )
                .await;
        }

        let vad = VoiceActivityDetector::new(req.vad_aggressiveness)?;
        let opts = RecorderOptions {
            min_duration_s: req.listen_duration_min_s,
            max_duration_s: req.listen_duration_max_s,
            grace_period_s: self.config.initial_silence_grace_s,
            silence_threshold_ms: self.config.silence_threshold_ms,
            vad_stop: true,
            input_device: self.config.input_device.clone(),
        };

        if req.ptt_enabled {
            if KeyboardHandler::check_permission() {
                let mut guard = self.ptt.lock().await;
                let controller = guard.get_or_insert_with(|| PttController::new(&self.config));
                match controller.acquire(&opts, &vad, cancel).await {
                    Ok(recording) => return Ok(recording),
                    Err(VoiceError::PermissionDenied { guidance }) => {
                        warn!(%guidance, "keyboard permission missing, falling back to vad capture");
                    }
                    Err(other) => return Err(other),
                }
            } else {
                warn!(
                    guidance = KeyboardHandler::permission_guidance(),
                    "keyboard permission unavailable, falling back to vad capture"
                );
            }
        }

        record(opts, vad, cancel.clone(), None, None).await
    }

    async fn release_ptt(&self) {
        if let Some(controller) = self.ptt.lock().await.as_ref() {
            controller.turn_done();
        }
    }

    /// Cancellable fixed-length pause.
    async fn pause(&self, seconds: f64, cancel: &CancelFlag) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs_f64(seconds.max(0.0));
        while Instant::now() < deadline {
            cancel.check("pause")?;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(())
    }
}

enum SpeakPhase {
    Done,
    Cancelled,
}

/// Per-turn result accumulator.
struct TurnCtx {
    turn_id: String,
    started: Instant,
    timings: Timings,
    tts_metrics: Option<StreamMetrics>,
    stt_latency_s: Option<f64>,
    selected_providers: SelectedProviders,
}

impl TurnCtx {
    fn new() -> Self {
        Self {
            turn_id: Uuid::new_v4().to_string(),
            started: Instant::now(),
            timings: Timings::default(),
            tts_metrics: None,
            stt_latency_s: None,
            selected_providers: SelectedProviders::default(),
        }
    }

    fn finish(mut self, outcome: TurnOutcome, text: Option<String>, reason: Option<String>) -> TurnResult {
        self.timings.total_s = self.started.elapsed().as_secs_f64();
        info!(
            turn_id = %self.turn_id,
            ?outcome,
            total_s = self.timings.total_s,
            "turn finished"
        );
        TurnResult {
            turn_id: self.turn_id,
            transcribed_text: text,
            timings: self.timings,
            tts_metrics: self.tts_metrics,
            stt_latency_s: self.stt_latency_s,
            selected_providers: self.selected_providers,
            outcome,
            reason,
        }
    }

    fn ok(self, text: Option<String>) -> TurnResult {
        self.finish(TurnOutcome::Ok, text, None)
    }

    fn no_speech(self) -> TurnResult {
        self.finish(TurnOutcome::NoSpeech, None, None)
    }

    fn cancelled(self, reason: &str) -> TurnResult {
        self.finish(TurnOutcome::Cancelled, None, Some(reason.to_string()))
    }

    fn failed(self, kind: &str, reason: &str) -> TurnResult {
        self.finish(TurnOutcome::Failed, None, Some(format!("{kind}: {reason}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// External capture stub: counts invocations, optionally holds the turn
    /// open, and reports a silent take so the turn short-circuits to
    /// no-speech without touching STT.
    struct MockCapture {
        calls: Arc<AtomicU32>,
        hold_ms: u64,
    }

    impl ExternalCapture for MockCapture {
        fn capture(
            &self,
            _max_duration_s: f64,
            _min_duration_s: f64,
            _cancel: CancelFlag,
        ) -> Pin<Box<dyn Future<Output = Result<Recording>> + Send + '_>> {
            let calls = self.calls.clone();
            let hold_ms = self.hold_ms;
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(hold_ms)).await;
                Ok(Recording {
                    pcm: vec![0i16; 24_000],
                    sample_rate: 24_000,
                    speech_detected: false,
                    stop_cause: StopCause::Silence,
                    early_release: false,
                    dropped_samples: 0,
                })
            })
        }

        fn name(&self) -> String {
            "mock-livekit".into()
        }
    }

    fn orchestrator(capture: Option<Box<dyn ExternalCapture>>) -> Arc<Orchestrator> {
        let mut config = Config::from_env();
        config.post_tts_pause_s = 0.0;
        let client = reqwest::Client::new();
        let registry = Arc::new(ProviderRegistry::from_config(&config, client.clone()));
        let mut orch = Orchestrator::new(Arc::new(config), registry, client);
        if let Some(c) = capture {
            orch = orch.with_external_capture(c);
        }
        Arc::new(orch)
    }

    fn request() -> TurnRequest {
        TurnRequest::from_config(&Config::from_env())
    }

    #[test]
    fn validate_rejects_inverted_listen_bounds() {
        let mut req = request();
        req.listen_duration_min_s = 5.0;
        req.listen_duration_max_s = 2.0;
        assert!(matches!(req.validate(), Err(VoiceError::InvalidState(_))));
    }

    #[test]
    fn validate_rejects_out_of_range_aggressiveness() {
        let mut req = request();
        req.vad_aggressiveness = 4;
        assert!(matches!(req.validate(), Err(VoiceError::InvalidState(_))));
    }

    #[test]
    fn validate_accepts_config_defaults() {
        assert!(request().validate().is_ok());
    }

    #[tokio::test]
    async fn livekit_transport_delegates_capture_and_bypasses_ptt() {
        let calls = Arc::new(AtomicU32::new(0));
        let orch = orchestrator(Some(Box::new(MockCapture {
            calls: calls.clone(),
            hold_ms: 0,
        })));

        let mut req = request();
        req.transport = Transport::Livekit;
        // Must never be consulted on the livekit path: the external session
        // owns the device.
        req.ptt_enabled = true;
        req.message = String::new();

        let result = orch.run_turn(req, CancelFlag::new()).await;
        assert_eq!(result.outcome, TurnOutcome::NoSpeech);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn livekit_transport_without_attachment_fails() {
        let orch = orchestrator(None);
        let mut req = request();
        req.transport = Transport::Livekit;
        req.message = String::new();

        let result = orch.run_turn(req, CancelFlag::new()).await;
        assert_eq!(result.outcome, TurnOutcome::Failed);
        assert!(result
            .reason
            .as_deref()
            .unwrap_or_default()
            .contains("invalid_state"));
    }

    #[tokio::test]
    async fn audio_lock_rejects_concurrent_turns() {
        let calls = Arc::new(AtomicU32::new(0));
        let orch = orchestrator(Some(Box::new(MockCapture {
            calls: calls.clone(),
            hold_ms: 300,
        })));

        let mut first = request();
        first.transport = Transport::Livekit;
        first.message = String::new();

        let holder = {
            let orch = orch.clone();
            tokio::spawn(async move { orch.run_turn(first, CancelFlag::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Speak-only turn arriving while the first holds the lock.
        let mut second = request();
        second.message = String::new();
        second.wait_for_response = false;
        let blocked = orch.run_turn(second, CancelFlag::new()).await;
        assert_eq!(blocked.outcome, TurnOutcome::Failed);
        assert!(blocked
            .reason
            .as_deref()
            .unwrap_or_default()
            .contains("busy"));

        let winner = holder.await.expect("first turn panicked");
        assert_eq!(winner.outcome, TurnOutcome::NoSpeech);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

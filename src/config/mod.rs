//! Runtime configuration.
//!
//! A single immutable [`Config`] is built from `CHATTA_*` environment
//! variables at startup and passed by reference to every subsystem; nothing
//! reads the environment after that.

pub mod paths;

use std::time::Duration;

use tracing::warn;

use crate::ptt::PttMode;
use crate::tts::AudioFormat;

/// Environment variable prefix for every recognized key.
const ENV_PREFIX: &str = "CHATTA_";

#[derive(Debug, Clone)]
pub struct Config {
    // ── TTS streaming ────────────────────────────────────────────────
    /// Master switch for the streaming TTS path.
    pub streaming_enabled: bool,
    /// HTTP read chunk size hint (bytes).
    pub stream_chunk_size: usize,
    /// Minimum buffered audio before playback may start (ms).
    pub stream_buffer_ms: u64,
    /// Upper bound on buffered audio ahead of the playback cursor (seconds).
    pub stream_max_buffer_s: f64,
    /// Fraction of the estimated clip that must be buffered before an
    /// early start (0.0 disables the estimate gate entirely).
    pub early_start_threshold: f64,
    /// Default response format requested from TTS endpoints.
    pub tts_audio_format: AudioFormat,
    pub tts_voice: String,
    pub tts_model: String,
    pub tts_speed: f32,
    /// Output volume, 0.0..=1.0.
    pub volume: f32,

    // ── Listening ────────────────────────────────────────────────────
    /// VAD aggressiveness 0 (permissive) ..= 3 (restrictive).
    pub vad_aggressiveness: u8,
    /// Contiguous silence that ends an utterance (ms).
    pub silence_threshold_ms: u64,
    /// Floor on recording length (seconds).
    pub min_recording_duration_s: f64,
    /// Cap on recording length (seconds).
    pub max_recording_duration_s: f64,
    /// Window after recording start during which silence cannot end it (s).
    pub initial_silence_grace_s: f64,

    // ── Push-to-talk ─────────────────────────────────────────────────
    pub ptt_enabled: bool,
    pub ptt_mode: PttMode,
    pub ptt_key_combo: String,
    pub ptt_cancel_key: String,
    pub ptt_timeout_s: f64,
    pub ptt_min_duration_s: f64,
    /// Suppression window for repeated combo presses (ms).
    pub ptt_debounce_ms: u64,

    // ── Providers ────────────────────────────────────────────────────
    pub tts_base_urls: Vec<String>,
    pub stt_base_urls: Vec<String>,
    pub prefer_local: bool,
    pub always_try_local: bool,
    /// Consecutive transient failures before an endpoint is marked unhealthy.
    pub unhealthy_threshold: u32,
    /// How long a health probe result stays trusted (seconds).
    pub health_ttl_s: f64,
    pub stt_model: String,
    pub stt_language: Option<String>,
    pub api_key: Option<String>,

    // ── Plumbing ─────────────────────────────────────────────────────
    /// Per-HTTP-request timeout (seconds).
    pub http_timeout_s: f64,
    /// Fixed pause between TTS completion and capture start (seconds).
    pub post_tts_pause_s: f64,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

impl Config {
    /// Read the full configuration from the environment. Unparseable values
    /// log a warning and fall back to the default.
    pub fn from_env() -> Self {
        Self {
            streaming_enabled: env_bool("STREAMING_ENABLED", true),
            stream_chunk_size: env_parse("STREAM_CHUNK_SIZE", 4096),
            stream_buffer_ms: env_parse("STREAM_BUFFER_MS", 120),
            stream_max_buffer_s: env_parse("STREAM_MAX_BUFFER", 2.0),
            early_start_threshold: env_parse("EARLY_START_THRESHOLD", 0.35_f64)
                .clamp(0.0, 1.0),
            tts_audio_format: env_var("TTS_AUDIO_FORMAT")
                .and_then(|v| parse_or_warn("TTS_AUDIO_FORMAT", &v))
                .unwrap_or(AudioFormat::Pcm),
            tts_voice: env_var("TTS_VOICE").unwrap_or_else(|| "af_sky".to_string()),
            tts_model: env_var("TTS_MODEL").unwrap_or_else(|| "kokoro".to_string()),
            tts_speed: env_parse("TTS_SPEED", 1.0_f32).clamp(0.25, 4.0),
            volume: env_parse("VOLUME", 1.0_f32).clamp(0.0, 1.0),

            vad_aggressiveness: env_parse("VAD_AGGRESSIVENESS", 2_u8).min(3),
            silence_threshold_ms: env_parse("SILENCE_THRESHOLD_MS", 1000),
            min_recording_duration_s: env_parse("MIN_RECORDING_DURATION", 0.5),
            max_recording_duration_s: env_parse("MAX_RECORDING_DURATION", 120.0),
            initial_silence_grace_s: env_parse("INITIAL_SILENCE_GRACE_PERIOD", 1.5),

            ptt_enabled: env_bool("PTT_ENABLED", false),
            ptt_mode: env_var("PTT_MODE")
                .and_then(|v| parse_or_warn("PTT_MODE", &v))
                .unwrap_or(PttMode::Hold),
            ptt_key_combo: env_var("PTT_KEY_COMBO").unwrap_or_else(|| "space".to_string()),
            ptt_cancel_key: env_var("PTT_CANCEL_KEY").unwrap_or_else(|| "escape".to_string()),
            ptt_timeout_s: env_parse("PTT_TIMEOUT", 120.0),
            ptt_min_duration_s: env_parse("PTT_MIN_DURATION", 0.5),
            ptt_debounce_ms: env_parse("PTT_DEBOUNCE_MS", 50),

            tts_base_urls: env_list("TTS_BASE_URLS", &["http://localhost:8880/v1"]),
            stt_base_urls: env_list("STT_BASE_URLS", &["http://localhost:2022/v1"]),
            prefer_local: env_bool("PREFER_LOCAL", true),
            always_try_local: env_bool("ALWAYS_TRY_LOCAL", false),
            unhealthy_threshold: env_parse("UNHEALTHY_THRESHOLD", 3),
            health_ttl_s: env_parse("HEALTH_TTL", 30.0),
            stt_model: env_var("STT_MODEL").unwrap_or_else(|| "whisper-1".to_string()),
            stt_language: env_var("STT_LANGUAGE"),
            api_key: env_var("API_KEY"),

            http_timeout_s: env_parse("HTTP_TIMEOUT", 30.0),
            post_tts_pause_s: env_parse("POST_TTS_PAUSE", 0.5),
            input_device: env_var("INPUT_DEVICE"),
            output_device: env_var("OUTPUT_DEVICE"),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.http_timeout_s)
    }
}

/// Estimated speaking rate for a voice, in words per minute. Used only to
/// size the early-start gate of the stream buffer; the hard minimum-buffer
/// gate applies regardless.
pub fn wpm_for_voice(voice: &str) -> f64 {
    match voice {
        // Kokoro voices trend a little slower than the OpenAI set.
        v if v.starts_with("af_") || v.starts_with("am_") => 160.0,
        v if v.starts_with("bf_") || v.starts_with("bm_") => 155.0,
        "alloy" | "echo" | "fable" | "onyx" | "nova" | "shimmer" => 175.0,
        _ => 170.0,
    }
}

// ── env helpers ──────────────────────────────────────────────────────

fn env_var(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{key}"))
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_var(key) {
        Some(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match env_var(key) {
        Some(v) => parse_or_warn(key, &v).unwrap_or(default),
        None => default,
    }
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match env_var(key) {
        Some(v) => v
            .split(',')
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        None => default.iter().map(|s| s.to_string()).collect(),
    }
}

fn parse_or_warn<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(key = %format!("{ENV_PREFIX}{key}"), value, "unparseable config value, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        // Scrub any ambient CHATTA_ vars so defaults apply.
        for (k, _) in std::env::vars() {
            if k.starts_with(ENV_PREFIX) {
                std::env::remove_var(k);
            }
        }
        let cfg = Config::from_env();
        assert!(cfg.streaming_enabled);
        assert_eq!(cfg.stream_buffer_ms, 120);
        assert_eq!(cfg.vad_aggressiveness, 2);
        assert_eq!(cfg.silence_threshold_ms, 1000);
        assert!(cfg.min_recording_duration_s <= cfg.max_recording_duration_s);
        assert_eq!(cfg.ptt_mode, PttMode::Hold);
        assert_eq!(cfg.tts_base_urls.len(), 1);
    }

    #[test]
    fn wpm_table_covers_unknown_voices() {
        assert_eq!(wpm_for_voice("af_sky"), 160.0);
        assert_eq!(wpm_for_voice("nova"), 175.0);
        assert_eq!(wpm_for_voice("some-future-voice"), 170.0);
    }
}

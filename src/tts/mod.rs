//! Streaming text-to-speech: adaptive buffering, chunk decode, playback.

pub mod buffer;
pub mod decode;
pub mod playback;
pub mod stream;

use serde::{Deserialize, Serialize};

/// Sample rate TTS endpoints deliver PCM at.
pub const TTS_SAMPLE_RATE: u32 = 24_000;

/// Audio formats requestable from a speech endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    /// Raw little-endian i16: true byte streaming, lowest TTFA.
    Pcm,
    Mp3,
    Opus,
    Wav,
}

impl AudioFormat {
    /// Value for the endpoint's `response_format` field.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pcm => "pcm",
            Self::Mp3 => "mp3",
            Self::Opus => "opus",
            Self::Wav => "wav",
        }
    }

    pub fn is_pcm(self) -> bool {
        matches!(self, Self::Pcm)
    }
}

impl std::str::FromStr for AudioFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pcm" => Ok(Self::Pcm),
            "mp3" => Ok(Self::Mp3),
            "opus" => Ok(Self::Opus),
            "wav" => Ok(Self::Wav),
            other => Err(format!("unknown audio format: {other}")),
        }
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-stream playback metrics, built incrementally by the player and
/// read-only once playback terminates.
#[derive(Debug, Clone, Serialize)]
pub struct StreamMetrics {
    /// Seconds from stream start to the first sample handed to the output
    /// device. `None` when playback never started.
    pub ttfa_s: Option<f64>,
    /// Seconds spent reading the endpoint's body.
    pub generation_s: f64,
    /// Seconds from playback start to drain completion.
    pub playback_s: f64,
    /// HTTP body chunks received.
    pub chunks: u64,
    /// Short drains after playback start (see buffer docs).
    pub buffer_underruns: u64,
    pub provider_id: String,
}

impl StreamMetrics {
    pub fn new(provider_id: &str) -> Self {
        Self {
            ttfa_s: None,
            generation_s: 0.0,
            playback_s: 0.0,
            chunks: 0,
            buffer_underruns: 0,
            provider_id: provider_id.to_string(),
        }
    }
}

/// How a playback stream ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "reason")]
pub enum PlaybackOutcome {
    Completed,
    Cancelled,
    /// The body errored after audio had already played; whatever was
    /// buffered was flushed and no retry is attempted.
    PartialFailure(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_parsing_roundtrip() {
        for name in ["pcm", "mp3", "opus", "wav"] {
            let fmt: AudioFormat = name.parse().unwrap();
            assert_eq!(fmt.as_str(), name);
        }
        assert!("flac".parse::<AudioFormat>().is_err());
    }
}

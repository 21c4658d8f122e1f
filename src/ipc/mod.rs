//! RPC protocol types for the MCP host.
//!
//! Commands arrive as JSON lines on stdin (`{"command": "<name>", ...}`),
//! events leave as JSON lines on stdout (`{"event": "<name>", "data": ...}`).
//! `converse` carries the turn request fields; anything omitted falls back
//! to the configured defaults.

pub mod bridge;

use serde::{Deserialize, Serialize};

use crate::orchestrator::{Transport, TurnResult};
use crate::providers::ProviderStatus;
use crate::tts::AudioFormat;

// ---------------------------------------------------------------------------
// Commands: host -> runtime (stdin)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command")]
#[serde(rename_all = "snake_case")]
pub enum RpcCommand {
    /// Run one conversation turn.
    Converse {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        wait_for_response: Option<bool>,
        #[serde(default)]
        listen_duration_max_s: Option<f64>,
        #[serde(default)]
        listen_duration_min_s: Option<f64>,
        #[serde(default)]
        vad_aggressiveness: Option<u8>,
        #[serde(default)]
        ptt_enabled: Option<bool>,
        #[serde(default)]
        transport: Option<Transport>,
        #[serde(default)]
        audio_format: Option<AudioFormat>,
        #[serde(default)]
        voice: Option<String>,
        #[serde(default)]
        tts_provider: Option<String>,
        #[serde(default)]
        stt_provider: Option<String>,
    },
    /// Cancel the turn in progress, if any.
    Cancel {},
    ListProviders {},
    ListAudioDevices {},
    Ping {},
    Stop {},
}

// ---------------------------------------------------------------------------
// Events: runtime -> host (stdout)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum RpcEvent {
    Starting {},
    Ready {},
    TurnStarted {},
    TurnResult { result: TurnResult },
    Providers { providers: Vec<ProviderStatus> },
    AudioDevices {
        input: Vec<String>,
        output: Vec<String>,
    },
    Error { message: String },
    Pong {},
    Stopping {},
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converse_parses_with_partial_fields() {
        let cmd: RpcCommand = serde_json::from_str(
            r#"{"command": "converse", "message": "hi there", "ptt_enabled": true}"#,
        )
        .unwrap();
        match cmd {
            RpcCommand::Converse {
                message,
                ptt_enabled,
                transport,
                ..
            } => {
                assert_eq!(message.as_deref(), Some("hi there"));
                assert_eq!(ptt_enabled, Some(true));
                assert_eq!(transport, None);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn converse_parses_transport_and_format() {
        let cmd: RpcCommand = serde_json::from_str(
            r#"{"command": "converse", "transport": "livekit", "audio_format": "mp3"}"#,
        )
        .unwrap();
        match cmd {
            RpcCommand::Converse {
                transport,
                audio_format,
                ..
            } => {
                assert_eq!(transport, Some(Transport::Livekit));
                assert_eq!(audio_format, Some(AudioFormat::Mp3));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn events_serialize_with_tag_and_data() {
        let json = serde_json::to_string(&RpcEvent::Error {
            message: "boom".into(),
        })
        .unwrap();
        assert!(json.contains(r#""event":"error""#));
        assert!(json.contains(r#""message":"boom""#));
    }
}

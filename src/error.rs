//! Error taxonomy shared across the turn engine.
//!
//! Subsystems surface these as structured results; the orchestrator decides
//! whether a given kind means failover (transient), degradation (permission
//! denied falls back to VAD capture), or a terminal turn failure.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, VoiceError>;

#[derive(Debug, Error)]
pub enum VoiceError {
    /// No candidate endpoint for the requested capability.
    #[error("no {kind} provider available")]
    NoProvider { kind: &'static str },

    /// Network error, timeout, or 5xx from an endpoint. Retriable via failover.
    #[error("transient endpoint failure: {reason}")]
    Transient { reason: String },

    /// 4xx from an endpoint. Never retried against the same endpoint.
    #[error("endpoint rejected request ({status}): {reason}")]
    Client { status: u16, reason: String },

    /// Audio input/output failure after the single restart attempt.
    #[error("audio device failure: {reason}")]
    Device { reason: String },

    /// The global keyboard listener lacks OS permission.
    #[error("keyboard permission denied: {guidance}")]
    PermissionDenied { guidance: String },

    /// User or orchestrator cancellation.
    #[error("cancelled: {reason}")]
    Cancelled { reason: String },

    /// A per-phase deadline was exceeded.
    #[error("{phase} timed out after {seconds:.1}s")]
    Timeout { phase: &'static str, seconds: f64 },

    /// A state-machine guard was violated.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The process-wide audio operation lock is held by another turn.
    #[error("another audio operation is in progress")]
    Busy,
}

impl VoiceError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    pub fn device(reason: impl Into<String>) -> Self {
        Self::Device {
            reason: reason.into(),
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Whether failover should rotate to the next candidate endpoint.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }

    /// Whether this is a 4xx endpoint rejection (no health penalty).
    pub fn is_client(&self) -> bool {
        matches!(self, Self::Client { .. })
    }

    /// Short taxonomy label used in turn results and log records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoProvider { .. } => "no_provider",
            Self::Transient { .. } => "transient",
            Self::Client { .. } => "client_error",
            Self::Device { .. } => "device_error",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::Cancelled { .. } => "cancelled",
            Self::Timeout { .. } => "timeout",
            Self::InvalidState(_) => "invalid_state",
            Self::Busy => "busy",
        }
    }

    /// Classify a reqwest failure: timeouts and connection errors are
    /// transient; everything else on the request path is too (a response
    /// status is classified separately by the caller).
    pub fn from_http(phase: &'static str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                phase,
                seconds: 0.0,
            }
        } else {
            Self::Transient {
                reason: format!("{phase}: {err}"),
            }
        }
    }

    /// Classify an HTTP response status together with the body text.
    pub fn from_status(status: u16, body: String) -> Self {
        if (400..500).contains(&status) {
            Self::Client {
                status,
                reason: body,
            }
        } else {
            Self::Transient {
                reason: format!("HTTP {status}: {body}"),
            }
        }
    }
}

//! Push-to-talk state machine.
//!
//! The transition function is pure and mode-aware; the controller applies it
//! and performs the side effects. Any `(state, event)` pair without a row
//! here is invalid: the caller logs it and drops the event, leaving state
//! unchanged.

use serde::Serialize;

/// User-selectable gating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PttMode {
    /// Record while the combo is held; release stops.
    Hold,
    /// First press starts, next press stops; releases are ignored.
    Toggle,
    /// Hold, but end-of-utterance silence also stops while the key is held.
    Hybrid,
}

impl std::str::FromStr for PttMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hold" => Ok(Self::Hold),
            "toggle" => Ok(Self::Toggle),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(format!("unknown ptt mode: {other}")),
        }
    }
}

impl std::fmt::Display for PttMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hold => f.write_str("hold"),
            Self::Toggle => f.write_str("toggle"),
            Self::Hybrid => f.write_str("hybrid"),
        }
    }
}

/// Controller states. Backed by an `AtomicU8` so observers read consistent
/// snapshots without locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PttState {
    Idle = 0,
    WaitingForKey = 1,
    KeyPressed = 2,
    Recording = 3,
    RecordingStopped = 4,
    RecordingCancelled = 5,
    Processing = 6,
}

impl PttState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::WaitingForKey,
            2 => Self::KeyPressed,
            3 => Self::Recording,
            4 => Self::RecordingStopped,
            5 => Self::RecordingCancelled,
            6 => Self::Processing,
            _ => Self::Idle,
        }
    }
}

impl std::fmt::Display for PttState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::WaitingForKey => "waiting_for_key",
            Self::KeyPressed => "key_pressed",
            Self::Recording => "recording",
            Self::RecordingStopped => "recording_stopped",
            Self::RecordingCancelled => "recording_cancelled",
            Self::Processing => "processing",
        };
        f.write_str(s)
    }
}

/// Events driving the controller, serialized through its single queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PttEvent {
    Enable,
    KeyDown,
    KeyUp,
    /// Internal: the recorder armed successfully.
    RecordingStarted,
    /// Hybrid mode only: end-of-utterance silence while the key is held.
    SilenceDetected,
    Timeout,
    Cancel,
    /// Internal: PCM handed off for transcription.
    ProcessingStarted,
    /// Internal: a cancelled recording's audio was discarded.
    CleanupDone,
    TurnDone,
}

/// The transition table. Returns `None` for invalid pairs.
pub fn transition(state: PttState, event: PttEvent, mode: PttMode) -> Option<PttState> {
    use PttEvent as E;
    use PttState as S;

    match (state, event) {
        (S::Idle, E::Enable) => Some(S::WaitingForKey),
        (S::WaitingForKey, E::KeyDown) => Some(S::KeyPressed),
        (S::KeyPressed, E::RecordingStarted) => Some(S::Recording),
        (S::Recording, E::KeyUp) if matches!(mode, PttMode::Hold | PttMode::Hybrid) => {
            Some(S::RecordingStopped)
        }
        (S::Recording, E::KeyDown) if mode == PttMode::Toggle => Some(S::RecordingStopped),
        (S::Recording, E::SilenceDetected) if mode == PttMode::Hybrid => {
            Some(S::RecordingStopped)
        }
        (S::Recording, E::Timeout) => Some(S::RecordingStopped),
        (S::Recording, E::Cancel) => Some(S::RecordingCancelled),
        (S::RecordingStopped, E::ProcessingStarted) => Some(S::Processing),
        (S::RecordingCancelled, E::CleanupDone) => Some(S::Idle),
        (S::Processing, E::TurnDone) => Some(S::Idle),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PttEvent as E;
    use PttState as S;

    const ALL_STATES: [PttState; 7] = [
        S::Idle,
        S::WaitingForKey,
        S::KeyPressed,
        S::Recording,
        S::RecordingStopped,
        S::RecordingCancelled,
        S::Processing,
    ];
    const ALL_EVENTS: [PttEvent; 10] = [
        E::Enable,
        E::KeyDown,
        E::KeyUp,
        E::RecordingStarted,
        E::SilenceDetected,
        E::Timeout,
        E::Cancel,
        E::ProcessingStarted,
        E::CleanupDone,
        E::TurnDone,
    ];

    /// The listed rows, per mode.
    fn table(mode: PttMode) -> Vec<(PttState, PttEvent, PttState)> {
        let mut rows = vec![
            (S::Idle, E::Enable, S::WaitingForKey),
            (S::WaitingForKey, E::KeyDown, S::KeyPressed),
            (S::KeyPressed, E::RecordingStarted, S::Recording),
            (S::Recording, E::Timeout, S::RecordingStopped),
            (S::Recording, E::Cancel, S::RecordingCancelled),
            (S::RecordingStopped, E::ProcessingStarted, S::Processing),
            (S::RecordingCancelled, E::CleanupDone, S::Idle),
            (S::Processing, E::TurnDone, S::Idle),
        ];
        match mode {
            PttMode::Hold => rows.push((S::Recording, E::KeyUp, S::RecordingStopped)),
            PttMode::Toggle => rows.push((S::Recording, E::KeyDown, S::RecordingStopped)),
            PttMode::Hybrid => {
                rows.push((S::Recording, E::KeyUp, S::RecordingStopped));
                rows.push((S::Recording, E::SilenceDetected, S::RecordingStopped));
            }
        }
        rows
    }

    #[test]
    fn every_listed_row_transitions() {
        for mode in [PttMode::Hold, PttMode::Toggle, PttMode::Hybrid] {
            for (from, event, to) in table(mode) {
                assert_eq!(
                    transition(from, event, mode),
                    Some(to),
                    "{from} + {event:?} in {mode}"
                );
            }
        }
    }

    #[test]
    fn every_unlisted_pair_is_invalid() {
        for mode in [PttMode::Hold, PttMode::Toggle, PttMode::Hybrid] {
            let rows = table(mode);
            for from in ALL_STATES {
                for event in ALL_EVENTS {
                    let listed = rows.iter().any(|&(f, e, _)| f == from && e == event);
                    if !listed {
                        assert_eq!(
                            transition(from, event, mode),
                            None,
                            "{from} + {event:?} in {mode} should be invalid"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn toggle_ignores_key_up() {
        assert_eq!(transition(S::Recording, E::KeyUp, PttMode::Toggle), None);
    }

    #[test]
    fn silence_only_stops_hybrid() {
        assert_eq!(transition(S::Recording, E::SilenceDetected, PttMode::Hold), None);
        assert_eq!(transition(S::Recording, E::SilenceDetected, PttMode::Toggle), None);
        assert_eq!(
            transition(S::Recording, E::SilenceDetected, PttMode::Hybrid),
            Some(S::RecordingStopped)
        );
    }

    #[test]
    fn state_u8_roundtrip() {
        for s in ALL_STATES {
            assert_eq!(PttState::from_u8(s as u8), s);
        }
    }
}

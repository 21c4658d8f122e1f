//! Per-frame voice activity detection.
//!
//! Energy-based classifier: mean absolute amplitude against a threshold
//! selected by the aggressiveness level (0 = most permissive, 3 = most
//! restrictive). Capture runs at 24 kHz; frames are resampled to the
//! detector's 16 kHz before classification. The detector keeps no state
//! across calls; the recorder owns all temporal logic.

use crate::audio::capture::resample_linear_into;
use crate::error::{Result, VoiceError};

/// Sample rate the detector classifies at.
pub const VAD_SAMPLE_RATE: u32 = 16_000;

/// Normalized mean-absolute-amplitude thresholds indexed by aggressiveness.
/// Higher aggressiveness demands more energy before a frame counts as speech.
const THRESHOLDS: [f32; 4] = [0.0050, 0.0090, 0.0150, 0.0280];

#[derive(Debug, Clone)]
pub struct VoiceActivityDetector {
    aggressiveness: u8,
    threshold: f32,
}

impl VoiceActivityDetector {
    /// Create a detector. Aggressiveness must be 0..=3.
    pub fn new(aggressiveness: u8) -> Result<Self> {
        if aggressiveness > 3 {
            return Err(VoiceError::InvalidState(format!(
                "vad aggressiveness {aggressiveness} out of range 0..=3"
            )));
        }
        Ok(Self {
            aggressiveness,
            threshold: THRESHOLDS[aggressiveness as usize],
        })
    }

    pub fn aggressiveness(&self) -> u8 {
        self.aggressiveness
    }

    /// Classify one 10/20/30 ms frame of 16 kHz mono i16 audio.
    pub fn is_speech(&self, frame: &[i16]) -> bool {
        energy(frame) >= self.threshold
    }
}

/// Whether `len` is a valid 10/20/30 ms frame at the detector rate.
pub fn is_valid_frame_len(len: usize) -> bool {
    let per_ms = VAD_SAMPLE_RATE as usize / 1000;
    len == per_ms * 10 || len == per_ms * 20 || len == per_ms * 30
}

/// Resample a capture-rate frame down to the detector rate.
pub fn to_vad_rate(frame: &[i16], capture_rate: u32) -> Vec<i16> {
    let mut out = Vec::new();
    resample_linear_into(frame, capture_rate, VAD_SAMPLE_RATE, &mut out);
    out
}

/// Mean absolute amplitude, normalized to 0.0..=1.0.
fn energy(frame: &[i16]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    let sum: f64 = frame.iter().map(|&s| (s as f64).abs()).sum();
    (sum / frame.len() as f64 / 32768.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(amplitude: i16, len: usize) -> Vec<i16> {
        (0..len)
            .map(|i| if i % 2 == 0 { amplitude } else { -amplitude })
            .collect()
    }

    #[test]
    fn rejects_out_of_range_aggressiveness() {
        assert!(VoiceActivityDetector::new(4).is_err());
        assert!(VoiceActivityDetector::new(3).is_ok());
    }

    #[test]
    fn silence_is_not_speech() {
        let vad = VoiceActivityDetector::new(0).unwrap();
        assert!(!vad.is_speech(&vec![0i16; 480]));
        assert!(!vad.is_speech(&[]));
    }

    #[test]
    fn loud_frame_is_speech_at_every_level() {
        let frame = tone(8000, 480);
        for level in 0..=3 {
            let vad = VoiceActivityDetector::new(level).unwrap();
            assert!(vad.is_speech(&frame), "level {level}");
        }
    }

    #[test]
    fn aggressiveness_orders_the_decision() {
        // A quiet-but-present frame passes permissive levels and fails
        // restrictive ones.
        let frame = tone(400, 480);
        assert!(VoiceActivityDetector::new(0).unwrap().is_speech(&frame));
        assert!(!VoiceActivityDetector::new(3).unwrap().is_speech(&frame));
    }

    #[test]
    fn frame_len_validation() {
        assert!(is_valid_frame_len(160));
        assert!(is_valid_frame_len(320));
        assert!(is_valid_frame_len(480));
        assert!(!is_valid_frame_len(100));
    }

    #[test]
    fn downsample_to_detector_rate() {
        // A 30 ms frame at 24 kHz becomes a 30 ms frame at 16 kHz.
        let frame = vec![100i16; 720];
        let out = to_vad_rate(&frame, 24_000);
        assert_eq!(out.len(), 480);
    }
}

//! Cooperative cancellation flag.
//!
//! Long-running operations poll this at natural checkpoints: HTTP chunk
//! boundaries in the TTS player, per-frame in the recorder and PTT
//! controller, and at queue waits. Cancellation never aborts a task
//! mid-operation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Result, VoiceError};

#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Safe to call from any thread, repeatedly.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Checkpoint helper: error out if cancellation was requested.
    pub fn check(&self, reason: &str) -> Result<()> {
        if self.is_cancelled() {
            Err(VoiceError::cancelled(reason))
        } else {
            Ok(())
        }
    }
}

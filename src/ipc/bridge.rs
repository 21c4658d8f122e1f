//! RPC bridge: stdin reader and stdout event emitter.
//!
//! A blocking stdin reader thread forwards deserialized commands through an
//! mpsc channel to the async main loop; events go out as JSON lines on
//! stdout, flushed per line so the host never waits on a partial write.

use std::io::{self, BufRead, Write};

use tokio::sync::mpsc;
use tracing::{debug, error};

use super::{RpcCommand, RpcEvent};

/// Emit an event as a JSON line on stdout and flush.
pub fn emit_event(event: &RpcEvent) {
    let json = match serde_json::to_string(event) {
        Ok(j) => j,
        Err(e) => {
            error!("failed to serialize event: {e}");
            return;
        }
    };
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    // Ignore write/flush errors — the pipe may be closed during shutdown.
    let _ = writeln!(handle, "{json}");
    let _ = handle.flush();
}

/// Convenience helper for error events.
pub fn emit_error(message: &str) {
    emit_event(&RpcEvent::Error {
        message: message.to_string(),
    });
}

/// Spawn a blocking thread that reads JSON lines from stdin, deserializes
/// them into [`RpcCommand`], and forwards them through the returned channel.
///
/// The thread exits when stdin closes (host process gone) or on an
/// unrecoverable read error.
pub fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<RpcCommand> {
    let (tx, rx) = mpsc::unbounded_channel();

    std::thread::spawn(move || {
        let stdin = io::stdin();
        let reader = stdin.lock();
        for line in reader.lines() {
            match line {
                Ok(text) => {
                    let trimmed = text.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<RpcCommand>(trimmed) {
                        Ok(cmd) => {
                            debug!(?cmd, "command received");
                            if tx.send(cmd).is_err() {
                                break; // receiver dropped — main loop is gone
                            }
                        }
                        Err(e) => {
                            error!("invalid command: {e} — input: {trimmed}");
                            emit_error(&format!("invalid command: {e}"));
                        }
                    }
                }
                Err(e) => {
                    error!("stdin read error: {e}");
                    break;
                }
            }
        }
        debug!("stdin reader thread exiting");
    });

    rx
}

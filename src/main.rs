//! chatta-voice: voice conversation runtime.
//!
//! Mediates between a microphone-speaking user and an LLM host over JSON-line
//! RPC on stdin/stdout. This entry point initializes logging and the shared
//! capabilities (config, HTTP client, provider registry, orchestrator) and
//! runs the command loop.

mod audio;
mod cancel;
mod config;
mod error;
mod hotkey;
mod ipc;
mod orchestrator;
mod providers;
mod ptt;
mod recorder;
mod stt;
mod tts;
mod vad;

use std::sync::{Arc, Mutex};

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use cancel::CancelFlag;
use config::paths::get_data_dir;
use config::Config;
use ipc::bridge::{emit_event, spawn_stdin_reader};
use ipc::{RpcCommand, RpcEvent};
use orchestrator::{Orchestrator, Transport, TurnRequest};
use providers::ProviderRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing (respects RUST_LOG, defaults to info).
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // Log to a file in the data directory; fall back to stderr if the
    // directory can't be created. stdout stays reserved for RPC events.
    let data_dir = get_data_dir();
    let use_file = std::fs::create_dir_all(&data_dir).is_ok();

    // The non-blocking guard must outlive the program.
    let _guard: Option<tracing_appender::non_blocking::WorkerGuard>;

    if use_file {
        let file_appender = tracing_appender::rolling::never(&data_dir, "chatta-voice.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        _guard = Some(guard);
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(non_blocking)
            .with_ansi(false)
            .init();
    } else {
        _guard = None;
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    }

    emit_event(&RpcEvent::Starting {});

    let config = Arc::new(Config::from_env());
    info!(
        streaming = config.streaming_enabled,
        chunk_size = config.stream_chunk_size,
        buffer_ms = config.stream_buffer_ms,
        format = %config.tts_audio_format,
        ptt = config.ptt_enabled,
        tts_endpoints = config.tts_base_urls.len(),
        stt_endpoints = config.stt_base_urls.len(),
        "configuration loaded"
    );

    let http = reqwest::Client::builder()
        .timeout(config.http_timeout())
        .build()?;

    let registry = Arc::new(ProviderRegistry::from_config(&config, http.clone()));
    let orchestrator = Arc::new(Orchestrator::new(config.clone(), registry.clone(), http));

    let mut cmd_rx = spawn_stdin_reader();

    // The cancel flag of the turn in progress, if any.
    let active_turn: Arc<Mutex<Option<CancelFlag>>> = Arc::new(Mutex::new(None));

    emit_event(&RpcEvent::Ready {});
    info!("voice runtime ready");

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            RpcCommand::Converse {
                message,
                wait_for_response,
                listen_duration_max_s,
                listen_duration_min_s,
                vad_aggressiveness,
                ptt_enabled,
                transport,
                audio_format,
                voice,
                tts_provider,
                stt_provider,
            } => {
                let mut req = TurnRequest::from_config(&config);
                if let Some(v) = message {
                    req.message = v;
                }
                if let Some(v) = wait_for_response {
                    req.wait_for_response = v;
                }
                if let Some(v) = listen_duration_max_s {
                    req.listen_duration_max_s = v;
                }
                if let Some(v) = listen_duration_min_s {
                    req.listen_duration_min_s = v;
                }
                if let Some(v) = vad_aggressiveness {
                    req.vad_aggressiveness = v;
                }
                if let Some(v) = ptt_enabled {
                    req.ptt_enabled = v;
                }
                if let Some(v) = transport {
                    req.transport = v;
                }
                if let Some(v) = audio_format {
                    req.audio_format = v;
                }
                if let Some(v) = voice {
                    req.voice = v;
                }
                req.tts_provider_hint = tts_provider;
                req.stt_provider_hint = stt_provider;
                // LiveKit owns the audio device in that mode; PTT never
                // applies there.
                if req.transport == Transport::Livekit {
                    req.ptt_enabled = false;
                }

                let cancel = CancelFlag::new();
                {
                    let mut active = active_turn.lock().unwrap_or_else(|e| e.into_inner());
                    *active = Some(cancel.clone());
                }

                // Run the turn off the command loop so cancel/ping stay
                // responsive; a second converse while one runs fails fast
                // as busy via the audio lock.
                let orchestrator = orchestrator.clone();
                let active = active_turn.clone();
                tokio::spawn(async move {
                    emit_event(&RpcEvent::TurnStarted {});
                    let result = orchestrator.run_turn(req, cancel).await;
                    emit_event(&RpcEvent::TurnResult { result });
                    let mut slot = active.lock().unwrap_or_else(|e| e.into_inner());
                    *slot = None;
                });
            }

            RpcCommand::Cancel {} => {
                let active = active_turn.lock().unwrap_or_else(|e| e.into_inner());
                match active.as_ref() {
                    Some(flag) => {
                        info!("cancelling turn in progress");
                        flag.cancel();
                    }
                    None => warn!("cancel received with no turn in progress"),
                }
            }

            RpcCommand::ListProviders {} => {
                emit_event(&RpcEvent::Providers {
                    providers: registry.snapshot(),
                });
            }

            RpcCommand::ListAudioDevices {} => {
                emit_event(&RpcEvent::AudioDevices {
                    input: audio::list_input_devices(),
                    output: audio::list_output_devices(),
                });
            }

            RpcCommand::Ping {} => {
                emit_event(&RpcEvent::Pong {});
            }

            RpcCommand::Stop {} => {
                emit_event(&RpcEvent::Stopping {});
                break;
            }
        }
    }

    info!("voice runtime shutting down");
    Ok(())
}

//! Streaming TTS player.
//!
//! Issues the chunked speech request, routes body chunks through the
//! adaptive buffer (decoding first when the format needs it), starts rodio
//! playback once the buffer opens its gate, and yields metrics.
//!
//! Failure semantics: an error before any audio has been emitted is returned
//! as `Err` with no side effects so the caller can fail over; an error after
//! playback started flushes what is buffered, stops cleanly, and reports a
//! partial failure. The listener already heard a prefix, so no retry.

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tracing::{debug, info, warn};

use super::buffer::AdaptiveStreamBuffer;
use super::decode::{decode_stream, DECODE_MIN_BYTES};
use super::playback::{AudioPlayer, BufferSource};
use super::{AudioFormat, PlaybackOutcome, StreamMetrics, TTS_SAMPLE_RATE};
use crate::cancel::CancelFlag;
use crate::config::{wpm_for_voice, Config};
use crate::error::{Result, VoiceError};

/// One speech request against a selected endpoint.
#[derive(Debug, Clone)]
pub struct TtsRequest {
    pub provider_id: String,
    pub base_url: String,
    pub voice: String,
    pub model: String,
    pub text: String,
    pub format: AudioFormat,
    pub speed: f32,
}

/// How a stream ended, plus its metrics.
#[derive(Debug)]
pub struct StreamReport {
    pub outcome: PlaybackOutcome,
    pub metrics: StreamMetrics,
}

pub struct TtsStreamPlayer<'a> {
    client: &'a reqwest::Client,
    config: &'a Config,
}

impl<'a> TtsStreamPlayer<'a> {
    pub fn new(client: &'a reqwest::Client, config: &'a Config) -> Self {
        Self { client, config }
    }

    /// Stream `req.text` to the output device.
    pub async fn speak(
        &self,
        req: &TtsRequest,
        player: &AudioPlayer,
        cancel: &CancelFlag,
    ) -> Result<StreamReport> {
        let started = Instant::now();
        let mut metrics = StreamMetrics::new(&req.provider_id);

        let mut buffer = AdaptiveStreamBuffer::new(
            TTS_SAMPLE_RATE,
            self.config.stream_buffer_ms,
            self.config.early_start_threshold,
            self.config.stream_max_buffer_s,
        );
        buffer.set_estimate_from_text(&req.text, wpm_for_voice(&req.voice));
        let buffer = Arc::new(Mutex::new(buffer));

        let body = serde_json::json!({
            "model": req.model,
            "input": req.text,
            "voice": req.voice,
            "response_format": req.format.as_str(),
            "stream": self.config.streaming_enabled,
            "speed": req.speed,
        });

        debug!(
            provider = %req.provider_id,
            voice = %req.voice,
            format = %req.format,
            text_len = req.text.len(),
            "tts request"
        );

        let mut http = self
            .client
            .post(format!("{}/audio/speech", req.base_url))
            .json(&body);
        if let Some(key) = &self.config.api_key {
            http = http.bearer_auth(key);
        }

        let resp = http
            .send()
            .await
            .map_err(|e| VoiceError::from_http("tts request", e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(VoiceError::from_status(status.as_u16(), text));
        }

        // Playback state shared with the rodio source.
        let first_sample_at: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
        let sink = player.sink_handle();
        let mut playback_started_at: Option<Instant> = None;

        // Decoder plumbing, created lazily for non-PCM formats.
        let mut decode_tx: Option<std_mpsc::Sender<Vec<u8>>> = None;
        let mut decode_task: Option<tokio::task::JoinHandle<Result<()>>> = None;
        let mut warmup: Vec<u8> = Vec::new();
        let mut carry: Option<u8> = None;

        let mut body_error: Option<VoiceError> = None;
        let mut stream = resp.bytes_stream();

        loop {
            // Cancellation checkpoint at every chunk boundary. Returning
            // drops the body stream, which releases the connection.
            if cancel.is_cancelled() {
                drop(stream);
                self.abort_playback(&buffer, player, decode_tx.take(), decode_task.take())
                    .await;
                metrics.generation_s = started.elapsed().as_secs_f64();
                metrics.buffer_underruns = lock(&buffer).underruns();
                info!(provider = %req.provider_id, "tts stream cancelled");
                return Ok(StreamReport {
                    outcome: PlaybackOutcome::Cancelled,
                    metrics,
                });
            }

            let chunk = match stream.next().await {
                None => break,
                Some(Ok(c)) => c,
                Some(Err(e)) => {
                    body_error = Some(VoiceError::from_http("tts body", e));
                    break;
                }
            };
            metrics.chunks += 1;

            if req.format.is_pcm() {
                let samples = bytes_to_samples(&chunk, &mut carry);
                self.push_with_backpressure(&buffer, &samples, cancel).await?;
            } else if let Some(tx) = &decode_tx {
                if tx.send(chunk.to_vec()).is_err() {
                    // Decoder bailed; surface its error below.
                    body_error = Some(self.join_decoder(decode_task.take()).await);
                    break;
                }
            } else {
                warmup.extend_from_slice(&chunk);
                if warmup.len() >= DECODE_MIN_BYTES {
                    let (tx, task) = self.spawn_decoder(req.format, &buffer, cancel);
                    let _ = tx.send(std::mem::take(&mut warmup));
                    decode_tx = Some(tx);
                    decode_task = Some(task);
                }
            }

            if playback_started_at.is_none() && lock(&buffer).should_start_playback() {
                let lead = lock(&buffer).buffered_ms();
                debug!(buffered_ms = lead, "starting playback");
                sink.append(BufferSource::new(
                    buffer.clone(),
                    TTS_SAMPLE_RATE,
                    first_sample_at.clone(),
                ));
                playback_started_at = Some(Instant::now());
            }
        }

        // Short non-PCM clips may finish below the warm-up size.
        if body_error.is_none() && !req.format.is_pcm() && decode_tx.is_none() && !warmup.is_empty()
        {
            let (tx, task) = self.spawn_decoder(req.format, &buffer, cancel);
            let _ = tx.send(std::mem::take(&mut warmup));
            decode_tx = Some(tx);
            decode_task = Some(task);
        }

        // Close the byte channel and wait for the decoder to finish so every
        // decoded sample is in the buffer before we mark it complete.
        drop(decode_tx.take());
        if let Some(task) = decode_task.take() {
            if let Err(e) = task
                .await
                .unwrap_or_else(|e| Err(VoiceError::transient(format!("decoder panicked: {e}"))))
            {
                if body_error.is_none() {
                    body_error = Some(e);
                }
            }
        }

        metrics.generation_s = started.elapsed().as_secs_f64();

        if let Some(err) = body_error {
            if playback_started_at.is_none() {
                // Nothing audible happened; no side effects, caller may
                // fail over to another provider.
                lock(&buffer).clear();
                return Err(err);
            }
            // Audio already played: flush the buffered remainder and stop.
            warn!(provider = %req.provider_id, error = %err, "tts body failed mid-stream, flushing");
            lock(&buffer).mark_complete();
            let outcome = self
                .drain_playback(&buffer, player, cancel, &mut metrics, playback_started_at)
                .await;
            self.finish_metrics(&mut metrics, &buffer, &first_sample_at, started);
            return Ok(StreamReport {
                outcome: match outcome {
                    PlaybackOutcome::Cancelled => PlaybackOutcome::Cancelled,
                    _ => PlaybackOutcome::PartialFailure(err.to_string()),
                },
                metrics,
            });
        }

        lock(&buffer).mark_complete();

        // A clip shorter than the gate starts at completion.
        if playback_started_at.is_none() && lock(&buffer).should_start_playback() {
            sink.append(BufferSource::new(
                buffer.clone(),
                TTS_SAMPLE_RATE,
                first_sample_at.clone(),
            ));
            playback_started_at = Some(Instant::now());
        }

        let outcome = self
            .drain_playback(&buffer, player, cancel, &mut metrics, playback_started_at)
            .await;
        self.finish_metrics(&mut metrics, &buffer, &first_sample_at, started);

        info!(
            provider = %req.provider_id,
            ttfa_s = ?metrics.ttfa_s,
            chunks = metrics.chunks,
            underruns = metrics.buffer_underruns,
            "tts stream finished"
        );

        Ok(StreamReport { outcome, metrics })
    }

    fn spawn_decoder(
        &self,
        format: AudioFormat,
        buffer: &Arc<Mutex<AdaptiveStreamBuffer>>,
        cancel: &CancelFlag,
    ) -> (std_mpsc::Sender<Vec<u8>>, tokio::task::JoinHandle<Result<()>>) {
        let (tx, rx) = std_mpsc::channel();
        let buffer = buffer.clone();
        let cancel = cancel.clone();
        let task = tokio::task::spawn_blocking(move || {
            decode_stream(format, rx, buffer, cancel, TTS_SAMPLE_RATE)
        });
        (tx, task)
    }

    async fn join_decoder(&self, task: Option<tokio::task::JoinHandle<Result<()>>>) -> VoiceError {
        match task {
            Some(t) => match t.await {
                Ok(Ok(())) => VoiceError::transient("decoder closed its input early"),
                Ok(Err(e)) => e,
                Err(e) => VoiceError::transient(format!("decoder panicked: {e}")),
            },
            None => VoiceError::transient("decoder unavailable"),
        }
    }

    /// Wait for everything buffered to reach the device (or cancellation).
    async fn drain_playback(
        &self,
        buffer: &Arc<Mutex<AdaptiveStreamBuffer>>,
        player: &AudioPlayer,
        cancel: &CancelFlag,
        metrics: &mut StreamMetrics,
        playback_started_at: Option<Instant>,
    ) -> PlaybackOutcome {
        let Some(playback_start) = playback_started_at else {
            return PlaybackOutcome::Completed;
        };
        loop {
            if cancel.is_cancelled() {
                lock(buffer).clear();
                player.stop();
                metrics.playback_s = playback_start.elapsed().as_secs_f64();
                return PlaybackOutcome::Cancelled;
            }
            if lock(buffer).is_exhausted() && player.is_idle() {
                metrics.playback_s = playback_start.elapsed().as_secs_f64();
                return PlaybackOutcome::Completed;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Cancellation cleanup: discard buffered audio, halt output, stop the
    /// decoder promptly.
    async fn abort_playback(
        &self,
        buffer: &Arc<Mutex<AdaptiveStreamBuffer>>,
        player: &AudioPlayer,
        decode_tx: Option<std_mpsc::Sender<Vec<u8>>>,
        decode_task: Option<tokio::task::JoinHandle<Result<()>>>,
    ) {
        drop(decode_tx);
        lock(buffer).clear();
        player.stop();
        if let Some(task) = decode_task {
            // The decoder observes the shared cancel flag; just reap it.
            let _ = task.await;
        }
    }

    async fn push_with_backpressure(
        &self,
        buffer: &Arc<Mutex<AdaptiveStreamBuffer>>,
        samples: &[i16],
        cancel: &CancelFlag,
    ) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        loop {
            cancel.check("tts stream")?;
            {
                let mut b = lock(buffer);
                if !b.at_capacity() {
                    b.push(samples);
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn finish_metrics(
        &self,
        metrics: &mut StreamMetrics,
        buffer: &Arc<Mutex<AdaptiveStreamBuffer>>,
        first_sample_at: &Arc<Mutex<Option<Instant>>>,
        started: Instant,
    ) {
        metrics.buffer_underruns = lock(buffer).underruns();
        let first = first_sample_at.lock().unwrap_or_else(|e| e.into_inner());
        metrics.ttfa_s = first.map(|t| t.duration_since(started).as_secs_f64());
    }
}

fn lock(buffer: &Arc<Mutex<AdaptiveStreamBuffer>>) -> std::sync::MutexGuard<'_, AdaptiveStreamBuffer> {
    buffer.lock().unwrap_or_else(|e| e.into_inner())
}

/// Convert little-endian PCM bytes to i16 samples, carrying a dangling byte
/// across chunk boundaries.
fn bytes_to_samples(bytes: &[u8], carry: &mut Option<u8>) -> Vec<i16> {
    let mut data: Vec<u8>;
    let slice = if let Some(lo) = carry.take() {
        data = Vec::with_capacity(1 + bytes.len());
        data.push(lo);
        data.extend_from_slice(bytes);
        &data[..]
    } else {
        bytes
    };

    let mut samples = Vec::with_capacity(slice.len() / 2);
    for pair in slice.chunks_exact(2) {
        samples.push(i16::from_le_bytes([pair[0], pair[1]]));
    }

    if slice.len() % 2 == 1 {
        *carry = Some(slice[slice.len() - 1]);
    }

    samples
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_to_samples_basic() {
        let mut carry = None;
        let samples = bytes_to_samples(&[0x01, 0x00, 0xFF, 0x7F], &mut carry);
        assert_eq!(samples, vec![1, 32767]);
        assert_eq!(carry, None);
    }

    #[test]
    fn bytes_to_samples_dangling_byte() {
        let mut carry = None;
        let samples = bytes_to_samples(&[0x01, 0x00, 0xFF], &mut carry);
        assert_eq!(samples, vec![1]);
        assert_eq!(carry, Some(0xFF));

        // The carried byte pairs with the head of the next chunk.
        let samples = bytes_to_samples(&[0x7F, 0x01, 0x00], &mut carry);
        assert_eq!(samples, vec![32767, 1]);
        assert_eq!(carry, None);
    }

    #[test]
    fn bytes_to_samples_empty() {
        let mut carry = None;
        assert!(bytes_to_samples(&[], &mut carry).is_empty());
        assert_eq!(carry, None);
    }
}

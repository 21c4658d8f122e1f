//! Audio playback via rodio.
//!
//! [`AudioPlayer`] owns the output device and sink; [`BufferSource`] is a
//! rodio `Source` that drains the shared stream buffer on demand, yielding
//! silence while the producer is momentarily behind so the device stream
//! stays alive.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait};
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use tracing::info;

use super::buffer::AdaptiveStreamBuffer;
use crate::error::{Result, VoiceError};

/// Audio player bound to the default (or named) output device.
pub struct AudioPlayer {
    _stream: OutputStream,
    _stream_handle: OutputStreamHandle,
    sink: Arc<Sink>,
}

impl AudioPlayer {
    /// Open an output device. A named device that cannot be found falls back
    /// to the system default.
    pub fn new(device_name: Option<&str>) -> Result<Self> {
        let (stream, stream_handle) = if let Some(name) = device_name {
            let host = cpal::default_host();
            let device = host
                .output_devices()
                .map_err(|e| VoiceError::device(format!("failed to enumerate output devices: {e}")))?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false));

            match device {
                Some(dev) => {
                    let dev_name = dev.name().unwrap_or_else(|_| "unknown".into());
                    info!(device = %dev_name, "output device selected");
                    OutputStream::try_from_device(&dev).map_err(|e| {
                        VoiceError::device(format!("failed to open output device '{name}': {e}"))
                    })?
                }
                None => {
                    info!(requested = %name, "output device not found, falling back to default");
                    OutputStream::try_default()
                        .map_err(|e| VoiceError::device(format!("failed to open audio output: {e}")))?
                }
            }
        } else {
            OutputStream::try_default()
                .map_err(|e| VoiceError::device(format!("failed to open audio output: {e}")))?
        };

        let sink = Sink::try_new(&stream_handle)
            .map_err(|e| VoiceError::device(format!("failed to create audio sink: {e}")))?;

        Ok(Self {
            _stream: stream,
            _stream_handle: stream_handle,
            sink: Arc::new(sink),
        })
    }

    /// Set playback volume (0.0 = silent, 1.0 = full).
    pub fn set_volume(&self, volume: f32) {
        self.sink.set_volume(volume.clamp(0.0, 1.0));
    }

    /// Clonable handle to the sink, for appending sources and external stop.
    pub fn sink_handle(&self) -> Arc<Sink> {
        Arc::clone(&self.sink)
    }

    /// Stop playback immediately and drop anything queued.
    pub fn stop(&self) {
        self.sink.stop();
    }

    pub fn is_idle(&self) -> bool {
        self.sink.empty()
    }
}

// SAFETY: OutputStream is !Send because of a PhantomData<*mut ()> in cpal's
// platform layer. We only touch the stream from the task that owns the
// AudioPlayer; the Arc<Sink> handle is the only part shared across threads
// and Sink itself is thread-safe.
unsafe impl Send for AudioPlayer {}
unsafe impl Sync for AudioPlayer {}

/// Samples pulled per drain call (20 ms at 24 kHz). Small enough to react to
/// cancellation quickly, large enough to keep lock traffic negligible.
const DRAIN_CHUNK: usize = 480;

/// A rodio `Source` that drains the shared [`AdaptiveStreamBuffer`].
///
/// While the stream is incomplete and the buffer is empty, yields silence
/// (the buffer counts the underrun). Ends once the buffer is exhausted.
pub struct BufferSource {
    buffer: Arc<Mutex<AdaptiveStreamBuffer>>,
    chunk: Vec<i16>,
    pos: usize,
    sample_rate: u32,
    /// Set once, at the instant the first real sample is handed to rodio.
    first_sample_at: Arc<Mutex<Option<Instant>>>,
}

impl BufferSource {
    pub fn new(
        buffer: Arc<Mutex<AdaptiveStreamBuffer>>,
        sample_rate: u32,
        first_sample_at: Arc<Mutex<Option<Instant>>>,
    ) -> Self {
        Self {
            buffer,
            chunk: Vec::with_capacity(DRAIN_CHUNK),
            pos: 0,
            sample_rate,
            first_sample_at,
        }
    }

    fn refill(&mut self) -> Option<i16> {
        let mut buf = match self.buffer.lock() {
            Ok(b) => b,
            Err(_) => return None, // producer panicked; end the source
        };
        self.chunk.resize(DRAIN_CHUNK, 0);
        let got = buf.drain(&mut self.chunk);
        let exhausted = buf.is_exhausted();
        drop(buf);

        if got > 0 {
            self.chunk.truncate(got);
            self.pos = 1;
            let mut first = self.first_sample_at.lock().unwrap_or_else(|e| e.into_inner());
            first.get_or_insert_with(Instant::now);
            return Some(self.chunk[0]);
        }
        self.chunk.clear();
        self.pos = 0;
        if exhausted {
            None
        } else {
            // Producer is behind; keep the device fed.
            Some(0)
        }
    }
}

impl Iterator for BufferSource {
    type Item = i16;

    fn next(&mut self) -> Option<i16> {
        if self.pos < self.chunk.len() {
            let s = self.chunk[self.pos];
            self.pos += 1;
            return Some(s);
        }
        self.refill()
    }
}

impl Source for BufferSource {
    fn current_frame_len(&self) -> Option<usize> {
        let remaining = self.chunk.len() - self.pos;
        if remaining > 0 {
            Some(remaining)
        } else {
            Some(1)
        }
    }

    fn channels(&self) -> u16 {
        1
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(min_ms: u64) -> Arc<Mutex<AdaptiveStreamBuffer>> {
        Arc::new(Mutex::new(AdaptiveStreamBuffer::new(24_000, min_ms, 0.0, 2.0)))
    }

    #[test]
    fn drains_pushed_samples_then_ends() {
        let buffer = shared(0);
        {
            let mut b = buffer.lock().unwrap();
            b.push(&[10, 20, 30]);
            assert!(b.should_start_playback());
            b.mark_complete();
        }
        let first = Arc::new(Mutex::new(None));
        let source = BufferSource::new(buffer, 24_000, first.clone());
        let samples: Vec<i16> = source.collect();
        assert_eq!(samples, vec![10, 20, 30]);
        assert!(first.lock().unwrap().is_some());
    }

    #[test]
    fn yields_silence_while_stream_incomplete() {
        let buffer = shared(0);
        buffer.lock().unwrap().push(&[7]);
        buffer.lock().unwrap().should_start_playback();
        let first = Arc::new(Mutex::new(None));
        let mut source = BufferSource::new(buffer.clone(), 24_000, first);
        assert_eq!(source.next(), Some(7));
        // Stream not complete: silence keeps the device alive.
        assert_eq!(source.next(), Some(0));
        buffer.lock().unwrap().clear();
        assert_eq!(source.next(), None);
    }

    #[test]
    fn reports_mono_format() {
        let first = Arc::new(Mutex::new(None));
        let source = BufferSource::new(shared(0), 24_000, first);
        assert_eq!(source.channels(), 1);
        assert_eq!(source.sample_rate(), 24_000);
        assert_eq!(source.total_duration(), None);
    }
}

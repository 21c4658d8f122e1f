//! Microphone capture via cpal.
//!
//! Opens the default (or named) input device on a dedicated OS thread (the
//! cpal `Stream` is `!Send` on macOS), captures at the device's native rate,
//! and delivers 24 kHz mono i16 samples into the SPSC queue. The callback
//! reuses scratch buffers so it never allocates per invocation and never
//! blocks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use tracing::{error, info};

use super::ring_buffer::{capture_queue, CaptureConsumer, CaptureProducer};
use super::CAPTURE_SAMPLE_RATE;
use crate::error::{Result, VoiceError};

/// List available input device names.
pub fn list_input_devices() -> Vec<String> {
    let host = cpal::default_host();
    let mut names = Vec::new();
    if let Ok(devices) = host.input_devices() {
        for dev in devices {
            if let Ok(name) = dev.name() {
                names.push(name);
            }
        }
    }
    names
}

/// List available output device names.
pub fn list_output_devices() -> Vec<String> {
    let host = cpal::default_host();
    let mut names = Vec::new();
    if let Ok(devices) = host.output_devices() {
        for dev in devices {
            if let Ok(name) = dev.name() {
                names.push(name);
            }
        }
    }
    names
}

/// A live capture stream. Dropping the session stops capture.
pub struct CaptureSession {
    consumer: CaptureConsumer,
    stop: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CaptureSession {
    /// Open the input device and start capturing. Fails fast with a
    /// [`VoiceError::Device`] if the device cannot be opened, so callers can
    /// retry with backoff.
    pub fn open(device_name: Option<&str>) -> Result<Self> {
        let (producer, consumer) = capture_queue(None);
        let stop = Arc::new(AtomicBool::new(false));
        let failed = Arc::new(AtomicBool::new(false));

        // The stream must be built on the thread that owns it; hand the
        // build result back through a one-shot channel.
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();
        let device_name = device_name.map(|s| s.to_string());
        let thread_stop = stop.clone();
        let thread_failed = failed.clone();

        let thread = std::thread::Builder::new()
            .name("chatta-capture".into())
            .spawn(move || {
                capture_thread(device_name, producer, thread_stop, thread_failed, ready_tx);
            })
            .map_err(|e| VoiceError::device(format!("failed to spawn capture thread: {e}")))?;

        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => Ok(Self {
                consumer,
                stop,
                failed,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                stop.store(true, Ordering::SeqCst);
                thread.thread().unpark();
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                stop.store(true, Ordering::SeqCst);
                thread.thread().unpark();
                Err(VoiceError::device("capture thread did not start in time"))
            }
        }
    }

    /// Pop up to `buf.len()` samples without blocking.
    pub fn read(&mut self, buf: &mut [i16]) -> usize {
        self.consumer.pop_slice(buf)
    }

    /// Samples currently queued.
    pub fn available(&self) -> usize {
        self.consumer.available()
    }

    /// Drain everything still queued. Used when an external stop ends a
    /// take, so the tail captured since the last frame pop is not lost.
    pub fn drain_remaining(&mut self) -> Vec<i16> {
        self.consumer.drain_all()
    }

    /// Whether the input stream has reported an error.
    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Samples lost to queue overflow since the session opened.
    pub fn dropped_samples(&self) -> u64 {
        self.consumer.dropped_samples()
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

fn capture_thread(
    device_name: Option<String>,
    producer: CaptureProducer,
    stop: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    ready_tx: std_mpsc::Sender<Result<()>>,
) {
    let built = build_stream(device_name.as_deref(), producer, &failed);
    let stream = match built {
        Ok(s) => {
            let _ = ready_tx.send(Ok(()));
            s
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        failed.store(true, Ordering::SeqCst);
        error!("failed to start input stream: {e}");
        return;
    }

    // Park until the session is dropped; the stream stops when it drops.
    loop {
        std::thread::park();
        if stop.load(Ordering::SeqCst) {
            break;
        }
    }
}

fn build_stream(
    device_name: Option<&str>,
    producer: CaptureProducer,
    failed: &Arc<AtomicBool>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = if let Some(name) = device_name {
        host.input_devices()
            .map_err(|e| VoiceError::device(format!("failed to enumerate input devices: {e}")))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| VoiceError::device(format!("input device not found: {name}")))?
    } else {
        host.default_input_device()
            .ok_or_else(|| VoiceError::device("no default input device available"))?
    };

    let dev_name = device.name().unwrap_or_else(|_| "unknown".into());

    let supported = device
        .default_input_config()
        .map_err(|e| VoiceError::device(format!("failed to get input config: {e}")))?;

    let native_rate = supported.sample_rate().0;
    let channels = supported.channels();
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();

    info!(
        device = %dev_name,
        native_rate,
        channels,
        "input device selected (delivering {} Hz mono)",
        CAPTURE_SAMPLE_RATE,
    );

    // The producer moves into whichever callback we build; scratch buffers
    // are reused across invocations so the hot path stays allocation-free.
    let mut prod = producer;
    let err_failed = failed.clone();
    let err_fn = move |err: cpal::StreamError| {
        err_failed.store(true, Ordering::SeqCst);
        error!("audio input stream error: {err}");
    };

    let stream = match sample_format {
        SampleFormat::F32 => {
            let mut scratch = Scratch::new(channels, native_rate);
            device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        scratch.convert_f32(data);
                        prod.push_slice(&scratch.out);
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| VoiceError::device(format!("failed to build input stream: {e}")))?
        }
        SampleFormat::I16 => {
            let mut scratch = Scratch::new(channels, native_rate);
            device
                .build_input_stream(
                    &config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        scratch.convert_i16(data);
                        prod.push_slice(&scratch.out);
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| VoiceError::device(format!("failed to build input stream: {e}")))?
        }
        other => {
            return Err(VoiceError::device(format!(
                "unsupported input sample format: {other:?}"
            )))
        }
    };

    Ok(stream)
}

/// Reusable conversion buffers for the capture callback.
struct Scratch {
    channels: u16,
    native_rate: u32,
    mono: Vec<i16>,
    out: Vec<i16>,
}

impl Scratch {
    fn new(channels: u16, native_rate: u32) -> Self {
        Self {
            channels,
            native_rate,
            mono: Vec::with_capacity(4096),
            out: Vec::with_capacity(4096),
        }
    }

    fn convert_f32(&mut self, data: &[f32]) {
        self.mono.clear();
        if self.channels <= 1 {
            self.mono
                .extend(data.iter().map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16));
        } else {
            let ch = self.channels as usize;
            self.mono.extend(data.chunks_exact(ch).map(|frame| {
                let sum: f32 = frame.iter().sum();
                ((sum / ch as f32).clamp(-1.0, 1.0) * 32767.0) as i16
            }));
        }
        self.resample();
    }

    fn convert_i16(&mut self, data: &[i16]) {
        self.mono.clear();
        if self.channels <= 1 {
            self.mono.extend_from_slice(data);
        } else {
            let ch = self.channels as usize;
            self.mono.extend(data.chunks_exact(ch).map(|frame| {
                let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                (sum / ch as i32) as i16
            }));
        }
        self.resample();
    }

    fn resample(&mut self) {
        self.out.clear();
        resample_linear_into(&self.mono, self.native_rate, CAPTURE_SAMPLE_RATE, &mut self.out);
    }
}

/// Linear-interpolation resampler. Good enough for speech; the VAD path
/// applies its own 24 kHz → 16 kHz pass downstream.
pub fn resample_linear_into(input: &[i16], from_rate: u32, to_rate: u32, out: &mut Vec<i16>) {
    if input.is_empty() {
        return;
    }
    if from_rate == to_rate {
        out.extend_from_slice(input);
        return;
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = (input.len() as f64 / ratio) as usize;
    out.reserve(out_len);
    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos as usize;
        let frac = src_pos - idx as f64;
        let s0 = input[idx.min(input.len() - 1)] as f64;
        let s1 = input[(idx + 1).min(input.len() - 1)] as f64;
        out.push((s0 + frac * (s1 - s0)) as i16);
    }
}

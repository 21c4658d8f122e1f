//! Audio capture plumbing: cpal input, lock-free sample queue, WAV encode.

pub mod capture;
pub mod ring_buffer;
pub mod wav;

pub use capture::{list_input_devices, list_output_devices, CaptureSession};
pub use ring_buffer::{capture_queue, CaptureConsumer, CaptureProducer};

/// Sample rate the capture pipeline delivers, regardless of device rate.
pub const CAPTURE_SAMPLE_RATE: u32 = 24_000;

/// Frame length consumed by the recorder (30 ms at 24 kHz).
pub const FRAME_MS: u64 = 30;

/// Samples per 30 ms capture frame.
pub const FRAME_SAMPLES: usize = (CAPTURE_SAMPLE_RATE as u64 * FRAME_MS / 1000) as usize;

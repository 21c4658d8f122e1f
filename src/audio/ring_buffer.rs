//! Lock-free SPSC queue for capture samples.
//!
//! The cpal callback thread produces i16 samples; the recorder consumes them
//! from the async side. Overflow drops the newest samples and counts them:
//! correctness requires that drops are rare and observed, so the counter is
//! surfaced as a metric rather than silently swallowed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapRb,
};

/// Default capacity: ~1.5 s of 24 kHz mono audio (≈50 recorder frames).
const DEFAULT_CAPACITY: usize = 36_000;

/// Producer half — lives in the cpal audio callback thread.
pub struct CaptureProducer {
    inner: ringbuf::HeapProd<i16>,
    dropped: Arc<AtomicU64>,
}

/// Consumer half — lives with the recorder.
pub struct CaptureConsumer {
    inner: ringbuf::HeapCons<i16>,
    dropped: Arc<AtomicU64>,
}

/// Create a matched producer/consumer pair backed by a lock-free ring buffer.
pub fn capture_queue(capacity: Option<usize>) -> (CaptureProducer, CaptureConsumer) {
    let cap = capacity.unwrap_or(DEFAULT_CAPACITY);
    let dropped = Arc::new(AtomicU64::new(0));
    let rb = HeapRb::<i16>::new(cap);
    let (prod, cons) = rb.split();
    (
        CaptureProducer {
            inner: prod,
            dropped: dropped.clone(),
        },
        CaptureConsumer {
            inner: cons,
            dropped,
        },
    )
}

impl CaptureProducer {
    /// Push samples; anything that does not fit is dropped (newest-first
    /// policy: the tail of the slice is what gets lost) and counted.
    pub fn push_slice(&mut self, samples: &[i16]) -> usize {
        let written = self.inner.push_slice(samples);
        let lost = samples.len() - written;
        if lost > 0 {
            self.dropped.fetch_add(lost as u64, Ordering::Relaxed);
        }
        written
    }
}

// The ringbuf halves are used from exactly one thread each.
unsafe impl Send for CaptureProducer {}

impl CaptureConsumer {
    /// Pop up to `buf.len()` samples. Returns the number actually read.
    pub fn pop_slice(&mut self, buf: &mut [i16]) -> usize {
        self.inner.pop_slice(buf)
    }

    /// Samples currently queued.
    pub fn available(&self) -> usize {
        self.inner.occupied_len()
    }

    /// Drain everything queued into a Vec.
    pub fn drain_all(&mut self) -> Vec<i16> {
        let n = self.available();
        if n == 0 {
            return Vec::new();
        }
        let mut buf = vec![0i16; n];
        let read = self.pop_slice(&mut buf);
        buf.truncate(read);
        buf
    }

    /// Total samples dropped at the producer since creation.
    pub fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

unsafe impl Send for CaptureConsumer {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let (mut prod, mut cons) = capture_queue(Some(8));
        assert_eq!(prod.push_slice(&[1, 2, 3]), 3);
        let mut buf = [0i16; 4];
        assert_eq!(cons.pop_slice(&mut buf), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert_eq!(cons.dropped_samples(), 0);
    }

    #[test]
    fn overflow_drops_newest_and_counts() {
        let (mut prod, mut cons) = capture_queue(Some(4));
        assert_eq!(prod.push_slice(&[1, 2, 3, 4, 5, 6]), 4);
        assert_eq!(cons.dropped_samples(), 2);
        // The oldest samples survive; 5 and 6 were dropped.
        assert_eq!(cons.drain_all(), vec![1, 2, 3, 4]);
    }
}

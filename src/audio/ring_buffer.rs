//! Lock-free SPSC hand-off between the capture callback and the framer.
//!
//! The cpal callback runs on a realtime audio thread where blocking on a
//! mutex is not acceptable, so samples cross into the async side through a
//! `ringbuf` heap ring.

use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapRb,
};

/// Two seconds of 16 kHz mono audio.
pub const DEFAULT_CAPACITY: usize = 32_000;

/// Write half, owned by the capture callback.
pub struct SampleProducer {
    inner: ringbuf::HeapProd<f32>,
}

/// Read half, owned by the framing task.
pub struct SampleConsumer {
    inner: ringbuf::HeapCons<f32>,
}

/// Create a matched producer/consumer pair.
pub fn sample_ring(capacity: usize) -> (SampleProducer, SampleConsumer) {
    let rb = HeapRb::<f32>::new(capacity.max(1));
    let (prod, cons) = rb.split();
    (SampleProducer { inner: prod }, SampleConsumer { inner: cons })
}

impl SampleProducer {
    /// Push as many samples as fit. Returns the number written; the rest is
    /// dropped so the audio thread never waits.
    pub fn push_slice(&mut self, samples: &[f32]) -> usize {
        self.inner.push_slice(samples)
    }
}

// Safety: the producer is only ever touched from the single audio callback
// thread it is moved into.
unsafe impl Send for SampleProducer {}

impl SampleConsumer {
    /// Number of samples currently available for reading.
    pub fn available(&self) -> usize {
        self.inner.occupied_len()
    }

    /// Drain everything currently buffered.
    pub fn drain_all(&mut self) -> Vec<f32> {
        let n = self.available();
        if n == 0 {
            return Vec::new();
        }
        let mut buf = vec![0.0f32; n];
        let read = self.inner.pop_slice(&mut buf);
        buf.truncate(read);
        buf
    }
}

unsafe impl Send for SampleConsumer {}

//! Ordered, interruptible playback of model audio.
//!
//! Incoming frames go into an unbounded FIFO. A single blocking worker pops
//! one frame at a time, decodes it and plays it to completion before taking
//! the next, so frames are heard in arrival order and never overlap. The
//! worker exits when the queue runs dry and a later `enqueue` starts a new
//! one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait};
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, OutputStreamHandle, Sink};
use tracing::{debug, info, warn};

use super::decode::{decode_inbound, DecodedAudio};
use super::pcm::InboundAudio;
use crate::error::{VoiceError, VoiceResult};
use crate::events::{Subscribers, Subscription};

/// Poll interval while waiting for a sink to finish or be cancelled.
const SINK_POLL: Duration = Duration::from_millis(10);

/// Audio output seam.
pub trait AudioOutput: Send + Sync {
    /// Play `audio`, blocking until it finishes or `cancel` becomes true.
    fn play(&self, audio: &DecodedAudio, cancel: &AtomicBool) -> VoiceResult<()>;

    /// Silence whatever is currently playing.
    fn stop(&self);

    fn set_volume(&self, _volume: f32) {}
}

/// The queue ran dry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Drained {
    /// Sequence of the newest frame enqueued before the queue emptied, or
    /// `None` if nothing was ever enqueued.
    pub last_sequence: Option<u64>,
}

struct QueuedFrame {
    sequence: u64,
    audio: InboundAudio,
}

struct PlaybackShared {
    output: Arc<dyn AudioOutput>,
    queue: Mutex<VecDeque<QueuedFrame>>,
    /// A worker is alive. Only changed while holding `queue`.
    worker_running: AtomicBool,
    /// A frame is audibly playing.
    playing: AtomicBool,
    /// Set by `interrupt` to cut the frame in flight. Reset, under the
    /// queue lock, whenever the worker takes the next frame.
    cancel: AtomicBool,
    disposed: AtomicBool,
    /// Only advanced while holding `queue`.
    next_sequence: AtomicU64,
    drained: Subscribers<Drained>,
}

/// Playback Unit.
pub struct Playback {
    shared: Arc<PlaybackShared>,
}

impl Playback {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        Self {
            shared: Arc::new(PlaybackShared {
                output,
                queue: Mutex::new(VecDeque::new()),
                worker_running: AtomicBool::new(false),
                playing: AtomicBool::new(false),
                cancel: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                next_sequence: AtomicU64::new(0),
                drained: Subscribers::new(),
            }),
        }
    }

    /// Append a frame and start the worker if it is idle. Returns the
    /// frame's sequence number, or `None` once disposed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, audio: InboundAudio) -> Option<u64> {
        if self.shared.disposed.load(Ordering::Acquire) {
            warn!("Playback disposed, dropping audio frame");
            return None;
        }
        let (sequence, spawn) = {
            let mut queue = lock_queue(&self.shared);
            let sequence = self.shared.next_sequence.fetch_add(1, Ordering::AcqRel);
            queue.push_back(QueuedFrame { sequence, audio });
            (sequence, !self.shared.worker_running.swap(true, Ordering::AcqRel))
        };
        if spawn {
            let shared = Arc::clone(&self.shared);
            tokio::task::spawn_blocking(move || run_worker(shared));
        }
        Some(sequence)
    }

    /// Drop every queued frame and cut the one in flight.
    pub fn interrupt(&self) {
        let dropped = {
            let mut queue = lock_queue(&self.shared);
            let n = queue.len();
            queue.clear();
            self.shared.cancel.store(true, Ordering::Release);
            n
        };
        let was_playing = self.shared.playing.load(Ordering::Acquire);
        if was_playing {
            self.shared.output.stop();
        }
        debug!(dropped, was_playing, "Playback interrupted");
    }

    /// Interrupt and refuse further frames. Idempotent.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.interrupt();
        info!("Playback disposed");
    }

    pub fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::Acquire)
    }

    /// Frames waiting behind the one in flight.
    pub fn queued(&self) -> usize {
        lock_queue(&self.shared).len()
    }

    /// Whether any audio is playing or waiting.
    pub fn is_busy(&self) -> bool {
        self.shared.worker_running.load(Ordering::Acquire)
    }

    pub fn set_volume(&self, volume: f32) {
        self.shared.output.set_volume(volume);
    }

    /// Fired each time the queue runs dry after playing. A frame enqueued
    /// after the queue emptied has a sequence newer than `last_sequence`.
    pub fn on_drained<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Drained) + Send + Sync + 'static,
    {
        self.shared.drained.subscribe(callback)
    }
}

impl Drop for Playback {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn lock_queue(shared: &PlaybackShared) -> std::sync::MutexGuard<'_, VecDeque<QueuedFrame>> {
    shared
        .queue
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Blocking worker: play queued frames one at a time until the queue is
/// empty.
fn run_worker(shared: Arc<PlaybackShared>) {
    let drained = loop {
        let frame = {
            let mut queue = lock_queue(&shared);
            match queue.pop_front() {
                Some(frame) => {
                    shared.cancel.store(false, Ordering::Release);
                    frame
                }
                None => {
                    shared.worker_running.store(false, Ordering::Release);
                    let next = shared.next_sequence.load(Ordering::Acquire);
                    break Drained {
                        last_sequence: next.checked_sub(1),
                    };
                }
            }
        };

        let audio = match decode_inbound(&frame.audio) {
            Ok(audio) => audio,
            Err(e) => {
                warn!(sequence = frame.sequence, error = %e, "Skipping undecodable audio frame");
                continue;
            }
        };

        if shared.cancel.load(Ordering::Acquire) {
            continue;
        }

        shared.playing.store(true, Ordering::Release);
        debug!(sequence = frame.sequence, "Playing audio frame");
        if let Err(e) = shared.output.play(&audio, &shared.cancel) {
            warn!(sequence = frame.sequence, error = %e, "Audio frame playback failed");
        }
        shared.playing.store(false, Ordering::Release);
    };

    debug!(last_sequence = ?drained.last_sequence, "Playback queue drained");
    shared.drained.publish(&drained);
}

// ---------------------------------------------------------------------------
// rodio output
// ---------------------------------------------------------------------------

/// `OutputStream` is `!Send` on some platforms. It is held only to keep the
/// device open and dropped with the owner.
struct SendOutputStream(#[allow(dead_code)] OutputStream);

// SAFETY: the stream is never accessed after construction, only dropped.
unsafe impl Send for SendOutputStream {}
unsafe impl Sync for SendOutputStream {}

/// Speaker output through a rodio `Sink`.
pub struct RodioOutput {
    _stream: SendOutputStream,
    sink: Sink,
}

impl RodioOutput {
    /// Open the named output device (or the default) and claim it until
    /// this value is dropped.
    pub fn open(device_name: Option<&str>, volume: f32) -> VoiceResult<Self> {
        let (stream, handle) = open_output_stream(device_name)?;
        let sink = Sink::try_new(&handle)
            .map_err(|e| VoiceError::Playback(format!("failed to create audio sink: {e}")))?;
        sink.set_volume(volume.clamp(0.0, 2.0));
        Ok(Self {
            _stream: SendOutputStream(stream),
            sink,
        })
    }
}

impl AudioOutput for RodioOutput {
    fn play(&self, audio: &DecodedAudio, cancel: &AtomicBool) -> VoiceResult<()> {
        if audio.samples.is_empty() {
            return Ok(());
        }
        let source = SamplesBuffer::new(1, audio.sample_rate, audio.samples.clone());
        self.sink.append(source);

        while !self.sink.empty() {
            if cancel.load(Ordering::Acquire) {
                self.stop();
                return Ok(());
            }
            std::thread::sleep(SINK_POLL);
        }
        Ok(())
    }

    fn stop(&self) {
        // clear() also pauses; resume so the next append is audible.
        self.sink.clear();
        self.sink.play();
    }

    fn set_volume(&self, volume: f32) {
        self.sink.set_volume(volume.clamp(0.0, 2.0));
    }
}

/// Open the audio output stream for a named or default device.
fn open_output_stream(device_name: Option<&str>) -> VoiceResult<(OutputStream, OutputStreamHandle)> {
    if let Some(name) = device_name {
        let host = cpal::default_host();
        let device = host
            .output_devices()?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false));

        match device {
            Some(dev) => {
                info!(device = %name, "Using configured output device");
                return OutputStream::try_from_device(&dev).map_err(|e| {
                    VoiceError::DeviceUnavailable(format!("failed to open output device '{name}': {e}"))
                });
            }
            None => {
                warn!(device = %name, "Configured output device not found, falling back to default");
            }
        }
    }
    OutputStream::try_default()
        .map_err(|e| VoiceError::DeviceUnavailable(format!("no audio output device available: {e}")))
}

//! State shared between the controller, the stream host, and the two
//! audio-callback handlers.
//!
//! Everything a callback touches lives here behind lock-free atomics or a
//! short-hold lock: gain scalars and the loopback-liveness tick are f32/u64
//! bit patterns in atomics (Rust has no atomic float), the mic ring sits
//! under a mutex held only across one block's push or pop, and the
//! per-recording capabilities (job queue, counters, session log) hang off
//! an `RwLock<Option<..>>` swapped by `start`/`stop`.

use crate::events::EventBus;
use crate::pool::BufferPool;
use crate::ring::SampleRing;
use crate::session_log::SessionLog;
use crate::writer::{Job, Target};
use crossbeam_channel::{Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Liveness value meaning "no loopback block seen yet"
pub(crate) const NEVER: u64 = u64::MAX;

/// Log the 1st dropped block and every 100th after it
const DROP_LOG_CADENCE: u64 = 100;

pub(crate) struct EngineShared {
    recording: AtomicBool,
    mic_gain_bits: AtomicU32,
    loop_gain_bits: AtomicU32,
    /// Milliseconds since `epoch` of the last loopback callback
    last_loop_tick_ms: AtomicU64,
    epoch: Instant,
    pub(crate) ring: Mutex<SampleRing>,
    pub(crate) pool: BufferPool,
    pub(crate) active: RwLock<Option<Arc<ActiveRecording>>>,
    pub(crate) events: EventBus,
}

impl EngineShared {
    pub(crate) fn new(events: EventBus) -> Self {
        Self {
            recording: AtomicBool::new(false),
            mic_gain_bits: AtomicU32::new(1.0_f32.to_bits()),
            loop_gain_bits: AtomicU32::new(1.0_f32.to_bits()),
            last_loop_tick_ms: AtomicU64::new(NEVER),
            epoch: Instant::now(),
            ring: Mutex::new(SampleRing::default()),
            pool: BufferPool::new(),
            active: RwLock::new(None),
            events,
        }
    }

    pub(crate) fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Relaxed)
    }

    pub(crate) fn set_recording(&self, on: bool) {
        self.recording.store(on, Ordering::Relaxed);
    }

    pub(crate) fn mic_gain(&self) -> f32 {
        f32::from_bits(self.mic_gain_bits.load(Ordering::Relaxed))
    }

    pub(crate) fn set_mic_gain(&self, gain: f32) {
        self.mic_gain_bits.store(gain.to_bits(), Ordering::Relaxed);
    }

    pub(crate) fn loopback_gain(&self) -> f32 {
        f32::from_bits(self.loop_gain_bits.load(Ordering::Relaxed))
    }

    pub(crate) fn set_loopback_gain(&self, gain: f32) {
        self.loop_gain_bits.store(gain.to_bits(), Ordering::Relaxed);
    }

    /// Milliseconds since the engine was created.
    pub(crate) fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Record "loopback is alive right now".
    pub(crate) fn touch_loopback(&self) {
        self.last_loop_tick_ms
            .store(self.now_ms(), Ordering::Relaxed);
    }

    /// True if no loopback block has arrived within `threshold_ms`.
    pub(crate) fn loopback_silent(&self, threshold_ms: u64) -> bool {
        match self.last_loop_tick_ms.load(Ordering::Relaxed) {
            NEVER => true,
            t => self.now_ms().saturating_sub(t) > threshold_ms,
        }
    }

    /// Reset liveness at the start of a monitoring session.
    pub(crate) fn reset_liveness(&self) {
        self.last_loop_tick_ms.store(NEVER, Ordering::Relaxed);
    }

    /// Snapshot of the active recording, if any. Callbacks clone the Arc
    /// out and drop the read guard before doing real work.
    pub(crate) fn active_recording(&self) -> Option<Arc<ActiveRecording>> {
        self.active.read().clone()
    }
}

/// Capabilities that exist only while a recording session is live.
pub(crate) struct ActiveRecording {
    queue: Sender<Job>,
    pub(crate) log: SessionLog,
    pub(crate) dropped_blocks: AtomicU64,
    pub(crate) underruns: AtomicU64,
    pub(crate) peak_backlog_samples: AtomicU64,
}

impl ActiveRecording {
    pub(crate) fn new(queue: Sender<Job>, log: SessionLog) -> Self {
        Self {
            queue,
            log,
            dropped_blocks: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            peak_backlog_samples: AtomicU64::new(0),
        }
    }

    /// Hand a quantized block to the writer without blocking.
    ///
    /// On a full queue the job is dropped, the buffer goes straight back
    /// to the pool, and the drop is counted and logged on the 1st and
    /// every 100th occurrence. On a disconnected queue (writer already
    /// faulted) the buffer is returned silently.
    pub(crate) fn enqueue(&self, pool: &BufferPool, target: Target, bytes: Vec<u8>) {
        let len = bytes.len();
        match self.queue.try_send(Job { target, bytes, len }) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                pool.give_back(job.bytes);
                let dropped = self.dropped_blocks.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % DROP_LOG_CADENCE == 0 {
                    let msg = format!("{} block(s) dropped, disk writer falling behind", dropped);
                    tracing::warn!("{}", msg);
                    self.log.warn("queue", &msg);
                }
            }
            Err(TrySendError::Disconnected(job)) => {
                pool.give_back(job.bytes);
            }
        }
    }

    pub(crate) fn note_underrun(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_backlog(&self, samples: u64) {
        self.peak_backlog_samples.fetch_max(samples, Ordering::Relaxed);
    }
}

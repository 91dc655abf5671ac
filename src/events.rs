//! Engine event surface
//!
//! Events are pushed through a bounded channel with `try_send` so the hot
//! paths (audio callbacks, writer thread) never block on a slow consumer.
//! Level events are lossy by design; a dropped meter update is invisible
//! at 20 Hz.

use crossbeam_channel::{bounded, Receiver, Sender};
use serde::Serialize;
use std::path::PathBuf;

/// Which capture source a level event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LevelSource {
    Mic,
    System,
}

/// Status event classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatusKind {
    Info,
    Error,
    Encoding,
    Stopped,
}

/// Output artifacts of a completed session
#[derive(Debug, Clone, Serialize)]
pub struct OutputPaths {
    pub system: PathBuf,
    pub mic: PathBuf,
    pub mix: PathBuf,
    /// Present only when an MP3 was requested
    pub mp3: Option<PathBuf>,
    pub log: PathBuf,
}

/// Events emitted to subscribers; may fire from any thread
#[derive(Debug, Clone, Serialize)]
pub enum EngineEvent {
    LevelChanged {
        source: LevelSource,
        /// Root-mean-square of the post-gain window, 0.0..=1.0
        rms: f32,
        /// Peak absolute sample of the window
        peak: f32,
        /// True if any sample in the window exceeded unity
        clipped: bool,
    },
    Status {
        kind: StatusKind,
        message: String,
        output_paths: Option<OutputPaths>,
    },
    EncodingProgress {
        percent: u8,
    },
}

/// Bounded, lossy event channel shared by the whole engine
#[derive(Clone)]
pub struct EventBus {
    tx: Sender<EngineEvent>,
    rx: Receiver<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, rx) = bounded(256);
        Self { tx, rx }
    }

    /// Get a receiver for engine events.
    ///
    /// Receivers share one stream of events (each event is delivered to a
    /// single receiver, not broadcast); a host normally drains from one.
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.rx.clone()
    }

    /// Emit an event without blocking; dropped if the channel is full.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.tx.try_send(event);
    }

    pub fn status(&self, kind: StatusKind, message: impl Into<String>) {
        self.emit(EngineEvent::Status {
            kind,
            message: message.into(),
            output_paths: None,
        });
    }

    pub fn stopped(&self, message: impl Into<String>, paths: OutputPaths) {
        self.emit(EngineEvent::Status {
            kind: StatusKind::Stopped,
            message: message.into(),
            output_paths: Some(paths),
        });
    }

    pub fn encoding_progress(&self, percent: u8) {
        self.emit(EngineEvent::EncodingProgress {
            percent: percent.min(100),
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

//! loopmix - dual-source desktop audio capture and mix engine
//!
//! Captures the operating system's playback stream (loopback) and a
//! microphone at the same time, producing three synchronized WAV files
//! per session (raw system, raw mic, gain-mixed) plus an optional MP3 of
//! the mix. The loopback stream defines the canonical format and drives
//! the clock; a mutex-guarded ring keeps the independently clocked mic in
//! alignment, and a background writer thread owns all disk I/O so the
//! audio callbacks never block.
//!
//! The GUI, settings persistence, and device-picker UI are the host
//! application's problem; this crate is the engine underneath them.

pub mod device;
pub mod dsp;
pub mod encoder;
pub mod error;
pub mod events;
mod loopback;
pub mod metering;
mod mic;
pub mod pool;
pub mod recorder;
pub mod ring;
pub mod session_log;
mod shared;
mod stream;
pub mod writer;

pub use device::{list_input_devices, AudioDeviceInfo};
pub use encoder::CancelToken;
pub use error::{EngineError, EngineResult};
pub use events::{EngineEvent, LevelSource, OutputPaths, StatusKind};
pub use recorder::{MonitorOptions, RecordOptions, Recorder};

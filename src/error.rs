//! Engine error types

use thiserror::Error;

/// Errors surfaced by the capture engine's public API
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("No audio input device available")]
    NoInputDevice,

    #[error("No loopback/monitor source available")]
    NoLoopbackDevice,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open audio stream: {0}")]
    StreamOpen(String),

    #[error("Audio stream error: {0}")]
    Stream(String),

    #[error("Not monitoring")]
    NotMonitoring,

    #[error("Recording already in progress")]
    AlreadyRecording,

    #[error("No recording in progress")]
    NotRecording,

    #[error("Cannot change devices while recording")]
    RecordingInProgress,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("MP3 encoding failed: {0}")]
    Encode(String),

    #[error("Recorder has been disposed")]
    Disposed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::NoLoopbackDevice;
        assert!(err.to_string().contains("loopback"));

        let err = EngineError::DeviceNotFound("USB Mic".into());
        assert!(err.to_string().contains("USB Mic"));

        let err = EngineError::Disposed;
        assert!(err.to_string().contains("disposed"));
    }

    #[test]
    fn test_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: EngineError = io.into();
        assert!(matches!(err, EngineError::Io(_)));
    }
}

//! The single error type shared by every part of the logger.
//!
//! Errors fall into two groups. Capture-side failures (`InitializationTimeout`,
//! `ControllerExited`, `DeviceError`) abort the current run attempt and are
//! only ever acted on by the orchestrator. Offline failures (`ChunkCorrupt`,
//! `ChunkMissing`, `ParseError`) are surfaced to whoever is reading a run
//! directory and never affect capture.

use std::{path::PathBuf, sync::mpsc};

use crate::sensor::SensorKind;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, LoggerError>;

#[derive(Debug, thiserror::Error)]
pub enum LoggerError {
    /// One or more controllers did not post READY before the deadline.
    #[error("controllers not ready before timeout: {missing:?}")]
    InitializationTimeout { missing: Vec<String> },

    /// A controller process or thread went away while the leader was waiting.
    #[error("controller {controller} exited: {status}")]
    ControllerExited { controller: String, status: String },

    /// A GO or STOP arrived when it made no sense. Logged and ignored.
    #[error("rendezvous violation: {0}")]
    RendezvousViolation(String),

    /// The device driver failed; fatal for that controller.
    #[error("{sensor} device error: {reason}")]
    DeviceError { sensor: SensorKind, reason: String },

    /// A chunk file exists but its header or payload sizes are inconsistent.
    #[error("corrupt chunk {path:?}: {reason}")]
    ChunkCorrupt { path: PathBuf, reason: String },

    /// A chunk or segment file does not exist.
    #[error("chunk not found: {0:?}")]
    ChunkMissing(PathBuf),

    /// A payload could not be reshaped with the run metadata layout.
    #[error("parse error: {0}")]
    ParseError(String),

    /// The write stage fell behind the capture stage.
    #[error("write queue full for {sensor} (depth {depth})")]
    QueueBackpressure { sensor: SensorKind, depth: usize },

    /// Semantic configuration problem caught by validation.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ron error: {0}")]
    Ron(#[from] ron::Error),

    #[error("ron spanning error: {0}")]
    RonSpanned(#[from] ron::de::SpannedError),

    /// An in-process channel hung up.
    #[error("channel closed: {0}")]
    Channel(String),
}

impl<T> From<mpsc::SendError<T>> for LoggerError {
    fn from(_: mpsc::SendError<T>) -> Self {
        Self::Channel("send on closed channel".to_owned())
    }
}

impl From<mpsc::RecvError> for LoggerError {
    fn from(value: mpsc::RecvError) -> Self {
        Self::Channel(value.to_string())
    }
}

impl LoggerError {
    /// Shorthand for building a [`LoggerError::DeviceError`].
    pub fn device(sensor: SensorKind, reason: impl ToString) -> Self {
        Self::DeviceError {
            sensor,
            reason: reason.to_string(),
        }
    }

    /// Shorthand for building a [`LoggerError::ChunkCorrupt`].
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::ChunkCorrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_lists_missing_controllers() {
        let err = LoggerError::InitializationTimeout {
            missing: vec!["world".to_owned()],
        };
        assert!(err.to_string().contains("world"));
    }

    #[test]
    fn mpsc_errors_convert() {
        let (tx, rx) = mpsc::channel::<u8>();
        drop(rx);
        let err: LoggerError = tx.send(1).unwrap_err().into();
        assert!(matches!(err, LoggerError::Channel(_)));
    }
}

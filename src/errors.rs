use std::io;
use thiserror::Error;

use crate::frame::FRAME_SIZE;

/// A candidate frame that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("invalid markers: start={start:02X?}, end={end:02X?}")]
    InvalidMarkers { start: [u8; 5], end: [u8; 5] },
    #[error("frame length {0} (expected {FRAME_SIZE})")]
    Length(usize),
}

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid calibration json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{kind} calibration has no entry for channel {channel}")]
    MissingChannel { kind: &'static str, channel: String },
    #[error("{kind} fit for channel {channel} has no coefficients")]
    EmptyFit { kind: &'static str, channel: String },
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("influxdb rejected write ({status}): {body}")]
    Status { status: u16, body: String },
    #[error("runtime init failed: {0}")]
    Runtime(String),
    #[error("sink worker {0} is closed")]
    Closed(String),
}

#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("connection to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("transport read failed: {0}")]
    TransportRead(#[source] io::Error),
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("data corrupted (trash label in frame {event})")]
    DataCorrupted { event: u64 },
    #[error("calibration error: {0}")]
    Calibration(#[from] CalibrationError),
}

impl AcquisitionError {
    /// Whether the run has to be aborted. Everything else is counted and the
    /// loop carries on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AcquisitionError::Connect { .. }
                | AcquisitionError::Serial(_)
                | AcquisitionError::Calibration(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AcquisitionError>;

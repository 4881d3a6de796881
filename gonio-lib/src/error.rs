use std::io;
use thiserror::Error;

/// Transport-level failures raised by a [`crate::channel::Channel`].
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Device not found. Is the goniophotometer connected to '{0}'?")]
    DeviceNotFound(String),

    #[error("Serial port '{0}' is busy or could not be opened")]
    PortBusy(String),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Channel is not open")]
    NotOpen,

    #[error("Channel closed by the remote end")]
    Disconnected,

    #[error("Received {len} bytes that are not valid UTF-8 (first bad byte at offset {valid_up_to})")]
    InvalidEncoding { len: usize, valid_up_to: usize },
}

/// Failures of the photometric computations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PhotometryError {
    #[error(
        "Inconsistent sample count: got {actual} samples but at most {maximum} fit the configured resolution. \
         Make sure the device sends the right number of samples and uses the expected data format."
    )]
    InconsistentSampleCount { actual: usize, maximum: usize },

    #[error("Invalid angular resolution: polar {res_theta}, azimuth {res_phi}")]
    InvalidResolution { res_theta: f32, res_phi: f32 },
}

/// Errors reported by a protocol session, one variant per failing phase.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Channel unavailable: {0}")]
    ChannelUnavailable(#[source] ChannelError),

    #[error("The device did not acknowledge {command} within {timeout_ms} ms")]
    HandshakeTimeout { command: String, timeout_ms: u64 },

    #[error("Stream I/O error: {0}")]
    StreamIo(#[source] ChannelError),

    #[error("Malformed record at token {position}: {reason}")]
    MalformedRecord { position: usize, reason: String },

    #[error("Stop handshake failed: {0}. The device may have to be restarted manually")]
    StopHandshake(String),

    #[error(transparent)]
    Photometry(#[from] PhotometryError),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

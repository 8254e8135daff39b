use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::flow::FlowError;
use crate::protocol::frame::FrameError;
use crate::protocol::DecodeError;

/// Errors surfaced by the distributor client.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("unsupported address type: {0}")]
    UnsupportedAddressType(String),

    #[error("buffer capacity reached: {current} of {max} bytes")]
    BufferCapacityReached { current: usize, max: usize },

    #[error("connection broken: {reason}")]
    ConnectionBroken { reason: String },

    #[error("received line is not length-prefixed ({} bytes buffered)", buffer.len())]
    InvalidLineReceived { buffer: Vec<u8> },

    #[error("{rejected} callback(s) returned false")]
    CallbackReturnedFalse { rejected: usize },

    #[error("no data within {0:?}")]
    SocketTimeout(Duration),

    #[error("decoding event: {0}")]
    Decode(#[from] DecodeError),

    #[error("applying event: {0}")]
    Flow(#[from] FlowError),

    #[error("socket I/O: {0}")]
    Io(#[from] io::Error),

    #[error("{count} line(s) failed to parse")]
    FailedLines { count: u64 },

    #[error("filter expression of {len} bytes exceeds the command limit")]
    FilterTooLong { len: usize },
}

impl From<FrameError> for ClientError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::CapacityReached { current, max } => {
                Self::BufferCapacityReached { current, max }
            }
            FrameError::InvalidLine { buffer } => Self::InvalidLineReceived { buffer },
        }
    }
}

impl ClientError {
    pub(crate) fn broken(reason: impl Into<String>) -> Self {
        Self::ConnectionBroken {
            reason: reason.into(),
        }
    }

    /// Per-line faults affect one frame only; the stream stays usable.
    pub fn is_line_fault(&self) -> bool {
        matches!(self, Self::Decode(_) | Self::Flow(_))
    }

    /// The caller may simply retry the read.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::SocketTimeout(_))
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedAddressType(_) => "unsupported_address_type",
            Self::BufferCapacityReached { .. } => "buffer_capacity_reached",
            Self::ConnectionBroken { .. } => "connection_broken",
            Self::InvalidLineReceived { .. } => "invalid_line_received",
            Self::CallbackReturnedFalse { .. } => "callback_returned_false",
            Self::SocketTimeout(_) => "socket_timeout",
            Self::Decode(e) => e.kind(),
            Self::Flow(_) => "missing_lifecycle_field",
            Self::Io(_) => "io",
            Self::FailedLines { .. } => "failed_lines",
            Self::FilterTooLong { .. } => "filter_too_long",
        }
    }
}

/// Map a read error to the client taxonomy: resets and broken pipes mean the
/// peer is gone, anything else is passed through.
pub(crate) fn classify_io(err: io::Error) -> ClientError {
    match err.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof => ClientError::broken(err.to_string()),
        _ => ClientError::Io(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_error_conversion() {
        let err: ClientError = FrameError::CapacityReached {
            current: 10,
            max: 10,
        }
        .into();
        assert!(matches!(
            err,
            ClientError::BufferCapacityReached {
                current: 10,
                max: 10
            }
        ));

        let err: ClientError = FrameError::InvalidLine {
            buffer: b"junk!!".to_vec(),
        }
        .into();
        assert_eq!(err.kind(), "invalid_line_received");
    }

    #[test]
    fn test_classification() {
        assert!(ClientError::SocketTimeout(Duration::from_secs(1)).is_recoverable());
        assert!(!ClientError::broken("eof").is_recoverable());
        assert!(ClientError::Decode(DecodeError::NotAnObject).is_line_fault());
        assert!(ClientError::Flow(FlowError::MissingField {
            field: "thread_id",
            flow_id: None
        })
        .is_line_fault());
        assert!(!ClientError::InvalidLineReceived { buffer: Vec::new() }.is_line_fault());
    }

    #[test]
    fn test_classify_io() {
        let err = classify_io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(matches!(err, ClientError::ConnectionBroken { .. }));

        let err = classify_io(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, ClientError::Io(_)));
    }
}

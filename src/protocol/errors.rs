use std::io;

use thiserror::Error;

use super::Role;

/// Errors raised by the frame codec and the link channel.
#[derive(Debug, Error)]
pub enum LinkError {
    /// The controller could not dial the board.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// The peer closed the stream where a length prefix was expected.
    #[error("connection aborted by peer")]
    ConnectionAborted,

    /// The stream was reset underneath us.
    #[error("connection reset")]
    ConnectionReset,

    /// A handshake is already running on this channel.
    #[error("channel already busy with a handshake")]
    Busy,

    /// The operation is not part of this side's capability set.
    #[error("{role} side cannot {operation}")]
    RoleViolation {
        role: Role,
        operation: &'static str,
    },

    /// The stream ended before a declared length was satisfied.
    #[error("frame truncated: expected {expected} bytes, received {received}")]
    FrameTruncated { expected: usize, received: usize },

    /// No complete frame arrived within the read timeout.
    #[error("read timed out")]
    ReadTimeout,

    /// The peer started a frame and then went quiet past the read timeout.
    #[error("peer stalled mid-frame")]
    FrameStalled,

    /// The peer stopped reading and a send could not finish within the timeout.
    #[error("peer stopped reading; write timed out")]
    WriteStalled,

    #[error("frame name too long: {0} bytes")]
    NameTooLong(usize),

    #[error("frame payload too long: {0} bytes")]
    PayloadTooLong(usize),

    #[error("frame name is not valid utf-8: {0}")]
    InvalidName(std::str::Utf8Error),

    /// No stream is attached to the channel.
    #[error("channel is not connected")]
    NotConnected,

    /// A frame arrived that the receiving side does not understand here.
    #[error("unexpected frame '{0}'")]
    UnexpectedFrame(String),

    /// Wrapper around bincode payload (de)serialization errors.
    #[error("payload encoding error: {0}")]
    Payload(#[from] bincode::Error),

    #[error("address resolution failed: {0}")]
    Resolve(String),

    #[error("io error: {0}")]
    Io(io::Error),
}

impl LinkError {
    /// True for failures that mean the stream itself is gone.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            LinkError::ConnectionAborted
                | LinkError::ConnectionReset
                | LinkError::FrameTruncated { .. }
                | LinkError::FrameStalled
                | LinkError::WriteStalled
                | LinkError::NotConnected
        )
    }
}

impl From<io::Error> for LinkError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => LinkError::ConnectionReset,
            io::ErrorKind::ConnectionAborted => LinkError::ConnectionAborted,
            io::ErrorKind::ConnectionRefused => LinkError::ConnectionRefused(err.to_string()),
            io::ErrorKind::TimedOut => LinkError::ReadTimeout,
            _ => LinkError::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_kinds_map_onto_link_taxonomy() {
        let reset: LinkError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert!(matches!(reset, LinkError::ConnectionReset));
        let other: LinkError = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert!(matches!(other, LinkError::Io(_)));
        assert!(LinkError::ConnectionAborted.is_disconnect());
        assert!(LinkError::WriteStalled.is_disconnect());
        assert!(!LinkError::ReadTimeout.is_disconnect());
    }
}

//! # Link Protocol
//!
//! Wire vocabulary shared by the board and the controller.
//!
//! - [`frame`] - the length-prefixed frame codec
//! - [`errors`] - the [`LinkError`] taxonomy used by the codec and the channel
//! - [`Command`] - controller → board commands decoded from frames
//!
//! Board → controller traffic is limited to the handshake info map (sent once per
//! connection as [`HANDSHAKE_FRAME`]) and the activity record ([`DATA_FRAME`]).

pub mod errors;
pub mod frame;

use std::collections::BTreeMap;
use std::fmt;

pub use errors::LinkError;
pub use frame::Frame;

/// Frame name of the board's one-shot info map.
pub const HANDSHAKE_FRAME: &str = "handshake";
/// Frame name carrying the serialized activity record.
pub const DATA_FRAME: &str = "data";

/// Info map the board announces right after accepting a connection.
pub type HandshakeInfo = BTreeMap<String, String>;

/// The info map this build announces.
pub fn local_handshake_info() -> HandshakeInfo {
    let mut info = HandshakeInfo::new();
    info.insert("task".into(), "time".into());
    info.insert("protocol".into(), env!("CARGO_PKG_VERSION").into());
    info
}

/// Which end of the link a channel sits on. Fixed for the life of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Issues commands, reads sensor data, dials the board.
    Controller,
    /// Owns the tag reader, reads commands, listens for the controller.
    Board,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Controller => f.write_str("controller"),
            Role::Board => f.write_str("board"),
        }
    }
}

/// Argument of a `stop` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopTarget {
    /// Freeze the running task timer and go back to reading tags.
    Update,
    /// Stop the tag reader only.
    Read,
    /// Anything else shuts the board down.
    Other(String),
}

impl StopTarget {
    pub fn parse(value: &str) -> Self {
        match value {
            "update" => StopTarget::Update,
            "read" => StopTarget::Read,
            other => StopTarget::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            StopTarget::Update => "update",
            StopTarget::Read => "read",
            StopTarget::Other(s) => s,
        }
    }
}

/// Controller → board command vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Read,
    /// Bind the next presented tag to this task label.
    Write(String),
    /// Ask the board to send its activity record.
    Send,
    Stop(StopTarget),
    Disconnect,
    /// Set the board's wall clock (`date -s` compatible string).
    SetTime(String),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Read => "read",
            Command::Write(_) => "write",
            Command::Send => "send",
            Command::Stop(_) => "stop",
            Command::Disconnect => "disconnect",
            Command::SetTime(_) => "set_time",
        }
    }

    pub fn value(&self) -> Option<&str> {
        match self {
            Command::Write(label) => Some(label),
            Command::Stop(target) => Some(target.as_str()),
            Command::SetTime(ts) => Some(ts),
            Command::Read | Command::Send | Command::Disconnect => None,
        }
    }

    /// Interpret a `(name, value)` pair; `None` for names outside the vocabulary.
    pub fn from_parts(name: &str, value: Option<String>) -> Option<Self> {
        let cmd = match name {
            "read" => Command::Read,
            "write" => Command::Write(value?),
            "send" => Command::Send,
            "stop" => Command::Stop(StopTarget::parse(value.as_deref().unwrap_or(""))),
            "disconnect" => Command::Disconnect,
            "set_time" => Command::SetTime(value?),
            _ => return None,
        };
        Some(cmd)
    }

    pub fn to_frame(&self) -> Result<Frame, LinkError> {
        Frame::with_payload(self.name(), &self.value())
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, LinkError> {
        let value: Option<String> = frame.decode_payload()?;
        Self::from_parts(&frame.name, value).ok_or_else(|| LinkError::UnexpectedFrame(frame.name.clone()))
    }
}

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io")]
    Io(#[from] io::Error),
    /// Hole punching did not converge before the configured deadline.
    #[error("nat traversal timed out")]
    PunchTimeout,
    /// The session or acceptor was closed while an operation was pending.
    #[error("connection closed")]
    ConnectionClosed,
    /// A control record failed to decode.
    #[error("invalid control message")]
    InvalidMessage,
    /// The datagram does not start with the expected magic header.
    #[error("not one of our packets")]
    NotOurPacket,
    /// The datagram is too short or structurally invalid.
    #[error("malformed packet")]
    MalformedPacket,
    /// The ambient cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;

//! `registry_facade_handover::error` is a module containing error utilities for the handover
//! protocol.

use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a handover operation.
pub type HandoverResult<T> = Result<T, HandoverError>;

/// An error that occurred while donating or recovering a listener.
#[derive(pretty_error_debug::Debug, Error)]
pub enum HandoverError {
    /// No donor socket was found in the handover directory; the caller should fall back to
    /// binding its own listener.
    #[error("no donor socket present in handover directory")]
    NoDonor,

    /// The handshake greeting received did not match the expected `"REQ\n"` line.
    #[error("unexpected handover greeting: {0:?}")]
    UnexpectedGreeting(Vec<u8>),

    /// The donor's reply did not carry the expected `"ACK\n"` line.
    #[error("unexpected handover reply: {0:?}")]
    UnexpectedReply(Vec<u8>),

    /// The donor's reply did not carry a file descriptor as ancillary data.
    #[error("handover reply carried no file descriptor")]
    NoFileDescriptor,

    /// A handover operation did not complete within its timeout.
    #[error("handover operation timed out")]
    Timeout,

    /// An error occurred while performing an IO operation.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error occurred while performing a raw socket operation.
    #[error("socket error: {0}")]
    Nix(#[from] nix::Error),
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl From<tokio::time::error::Elapsed> for HandoverError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        HandoverError::Timeout
    }
}

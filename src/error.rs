//! Call-related error types.

use callcore::{CodecError, InvalidTransition, SignalingViolation};
use thiserror::Error;

use crate::media::MediaError;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("signaling state violation: {0}")]
    Signaling(#[from] SignalingViolation),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("media error: {0}")]
    Media(#[from] MediaError),

    #[error("peer connection error: {0}")]
    Peer(#[source] anyhow::Error),

    #[error("message channel error: {0}")]
    Channel(#[source] anyhow::Error),

    #[error("signaling channel unavailable")]
    ChannelUnavailable,

    #[error("a call is already in progress ({0})")]
    Busy(&'static str),

    #[error("no incoming call to {0}")]
    NotRinging(&'static str),

    #[error("no peer connection")]
    NoConnection,

    /// The attempt was torn down while an operation was in flight.
    #[error("call attempt closed")]
    Closed,
}

impl CallError {
    /// Errors that come from the attempt being cancelled rather than failing.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

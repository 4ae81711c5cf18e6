//! Identifiers and small value types shared by every call component.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// A user taking part in a conversation.
    ParticipantId
);

string_id!(
    /// The chat conversation hosting the call. Signaling rides on its channel.
    ConversationId
);

string_id!(
    /// One call attempt inside a conversation.
    SessionId
);

impl SessionId {
    /// Session ids are derived from the hosting conversation plus the
    /// per-coordinator attempt counter.
    pub fn for_attempt(conversation: &ConversationId, attempt: u64) -> Self {
        Self(format!("{}#{}", conversation, attempt))
    }
}

/// Which side of the offer/answer handshake we are on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallRole {
    Initiator,
    Receiver,
}

impl CallRole {
    pub fn is_initiator(&self) -> bool {
        matches!(self, Self::Initiator)
    }
}

/// Camera facing mode requested from the media stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    #[default]
    User,
    Environment,
}

impl FacingMode {
    pub fn flipped(self) -> Self {
        match self {
            Self::User => Self::Environment,
            Self::Environment => Self::User,
        }
    }

    pub fn is_front(self) -> bool {
        matches!(self, Self::User)
    }
}

/// Why a call attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// We hung up.
    LocalEnded,
    /// The peer sent END.
    RemoteEnded,
    /// We declined an incoming call.
    LocalDeclined,
    /// The peer declined our call.
    RemoteDeclined,
    /// The native connection reported `failed`.
    ConnectionFailed,
    /// `connecting` never reached `active` within the configured window.
    ConnectTimeout,
    /// Camera and microphone could not be acquired.
    MediaUnavailable,
    /// Offer/answer negotiation failed or violated the signaling state.
    NegotiationFailed,
}

impl EndReason {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed
                | Self::ConnectTimeout
                | Self::MediaUnavailable
                | Self::NegotiationFailed
        )
    }
}

/// Quality of the local media while a call is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MediaQuality {
    #[default]
    Full,
    /// Video could not be restored after a camera switch; audio continues.
    Degraded,
}

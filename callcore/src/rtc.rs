//! Session description and ICE value types, plus the signaling-state machine
//! that gates description mutations on a peer connection.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;

/// `type` field of a session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// A session description as exchanged during offer/answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.sdp_type == SdpType::Offer
    }
}

/// An ICE candidate, serialized in the browser `toJSON()` shape.
///
/// The candidate string follows RFC 5245, e.g.
/// `candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = Some(index);
        self
    }

    pub fn with_username_fragment(mut self, ufrag: impl Into<String>) -> Self {
        self.username_fragment = Some(ufrag.into());
        self
    }
}

/// Signaling state of one peer connection.
///
/// `New` is the state before local media has been attached; the native
/// primitive itself reports `stable` from construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SignalingState {
    #[default]
    New,
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

impl SignalingState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Stable => "stable",
            Self::HaveLocalOffer => "have-local-offer",
            Self::HaveRemoteOffer => "have-remote-offer",
            Self::Closed => "closed",
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// State reached after `op`, or the violation if `op` is illegal here.
    pub fn after(self, op: SignalingOp) -> Result<SignalingState, SignalingViolation> {
        let next = match (self, op) {
            (_, SignalingOp::Close) => Self::Closed,
            (Self::New, SignalingOp::MediaAttached) => Self::Stable,
            (Self::Stable, SignalingOp::SetLocalOffer) => Self::HaveLocalOffer,
            (Self::Stable | Self::HaveLocalOffer, SignalingOp::SetRemoteOffer) => {
                Self::HaveRemoteOffer
            }
            (Self::HaveRemoteOffer, SignalingOp::SetLocalAnswer) => Self::Stable,
            (Self::HaveLocalOffer, SignalingOp::SetRemoteAnswer) => Self::Stable,
            (state, op) => return Err(SignalingViolation { state, op }),
        };
        Ok(next)
    }
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations that move the signaling state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingOp {
    MediaAttached,
    SetLocalOffer,
    SetRemoteOffer,
    SetLocalAnswer,
    SetRemoteAnswer,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot {op:?} in signaling state {state}")]
pub struct SignalingViolation {
    pub state: SignalingState,
    pub op: SignalingOp,
}

/// Ordered holding area for candidates that arrive before the description
/// that makes them applicable.
#[derive(Debug, Clone, Default)]
pub struct IceCandidateBuffer {
    queue: VecDeque<IceCandidate>,
}

impl IceCandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: IceCandidate) {
        self.queue.push_back(candidate);
    }

    /// Removes every buffered candidate, oldest first.
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

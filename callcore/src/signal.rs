//! Signal message codec.
//!
//! Call signaling shares the conversation's chat channel with ordinary text,
//! so every signal is a tagged string:
//!
//! ```text
//! VIDEO_CALL_OFFER:{"type":"offer","sdp":"v=0..."}
//! VIDEO_CALL_ANSWER:{"type":"answer","sdp":"v=0..."}
//! VIDEO_CALL_ICE:{"candidate":"candidate:1 1 UDP ...","sdpMid":"0","sdpMLineIndex":0}
//! VIDEO_CALL_END
//! VIDEO_CALL_DECLINED
//! ```
//!
//! Text that carries none of these tags is not signaling and decodes to
//! `None`, leaving it to the chat layer.

use crate::rtc::{IceCandidate, SessionDescription};
use crate::types::ParticipantId;
use log::warn;
use std::fmt;
use thiserror::Error;

/// Separator between a payload-carrying tag and its JSON body.
const PAYLOAD_SEPARATOR: char = ':';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
    Ice,
    End,
    Declined,
}

impl SignalKind {
    pub const ALL: [SignalKind; 5] = [
        Self::Offer,
        Self::Answer,
        Self::Ice,
        Self::End,
        Self::Declined,
    ];

    /// Wire tag for this kind.
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Offer => "VIDEO_CALL_OFFER",
            Self::Answer => "VIDEO_CALL_ANSWER",
            Self::Ice => "VIDEO_CALL_ICE",
            Self::End => "VIDEO_CALL_END",
            Self::Declined => "VIDEO_CALL_DECLINED",
        }
    }

    /// END and DECLINED are tag-only.
    pub const fn has_payload(&self) -> bool {
        matches!(self, Self::Offer | Self::Answer | Self::Ice)
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A decoded signaling intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Ice(IceCandidate),
    End,
    Declined,
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::Offer(_) => SignalKind::Offer,
            Self::Answer(_) => SignalKind::Answer,
            Self::Ice(_) => SignalKind::Ice,
            Self::End => SignalKind::End,
            Self::Declined => SignalKind::Declined,
        }
    }
}

/// A signal together with the participant that sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalMessage {
    pub sender_id: ParticipantId,
    pub signal: Signal,
}

impl SignalMessage {
    pub fn kind(&self) -> SignalKind {
        self.signal.kind()
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("{0} is missing its payload")]
    MissingPayload(SignalKind),

    #[error("malformed {kind} payload: {source}")]
    MalformedPayload {
        kind: SignalKind,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize {kind} payload: {source}")]
    Serialize {
        kind: SignalKind,
        #[source]
        source: serde_json::Error,
    },
}

/// Encode a signal as channel text.
pub fn encode(signal: &Signal) -> Result<String, CodecError> {
    let kind = signal.kind();
    let body = match signal {
        Signal::Offer(desc) | Signal::Answer(desc) => serde_json::to_string(desc),
        Signal::Ice(candidate) => serde_json::to_string(candidate),
        Signal::End | Signal::Declined => return Ok(kind.tag().to_string()),
    }
    .map_err(|source| CodecError::Serialize { kind, source })?;

    Ok(format!("{}{}{}", kind.tag(), PAYLOAD_SEPARATOR, body))
}

/// Decode channel text, surfacing malformed payloads as errors.
///
/// `Ok(None)` means the text is not signaling at all.
pub fn try_decode(raw: &str) -> Result<Option<Signal>, CodecError> {
    for kind in SignalKind::ALL {
        let tag = kind.tag();
        if !kind.has_payload() {
            if raw == tag {
                return Ok(Some(match kind {
                    SignalKind::End => Signal::End,
                    _ => Signal::Declined,
                }));
            }
            continue;
        }

        let Some(rest) = raw.strip_prefix(tag) else {
            continue;
        };
        if rest.is_empty() {
            return Err(CodecError::MissingPayload(kind));
        }
        // A longer tag sharing this prefix is not ours.
        let Some(body) = rest.strip_prefix(PAYLOAD_SEPARATOR) else {
            continue;
        };

        let malformed = |source| CodecError::MalformedPayload { kind, source };
        let signal = match kind {
            SignalKind::Offer => Signal::Offer(serde_json::from_str(body).map_err(malformed)?),
            SignalKind::Answer => Signal::Answer(serde_json::from_str(body).map_err(malformed)?),
            _ => Signal::Ice(serde_json::from_str(body).map_err(malformed)?),
        };
        return Ok(Some(signal));
    }
    Ok(None)
}

/// Decode channel text from `sender`.
///
/// Malformed payloads are logged and dropped: they legitimately show up from
/// echoed or duplicated delivery.
pub fn decode(sender: &ParticipantId, raw: &str) -> Option<SignalMessage> {
    match try_decode(raw) {
        Ok(signal) => signal.map(|signal| SignalMessage {
            sender_id: sender.clone(),
            signal,
        }),
        Err(e) => {
            warn!("Dropping signaling message from {}: {}", sender, e);
            None
        }
    }
}

/// Whether chat text belongs to the call signaling protocol and should be
/// hidden from the message list.
pub fn is_signaling_text(raw: &str) -> bool {
    SignalKind::ALL.iter().any(|kind| {
        let tag = kind.tag();
        if kind.has_payload() {
            raw.strip_prefix(tag)
                .is_some_and(|rest| rest.is_empty() || rest.starts_with(PAYLOAD_SEPARATOR))
        } else {
            raw == tag
        }
    })
}

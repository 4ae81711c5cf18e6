//! Call state machine implementation.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::{EndReason, MediaQuality};

/// Current state of a call as seen by one participant.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub enum CallState {
    /// No call.
    #[default]
    Idle,
    /// Outgoing call: offer being produced or sent, waiting for an answer.
    OutgoingRinging { started_at: DateTime<Utc> },
    /// Incoming call: offer buffered, waiting for the local user.
    IncomingRinging { received_at: DateTime<Utc> },
    /// Descriptions exchanged, waiting for the native connection.
    Connecting { since: DateTime<Utc> },
    /// Media flowing peer to peer.
    Active {
        connected_at: DateTime<Utc>,
        media: MediaQuality,
    },
    /// Call over. Kept until the next call starts so the UI can show why.
    Ended {
        reason: EndReason,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
}

impl CallState {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::OutgoingRinging { .. } => "outgoing-ringing",
            Self::IncomingRinging { .. } => "incoming-ringing",
            Self::Connecting { .. } => "connecting",
            Self::Active { .. } => "active",
            Self::Ended { .. } => "ended",
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting { .. })
    }

    pub fn is_ringing(&self) -> bool {
        matches!(
            self,
            Self::OutgoingRinging { .. } | Self::IncomingRinging { .. }
        )
    }

    pub fn is_incoming_ringing(&self) -> bool {
        matches!(self, Self::IncomingRinging { .. })
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }

    /// Idle or ended: nothing in progress, a new call may begin.
    pub fn is_vacant(&self) -> bool {
        matches!(self, Self::Idle | Self::Ended { .. })
    }

    /// A call attempt exists and has not ended.
    pub fn is_in_call(&self) -> bool {
        !self.is_vacant()
    }

    pub fn can_accept(&self) -> bool {
        self.is_incoming_ringing()
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        match self {
            Self::Ended { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    pub fn media_quality(&self) -> Option<MediaQuality> {
        match self {
            Self::Active { media, .. } => Some(*media),
            _ => None,
        }
    }
}

/// State transitions for calls.
#[derive(Debug, Clone)]
pub enum CallTransition {
    /// Local user started a call.
    Started,
    /// An offer arrived while nothing was in progress.
    OfferReceived,
    /// Local user accepted the ringing call.
    LocalAccepted,
    /// The peer's answer was applied to our offer.
    RemoteAnswered,
    /// Both sides offered at once and we yielded, answering theirs.
    GlareYielded,
    /// The native connection reported `connected`.
    MediaConnected,
    /// Video could not be restored; audio continues.
    MediaDegraded,
    /// Video came back after a degradation.
    MediaRestored,
    Terminated { reason: EndReason },
}

/// Pure transition function: the state `transition` leads to from `current`.
pub fn next_state(
    current: &CallState,
    transition: CallTransition,
) -> Result<CallState, InvalidTransition> {
    let now = Utc::now();
    let next = match (current, transition) {
        (CallState::Idle | CallState::Ended { .. }, CallTransition::Started) => {
            CallState::OutgoingRinging { started_at: now }
        }
        (CallState::Idle | CallState::Ended { .. }, CallTransition::OfferReceived) => {
            CallState::IncomingRinging { received_at: now }
        }
        (CallState::IncomingRinging { .. }, CallTransition::LocalAccepted) => {
            CallState::Connecting { since: now }
        }
        (
            CallState::OutgoingRinging { .. },
            CallTransition::RemoteAnswered | CallTransition::GlareYielded,
        ) => CallState::Connecting { since: now },
        (CallState::Connecting { .. }, CallTransition::MediaConnected) => CallState::Active {
            connected_at: now,
            media: MediaQuality::Full,
        },
        (CallState::Active { connected_at, .. }, CallTransition::MediaDegraded) => {
            CallState::Active {
                connected_at: *connected_at,
                media: MediaQuality::Degraded,
            }
        }
        (CallState::Active { connected_at, .. }, CallTransition::MediaRestored) => {
            CallState::Active {
                connected_at: *connected_at,
                media: MediaQuality::Full,
            }
        }
        (CallState::Active { connected_at, .. }, CallTransition::Terminated { reason }) => {
            CallState::Ended {
                reason,
                ended_at: now,
                duration_secs: Some(now.signed_duration_since(*connected_at).num_seconds()),
            }
        }
        (
            CallState::OutgoingRinging { .. }
            | CallState::IncomingRinging { .. }
            | CallState::Connecting { .. },
            CallTransition::Terminated { reason },
        ) => CallState::Ended {
            reason,
            ended_at: now,
            duration_secs: None,
        },
        (current, transition) => {
            return Err(InvalidTransition {
                current_state: current.name().to_string(),
                attempted: format!("{:?}", transition),
            });
        }
    };
    Ok(next)
}

impl CallState {
    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        *self = next_state(self, transition)?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;

    /// Flow: Idle → OutgoingRinging → Connecting → Active → Ended
    #[test]
    fn test_outgoing_call_flow() {
        let mut state = CallState::Idle;

        state.apply(CallTransition::Started).unwrap();
        assert!(state.is_ringing());

        state.apply(CallTransition::RemoteAnswered).unwrap();
        assert!(state.is_connecting());

        state.apply(CallTransition::MediaConnected).unwrap();
        assert!(state.is_active());
        assert_eq!(state.media_quality(), Some(MediaQuality::Full));

        state
            .apply(CallTransition::Terminated {
                reason: EndReason::LocalEnded,
            })
            .unwrap();
        assert!(state.is_ended());

        if let CallState::Ended { duration_secs, .. } = state {
            assert!(duration_secs.is_some());
        }
    }

    /// Flow: Idle → IncomingRinging → Connecting → Active → Ended
    #[test]
    fn test_incoming_call_flow() {
        let mut state = CallState::Idle;

        state.apply(CallTransition::OfferReceived).unwrap();
        assert!(state.can_accept());

        state.apply(CallTransition::LocalAccepted).unwrap();
        state.apply(CallTransition::MediaConnected).unwrap();
        assert!(state.is_active());

        state
            .apply(CallTransition::Terminated {
                reason: EndReason::RemoteEnded,
            })
            .unwrap();
        assert_eq!(state.end_reason(), Some(EndReason::RemoteEnded));
    }

    #[test]
    fn test_decline_has_no_duration() {
        let mut state = CallState::Idle;
        state.apply(CallTransition::OfferReceived).unwrap();
        state
            .apply(CallTransition::Terminated {
                reason: EndReason::LocalDeclined,
            })
            .unwrap();

        match state {
            CallState::Ended {
                reason,
                duration_secs,
                ..
            } => {
                assert_eq!(reason, EndReason::LocalDeclined);
                assert!(duration_secs.is_none());
            }
            other => panic!("expected ended, got {:?}", other),
        }
    }

    #[test]
    fn test_degraded_media_is_still_active() {
        let mut state = CallState::Idle;
        state.apply(CallTransition::Started).unwrap();
        state.apply(CallTransition::RemoteAnswered).unwrap();
        state.apply(CallTransition::MediaConnected).unwrap();

        state.apply(CallTransition::MediaDegraded).unwrap();
        assert!(state.is_active());
        assert_eq!(state.media_quality(), Some(MediaQuality::Degraded));

        state.apply(CallTransition::MediaRestored).unwrap();
        assert_eq!(state.media_quality(), Some(MediaQuality::Full));
    }

    #[test]
    fn test_new_call_may_start_after_ended() {
        let mut state = CallState::Ended {
            reason: EndReason::RemoteDeclined,
            ended_at: Utc::now(),
            duration_secs: None,
        };
        assert!(state.is_vacant());
        state.apply(CallTransition::Started).unwrap();
        assert!(state.is_ringing());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut state = CallState::Idle;

        assert!(state.apply(CallTransition::RemoteAnswered).is_err());
        assert!(state.apply(CallTransition::MediaConnected).is_err());
        assert!(state.apply(CallTransition::LocalAccepted).is_err());
        assert!(
            state
                .apply(CallTransition::Terminated {
                    reason: EndReason::LocalEnded
                })
                .is_err()
        );
        assert!(state.is_idle());
    }

    #[test]
    fn test_ended_call_rejects_termination_and_media() {
        let mut state = CallState::Idle;
        state.apply(CallTransition::Started).unwrap();
        state
            .apply(CallTransition::Terminated {
                reason: EndReason::LocalEnded,
            })
            .unwrap();

        assert!(state.apply(CallTransition::MediaConnected).is_err());
        let err = state
            .apply(CallTransition::Terminated {
                reason: EndReason::RemoteEnded,
            })
            .unwrap_err();
        assert_eq!(err.current_state, "ended");
    }

    #[test]
    fn test_connected_only_once() {
        let mut state = CallState::Idle;
        state.apply(CallTransition::OfferReceived).unwrap();
        state.apply(CallTransition::LocalAccepted).unwrap();
        state.apply(CallTransition::MediaConnected).unwrap();
        assert!(state.apply(CallTransition::MediaConnected).is_err());
    }
}

//! Platform-independent pieces of call signaling: identifiers, the signal
//! codec, session-description types and the pure state machines.

pub mod rtc;
pub mod signal;
pub mod state;
pub mod types;

pub use rtc::{
    IceCandidate, IceCandidateBuffer, SdpType, SessionDescription, SignalingOp, SignalingState,
    SignalingViolation,
};
pub use signal::{CodecError, Signal, SignalKind, SignalMessage};
pub use state::{CallState, CallTransition, InvalidTransition};
pub use types::{
    CallRole, ConversationId, EndReason, FacingMode, MediaQuality, ParticipantId, SessionId,
};

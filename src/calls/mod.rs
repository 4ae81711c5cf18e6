//! Call signaling and negotiation.
//!
//! # Architecture
//!
//! - [`CallCoordinator`]: per-conversation call state machine; turns UI
//!   intents and inbound signals into transitions and owns the session
//! - [`CallSession`]: data for the current attempt
//! - [`PeerConnectionManager`]: one native peer connection plus local media,
//!   guarded by the signaling-state rules
//! - [`IncomingCallGate`]: accept/decline prompt for a ringing call
//!
//! # Protocol Overview
//!
//! Signals travel as tagged text on the conversation's message channel (see
//! [`callcore::signal`]). The caller sends OFFER, the callee answers with
//! ANSWER after the local user accepts, and both sides trickle ICE candidates
//! until the native connection reports `connected`. END or DECLINED closes
//! the attempt on the other side.

mod connection;
mod coordinator;
mod gate;
mod session;

pub use connection::{CandidateDisposition, PeerConnectionManager, RetryPolicy, TrackReplacement};
pub use coordinator::CallCoordinator;
pub use gate::IncomingCallGate;
pub use session::{CallSession, CallSnapshot};

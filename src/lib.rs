//! Call signaling and negotiation for one-to-one video calls inside a chat
//! conversation.
//!
//! Signals ride on the conversation's message channel as tagged text; the
//! media itself is negotiated by a native peer-connection primitive that sits
//! behind [`peer::PeerConnection`].

// Re-export the platform-independent core
pub use callcore::{rtc, signal, state, types};

pub mod calls;
pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod peer;

// In-process stand-ins for the native primitives
pub mod loopback;

pub use calls::{CallCoordinator, IncomingCallGate};
pub use config::CallConfig;
pub use error::CallError;

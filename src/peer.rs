//! Seam to the native peer-connection primitive.
//!
//! The native object performs the real negotiation and media transport. It
//! reports asynchronous happenings (gathered local ICE candidates, connection
//! state changes) as [`PeerEvent`]s on the channel given at construction.

use async_trait::async_trait;
use callcore::{IceCandidate, SessionDescription, SignalingState};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::{CallConfig, IceServer};
use crate::media::{MediaTrack, TrackKind};

/// Aggregate connection state reported by the native primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local candidate was gathered and should be sent to the peer.
    IceCandidate(IceCandidate),
    ConnectionStateChanged(PeerConnectionState),
}

#[derive(Debug, Clone, Default)]
pub struct RtcConfiguration {
    pub ice_servers: Vec<IceServer>,
}

impl From<&CallConfig> for RtcConfiguration {
    fn from(config: &CallConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
        }
    }
}

/// An outbound media sender on the connection.
#[async_trait]
pub trait RtpSender: Send + Sync {
    fn track_kind(&self) -> Option<TrackKind>;
    /// Swap the sent track in place, without renegotiation.
    async fn replace_track(&self, track: Option<Arc<dyn MediaTrack>>) -> Result<(), anyhow::Error>;
}

/// The native peer connection.
///
/// Description mutations fail when attempted in the wrong signaling state,
/// like the browser primitive does.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, anyhow::Error>;
    async fn create_answer(&self) -> Result<SessionDescription, anyhow::Error>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), anyhow::Error>;
    async fn set_remote_description(&self, desc: SessionDescription)
    -> Result<(), anyhow::Error>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), anyhow::Error>;
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), anyhow::Error>;
    async fn senders(&self) -> Vec<Arc<dyn RtpSender>>;
    fn signaling_state(&self) -> SignalingState;
    /// Stop delivering [`PeerEvent`]s.
    fn detach_handlers(&self);
    async fn close(&self);
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        config: &RtcConfiguration,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, anyhow::Error>;
}

//! Per-attempt call session data.

use callcore::{
    CallRole, CallState, ConversationId, FacingMode, IceCandidate, IceCandidateBuffer,
    ParticipantId, SessionDescription, SessionId,
};
use serde::Serialize;
use std::sync::Arc;

use super::connection::PeerConnectionManager;

/// Everything the coordinator knows about the current call attempt.
///
/// The coordinator owns exactly one of these. [`CallSession::begin`] opens an
/// attempt and [`CallSession::reset`] wipes it again, keeping only `state`
/// (so the UI can show how the call ended), the attempt counter and the
/// identity of the last remote offer.
#[derive(Default)]
pub struct CallSession {
    /// Monotonic attempt counter. Async continuations capture it and bail
    /// out when it no longer matches.
    pub attempt: u64,
    pub session_id: Option<SessionId>,
    pub state: CallState,
    pub local_role: Option<CallRole>,
    pub remote_participant: Option<ParticipantId>,
    pub remote_offer: Option<SessionDescription>,
    pub remote_answer: Option<SessionDescription>,
    /// Sender and SDP of the last offer handled. Survives `reset` so a late
    /// redelivery cannot ring again after the call is over.
    pub last_offer: Option<(ParticipantId, String)>,
    /// Remote candidates received before a peer connection existed.
    pub pending_ice_candidates: IceCandidateBuffer,
    /// Local candidates gathered before our offer/answer went out.
    pub outbound_ice: Vec<IceCandidate>,
    pub description_sent: bool,
    pub is_muted: bool,
    pub is_video_enabled: bool,
    pub is_front_camera: bool,
    pub(crate) peer: Option<Arc<PeerConnectionManager>>,
}

impl CallSession {
    pub fn new() -> Self {
        Self {
            is_video_enabled: true,
            is_front_camera: true,
            ..Default::default()
        }
    }

    /// Start a new attempt and return its number.
    pub fn begin(&mut self, conversation: &ConversationId, role: CallRole) -> u64 {
        self.reset();
        self.attempt += 1;
        self.session_id = Some(SessionId::for_attempt(conversation, self.attempt));
        self.local_role = Some(role);
        self.attempt
    }

    /// Clear all per-attempt fields. The caller is responsible for closing
    /// the peer connection it took out beforehand.
    pub fn reset(&mut self) {
        self.session_id = None;
        self.local_role = None;
        self.remote_participant = None;
        self.remote_offer = None;
        self.remote_answer = None;
        self.pending_ice_candidates.clear();
        self.outbound_ice.clear();
        self.description_sent = false;
        self.is_muted = false;
        self.is_video_enabled = true;
        self.is_front_camera = true;
        self.peer = None;
    }

    pub fn facing(&self) -> FacingMode {
        if self.is_front_camera {
            FacingMode::User
        } else {
            FacingMode::Environment
        }
    }

    /// Remember `offer` from `sender`; false when it is the one already
    /// handled.
    pub fn note_offer(&mut self, sender: &ParticipantId, offer: &SessionDescription) -> bool {
        if self.is_last_offer(sender, offer) {
            return false;
        }
        self.last_offer = Some((sender.clone(), offer.sdp.clone()));
        true
    }

    pub fn is_last_offer(&self, sender: &ParticipantId, offer: &SessionDescription) -> bool {
        self.last_offer
            .as_ref()
            .is_some_and(|(from, sdp)| from == sender && *sdp == offer.sdp)
    }

    pub fn is_current(&self, attempt: u64) -> bool {
        self.attempt == attempt && self.state.is_in_call()
    }

    /// Record the remote side on first contact; afterwards only that
    /// participant may drive this attempt.
    pub fn admit_sender(&mut self, sender: &ParticipantId) -> bool {
        match &self.remote_participant {
            Some(remote) => remote == sender,
            None => {
                self.remote_participant = Some(sender.clone());
                true
            }
        }
    }
}

/// Read-only view of the session for the UI.
#[derive(Debug, Clone, Serialize)]
pub struct CallSnapshot {
    pub session_id: Option<SessionId>,
    pub state: CallState,
    pub local_role: Option<CallRole>,
    pub remote_participant: Option<ParticipantId>,
    pub is_muted: bool,
    pub is_video_enabled: bool,
    pub is_front_camera: bool,
    /// Remote candidates not yet applied, across the session and the peer
    /// connection.
    pub pending_ice_candidates: usize,
    pub has_connection: bool,
}

//! Incoming-call prompt.

use callcore::ParticipantId;
use std::sync::Arc;

use super::coordinator::CallCoordinator;
use crate::error::CallError;

/// The accept/decline prompt shown while a call is ringing in.
///
/// Holds no state of its own; visibility and actions come straight from the
/// coordinator.
#[derive(Clone)]
pub struct IncomingCallGate {
    coordinator: Arc<CallCoordinator>,
}

impl IncomingCallGate {
    pub fn new(coordinator: Arc<CallCoordinator>) -> Self {
        Self { coordinator }
    }

    pub async fn is_visible(&self) -> bool {
        self.coordinator.state().await.is_incoming_ringing()
    }

    /// Who is calling, while the prompt is visible.
    pub async fn caller(&self) -> Option<ParticipantId> {
        let snapshot = self.coordinator.snapshot().await;
        if snapshot.state.is_incoming_ringing() {
            snapshot.remote_participant
        } else {
            None
        }
    }

    pub async fn accept(&self) -> Result<(), CallError> {
        self.coordinator.accept_call().await
    }

    pub async fn decline(&self) -> Result<(), CallError> {
        self.coordinator.decline_call().await
    }
}

//! Call session coordinator: the per-conversation call state machine.

use callcore::signal as codec;
use callcore::{
    CallRole, CallState, CallTransition, ConversationId, EndReason, IceCandidate, MediaQuality,
    ParticipantId, SessionDescription, SessionId, Signal, SignalMessage, SignalingState,
};
use log::{debug, error, info, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, MutexGuard, mpsc};
use tokio::task::JoinHandle;

use super::connection::{PeerConnectionManager, RetryPolicy, TrackReplacement};
use super::gate::IncomingCallGate;
use super::session::{CallSession, CallSnapshot};
use crate::channel::{ChannelEvent, ChannelStatus, MessageChannel};
use crate::config::CallConfig;
use crate::error::CallError;
use crate::events::{EventBus, IncomingCall, Notice, StateChanged};
use crate::media::MediaDevices;
use crate::peer::{PeerConnectionFactory, PeerConnectionState, PeerEvent, RtcConfiguration};

/// Coordinates one participant's calls in one conversation.
///
/// Owns the single [`CallSession`], turns UI intents and inbound signals into
/// state transitions, and drives a [`PeerConnectionManager`] per attempt.
/// Failures during an attempt never surface as errors from the public
/// methods; they end the call and emit a [`Notice`].
///
/// The session lock is held across every negotiation step and every send, so
/// signals for one attempt leave in the order they were produced. Only media
/// acquisition runs outside it. Work resumed after an await checks the
/// attempt number and drops out when the attempt is gone.
pub struct CallCoordinator {
    local_id: ParticipantId,
    conversation: ConversationId,
    config: CallConfig,
    channel: Arc<dyn MessageChannel>,
    devices: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerConnectionFactory>,
    session: Mutex<CallSession>,
    channel_available: AtomicBool,
    events: EventBus,
    weak_self: Weak<Self>,
}

impl CallCoordinator {
    pub fn new(
        local_id: impl Into<ParticipantId>,
        conversation: impl Into<ConversationId>,
        config: CallConfig,
        channel: Arc<dyn MessageChannel>,
        devices: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerConnectionFactory>,
    ) -> Arc<Self> {
        let events = EventBus::new(config.event_capacity);
        Arc::new_cyclic(|weak_self| Self {
            local_id: local_id.into(),
            conversation: conversation.into(),
            config,
            channel,
            devices,
            peers,
            session: Mutex::new(CallSession::new()),
            channel_available: AtomicBool::new(true),
            events,
            weak_self: weak_self.clone(),
        })
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub fn conversation(&self) -> &ConversationId {
        &self.conversation
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn is_channel_available(&self) -> bool {
        self.channel_available.load(Ordering::SeqCst)
    }

    /// The incoming-call prompt for this coordinator.
    pub fn gate(self: &Arc<Self>) -> IncomingCallGate {
        IncomingCallGate::new(self.clone())
    }

    /// Subscribe to the conversation and feed every channel event into the
    /// coordinator. The subscription is live when this returns.
    pub fn listen(self: &Arc<Self>) -> JoinHandle<()> {
        let mut rx = self.channel.subscribe(&self.conversation);
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(this) = weak.upgrade() else {
                    break;
                };
                this.handle_channel_event(event).await;
            }
            debug!("Channel subscription closed");
        })
    }

    pub async fn state(&self) -> CallState {
        self.session.lock().await.state.clone()
    }

    pub async fn session_id(&self) -> Option<SessionId> {
        self.session.lock().await.session_id.clone()
    }

    /// Remote candidates received but not yet applied, wherever they wait.
    pub async fn pending_ice_candidates(&self) -> usize {
        let session = self.session.lock().await;
        let buffered_in_peer = match &session.peer {
            Some(peer) => peer.pending_candidate_count().await,
            None => 0,
        };
        session.pending_ice_candidates.len() + buffered_in_peer
    }

    pub async fn has_connection(&self) -> bool {
        self.session.lock().await.peer.is_some()
    }

    pub async fn snapshot(&self) -> CallSnapshot {
        let session = self.session.lock().await;
        let buffered_in_peer = match &session.peer {
            Some(peer) => peer.pending_candidate_count().await,
            None => 0,
        };
        CallSnapshot {
            session_id: session.session_id.clone(),
            state: session.state.clone(),
            local_role: session.local_role,
            remote_participant: session.remote_participant.clone(),
            is_muted: session.is_muted,
            is_video_enabled: session.is_video_enabled,
            is_front_camera: session.is_front_camera,
            pending_ice_candidates: session.pending_ice_candidates.len() + buffered_in_peer,
            has_connection: session.peer.is_some(),
        }
    }

    // ---- UI intents ----

    /// Call the other participant.
    ///
    /// Refused while the channel is down or another call is in progress.
    /// Returns once the offer has been sent or the attempt has failed.
    pub async fn start_call(&self) -> Result<(), CallError> {
        if !self.is_channel_available() {
            return Err(CallError::ChannelUnavailable);
        }
        let attempt = {
            let mut session = self.session.lock().await;
            if !session.state.is_vacant() {
                return Err(CallError::Busy(session.state.name()));
            }
            let attempt = session.begin(&self.conversation, CallRole::Initiator);
            self.transition(&mut session, CallTransition::Started)?;
            attempt
        };
        info!("Starting call in {} (attempt {})", self.conversation, attempt);

        if let Err(e) = self.run_outgoing(attempt).await {
            self.fail(attempt, e).await;
        }
        Ok(())
    }

    /// Accept the ringing call. Camera and microphone are only requested
    /// from here on.
    pub async fn accept_call(&self) -> Result<(), CallError> {
        let attempt = {
            let mut session = self.session.lock().await;
            if !session.state.can_accept() {
                return Err(CallError::NotRinging("accept"));
            }
            self.transition(&mut session, CallTransition::LocalAccepted)?;
            session.attempt
        };
        info!("Accepted call in {} (attempt {})", self.conversation, attempt);
        self.arm_connect_timeout(attempt);

        if let Err(e) = self.run_incoming(attempt).await {
            self.fail(attempt, e).await;
        }
        Ok(())
    }

    /// Refuse the ringing call without touching camera or microphone.
    pub async fn decline_call(&self) -> Result<(), CallError> {
        let attempt = {
            let session = self.session.lock().await;
            if !session.state.is_incoming_ringing() {
                return Err(CallError::NotRinging("decline"));
            }
            session.attempt
        };
        self.end_attempt(attempt, EndReason::LocalDeclined, CallState::is_incoming_ringing)
            .await;
        Ok(())
    }

    /// Hang up. While an incoming call is ringing this declines it. Calling
    /// it with no call in progress does nothing.
    pub async fn end_call(&self) -> Result<(), CallError> {
        let attempt = {
            let session = self.session.lock().await;
            if !session.state.is_in_call() {
                debug!("end_call with no call in progress");
                return Ok(());
            }
            session.attempt
        };
        self.end_attempt(attempt, EndReason::LocalEnded, |_| true)
            .await;
        Ok(())
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        let mut session = self.session.lock().await;
        if !session.state.is_in_call() {
            return Err(CallError::NoConnection);
        }
        session.is_muted = muted;
        if let Some(peer) = &session.peer {
            peer.set_audio_enabled(!muted).await;
        }
        debug!("Microphone {}", if muted { "muted" } else { "unmuted" });
        Ok(())
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<(), CallError> {
        let mut session = self.session.lock().await;
        if !session.state.is_in_call() {
            return Err(CallError::NoConnection);
        }
        if let Some(peer) = session.peer.clone() {
            let attached = peer.signaling_state().await != SignalingState::New;
            if enabled && attached && !peer.has_video().await {
                warn!("No camera track to enable");
                return Ok(());
            }
            peer.set_video_enabled(enabled).await;
        }
        session.is_video_enabled = enabled;
        Ok(())
    }

    /// Flip between front and rear camera.
    ///
    /// If the new camera cannot be opened after the configured retries the
    /// call continues with audio only in the degraded media state.
    pub async fn switch_camera(&self) -> Result<(), CallError> {
        let (attempt, peer, facing) = {
            let session = self.session.lock().await;
            let Some(peer) = session.peer.clone() else {
                return Err(CallError::NoConnection);
            };
            (session.attempt, peer, session.facing().flipped())
        };
        let policy = RetryPolicy {
            attempts: self.config.camera_switch_attempts,
            backoff: self.config.camera_retry_backoff(),
        };
        let result = peer
            .switch_camera(self.devices.as_ref(), facing, policy)
            .await;

        let Ok(mut session) = self.lock_current(attempt).await else {
            return Ok(());
        };
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancellation() => return Ok(()),
            Err(e) => {
                warn!("Camera switch failed, continuing audio-only: {}", e);
                session.is_video_enabled = false;
                if session.state.is_active() {
                    self.transition(&mut session, CallTransition::MediaDegraded)?;
                }
                self.events
                    .emit_notice(Notice::warning("Camera unavailable, continuing with audio"));
                return Ok(());
            }
        };

        session.is_front_camera = facing.is_front();
        session.is_video_enabled = true;
        if session.state.media_quality() == Some(MediaQuality::Degraded) {
            self.transition(&mut session, CallTransition::MediaRestored)?;
        }
        if outcome == TrackReplacement::AddedNeedsRenegotiation {
            info!("Renegotiating after adding a video track");
            let result = self.send_new_offer(&mut session, &peer).await;
            drop(session);
            if let Err(e) = result {
                self.fail(attempt, e).await;
            }
        }
        Ok(())
    }

    // ---- inbound ----

    pub async fn handle_channel_event(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::Message(message) => {
                if let Some(signal) = codec::decode(&message.sender, &message.text) {
                    self.handle_signal(signal).await;
                }
            }
            ChannelEvent::Status(status) => self.on_channel_status(status),
        }
    }

    pub async fn handle_signal(&self, message: SignalMessage) {
        if message.sender_id == self.local_id {
            trace!("Ignoring echo of our own {}", message.kind());
            return;
        }
        let sender = message.sender_id;
        match message.signal {
            Signal::Offer(offer) => self.on_remote_offer(&sender, offer).await,
            Signal::Answer(answer) => self.on_remote_answer(&sender, answer).await,
            Signal::Ice(candidate) => self.on_remote_candidate(&sender, candidate).await,
            Signal::End => self.on_remote_end(&sender, EndReason::RemoteEnded).await,
            Signal::Declined => self.on_remote_end(&sender, EndReason::RemoteDeclined).await,
        }
    }

    fn on_channel_status(&self, status: ChannelStatus) {
        let available = status.is_available();
        let was_available = self.channel_available.swap(available, Ordering::SeqCst);
        if was_available && !available {
            warn!("Signaling channel for {} is {:?}", self.conversation, status);
            self.events
                .emit_notice(Notice::warning("Call signaling is unavailable"));
        } else if !was_available && available {
            info!("Signaling channel for {} is back", self.conversation);
            self.events
                .emit_notice(Notice::info("Call signaling reconnected"));
        }
    }

    async fn on_remote_offer(&self, sender: &ParticipantId, offer: SessionDescription) {
        let mut session = self.session.lock().await;

        if session.state.is_vacant() {
            if !session.note_offer(sender, &offer) {
                debug!("Ignoring redelivered offer from {} for a finished call", sender);
                return;
            }
            let attempt = session.begin(&self.conversation, CallRole::Receiver);
            session.admit_sender(sender);
            session.remote_offer = Some(offer);
            if let Err(e) = self.transition(&mut session, CallTransition::OfferReceived) {
                warn!("Cannot ring for incoming offer: {}", e);
                return;
            }
            info!("Incoming call from {} (attempt {})", sender, attempt);
            self.events.emit_incoming(IncomingCall {
                session_id: SessionId::for_attempt(&self.conversation, attempt),
                from: sender.clone(),
            });
            return;
        }

        if !session.admit_sender(sender) {
            debug!("Ignoring offer from {}, not part of this call", sender);
            return;
        }
        if session.remote_offer.as_ref() == Some(&offer) || !session.note_offer(sender, &offer) {
            debug!("Ignoring redelivered offer");
            return;
        }

        let attempt = session.attempt;
        let result = match session.state.clone() {
            CallState::IncomingRinging { .. } => {
                debug!("Replacing buffered offer");
                session.remote_offer = Some(offer);
                Ok(())
            }
            CallState::OutgoingRinging { .. } => {
                self.on_glare_offer(&mut session, sender, offer).await
            }
            CallState::Connecting { .. } | CallState::Active { .. } => {
                self.on_renegotiation_offer(&mut session, offer).await
            }
            CallState::Idle | CallState::Ended { .. } => Ok(()),
        };
        drop(session);
        if let Err(e) = result {
            self.fail(attempt, e).await;
        }
    }

    /// Both sides offered at once. The participant with the greater id
    /// yields and answers the other's offer.
    async fn on_glare_offer(
        &self,
        session: &mut CallSession,
        sender: &ParticipantId,
        offer: SessionDescription,
    ) -> Result<(), CallError> {
        if self.local_id < *sender {
            debug!("Offer glare with {}: keeping our offer", sender);
            return Ok(());
        }
        info!("Offer glare with {}: yielding", sender);
        session.remote_offer = Some(offer.clone());
        let Some(peer) = session.peer.clone() else {
            return Ok(());
        };
        if peer.signaling_state().await != SignalingState::HaveLocalOffer {
            // Picked up once our media is attached.
            return Ok(());
        }
        self.yield_to_offer(session, &peer, offer).await
    }

    async fn yield_to_offer(
        &self,
        session: &mut CallSession,
        peer: &PeerConnectionManager,
        offer: SessionDescription,
    ) -> Result<(), CallError> {
        session.local_role = Some(CallRole::Receiver);
        self.transition(session, CallTransition::GlareYielded)?;
        self.arm_connect_timeout(session.attempt);
        if let Some(answer) = peer.consume_remote_offer(offer).await? {
            self.send_description(session, Signal::Answer(answer)).await?;
        }
        Ok(())
    }

    async fn on_renegotiation_offer(
        &self,
        session: &mut CallSession,
        offer: SessionDescription,
    ) -> Result<(), CallError> {
        session.remote_offer = Some(offer.clone());
        let Some(peer) = session.peer.clone() else {
            return Ok(());
        };
        if peer.signaling_state().await == SignalingState::New {
            // Still acquiring media; the latest offer is answered afterwards.
            return Ok(());
        }
        debug!("Renegotiation offer received");
        if let Some(answer) = peer.consume_remote_offer(offer).await? {
            self.send_description(session, Signal::Answer(answer)).await?;
        }
        Ok(())
    }

    async fn on_remote_answer(&self, sender: &ParticipantId, answer: SessionDescription) {
        let mut session = self.session.lock().await;
        if !session.state.is_in_call() || !session.admit_sender(sender) {
            return;
        }
        let Some(peer) = session.peer.clone() else {
            debug!("Ignoring answer without a peer connection");
            return;
        };
        let attempt = session.attempt;

        let result = match session.state.clone() {
            CallState::OutgoingRinging { .. } => {
                session.remote_answer = Some(answer.clone());
                match self.transition(&mut session, CallTransition::RemoteAnswered) {
                    Ok(()) => {
                        info!("Call answered by {}", sender);
                        self.arm_connect_timeout(attempt);
                        peer.consume_remote_answer(answer).await.map(|_| ())
                    }
                    Err(e) => Err(e),
                }
            }
            CallState::Connecting { .. } | CallState::Active { .. } => {
                session.remote_answer = Some(answer.clone());
                peer.consume_remote_answer(answer).await.map(|_| ())
            }
            _ => {
                debug!("Ignoring answer in state {}", session.state.name());
                Ok(())
            }
        };
        drop(session);
        if let Err(e) = result {
            self.fail(attempt, e).await;
        }
    }

    async fn on_remote_candidate(&self, sender: &ParticipantId, candidate: IceCandidate) {
        let mut session = self.session.lock().await;
        if !session.state.is_in_call() || !session.admit_sender(sender) {
            trace!("Ignoring candidate outside a call");
            return;
        }
        match session.peer.clone() {
            Some(peer) => match peer.add_remote_ice_candidate(candidate).await {
                Ok(disposition) => trace!("Remote candidate {:?}", disposition),
                Err(e) if e.is_cancellation() => {}
                Err(e) => warn!("Failed to apply remote candidate: {}", e),
            },
            None => {
                session.pending_ice_candidates.push(candidate);
                debug!(
                    "Buffered remote candidate before connection ({} pending)",
                    session.pending_ice_candidates.len()
                );
            }
        }
    }

    async fn on_remote_end(&self, sender: &ParticipantId, reason: EndReason) {
        let attempt = {
            let mut session = self.session.lock().await;
            if !session.state.is_in_call() || !session.admit_sender(sender) {
                trace!("Ignoring {:?} outside a call", reason);
                return;
            }
            session.attempt
        };
        self.end_attempt(attempt, reason, |_| true).await;
    }

    // ---- attempt flows ----

    async fn run_outgoing(&self, attempt: u64) -> Result<(), CallError> {
        if let Err(e) = self
            .channel
            .send(&self.conversation, &self.config.call_marker_text)
            .await
        {
            warn!("Failed to post call marker: {}", e);
        }

        let peer = self.create_peer(attempt, CallRole::Initiator).await?;
        self.attach_media(attempt, &peer).await?;

        let mut session = self.lock_current(attempt).await?;
        if let Some(offer) = session.remote_offer.clone() {
            return self.yield_to_offer(&mut session, &peer, offer).await;
        }
        self.send_new_offer(&mut session, &peer).await
    }

    async fn run_incoming(&self, attempt: u64) -> Result<(), CallError> {
        let peer = self.create_peer(attempt, CallRole::Receiver).await?;
        self.attach_media(attempt, &peer).await?;

        let mut session = self.lock_current(attempt).await?;
        let Some(offer) = session.remote_offer.clone() else {
            return Err(CallError::NotRinging("answer"));
        };
        if let Some(answer) = peer.consume_remote_offer(offer).await? {
            self.send_description(&mut session, Signal::Answer(answer))
                .await?;
        }
        Ok(())
    }

    /// Create the native connection for `attempt` and hand it the remote
    /// candidates that arrived before it existed.
    async fn create_peer(
        &self,
        attempt: u64,
        role: CallRole,
    ) -> Result<Arc<PeerConnectionManager>, CallError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let pc = self
            .peers
            .create(&RtcConfiguration::from(&self.config), tx)
            .await
            .map_err(CallError::Peer)?;
        let peer = Arc::new(PeerConnectionManager::new(role, pc));

        {
            let mut session = self.session.lock().await;
            if !session.is_current(attempt) {
                drop(session);
                peer.close().await;
                return Err(CallError::Closed);
            }
            for candidate in session.pending_ice_candidates.drain() {
                if let Err(e) = peer.add_remote_ice_candidate(candidate).await {
                    warn!("Failed to hand over buffered candidate: {}", e);
                }
            }
            session.peer = Some(peer.clone());
        }

        self.spawn_peer_events(attempt, rx);
        debug!("Peer connection created as {:?}", role);
        Ok(peer)
    }

    async fn attach_media(
        &self,
        attempt: u64,
        peer: &PeerConnectionManager,
    ) -> Result<(), CallError> {
        let facing = self.lock_current(attempt).await?.facing();
        let fallback = peer.acquire_media(self.devices.as_ref(), facing).await?;

        let mut session = self.lock_current(attempt).await?;
        if let Some(reason) = fallback {
            info!("Continuing audio-only: {}", reason);
            session.is_video_enabled = false;
            self.events
                .emit_notice(Notice::warning("Camera unavailable, continuing with audio"));
        } else if !session.is_video_enabled {
            peer.set_video_enabled(false).await;
        }
        if session.is_muted {
            peer.set_audio_enabled(false).await;
        }
        Ok(())
    }

    async fn send_new_offer(
        &self,
        session: &mut CallSession,
        peer: &PeerConnectionManager,
    ) -> Result<(), CallError> {
        match peer.create_offer().await? {
            Some(offer) => self.send_description(session, Signal::Offer(offer)).await,
            None => Ok(()),
        }
    }

    /// Send our offer or answer, then any local candidates that were
    /// gathered before it went out.
    async fn send_description(
        &self,
        session: &mut CallSession,
        signal: Signal,
    ) -> Result<(), CallError> {
        self.send_signal(&signal).await?;
        session.description_sent = true;
        let queued = std::mem::take(&mut session.outbound_ice);
        if !queued.is_empty() {
            debug!("Flushing {} queued local candidates", queued.len());
        }
        for candidate in queued {
            if let Err(e) = self.send_signal(&Signal::Ice(candidate)).await {
                warn!("Failed to send local candidate: {}", e);
            }
        }
        Ok(())
    }

    async fn send_signal(&self, signal: &Signal) -> Result<(), CallError> {
        let text = codec::encode(signal)?;
        self.channel
            .send(&self.conversation, &text)
            .await
            .map_err(CallError::Channel)
    }

    fn spawn_peer_events(&self, attempt: u64, mut rx: mpsc::UnboundedReceiver<PeerEvent>) {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(this) = weak.upgrade() else {
                    break;
                };
                this.handle_peer_event(attempt, event).await;
            }
            trace!("Peer events for attempt {} finished", attempt);
        });
    }

    async fn handle_peer_event(&self, attempt: u64, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate(candidate) => {
                let mut session = self.session.lock().await;
                if !session.is_current(attempt) {
                    return;
                }
                if !session.description_sent {
                    session.outbound_ice.push(candidate);
                    return;
                }
                if let Err(e) = self.send_signal(&Signal::Ice(candidate)).await {
                    warn!("Failed to send local candidate: {}", e);
                }
            }
            PeerEvent::ConnectionStateChanged(PeerConnectionState::Connected) => {
                let mut session = self.session.lock().await;
                if !session.is_current(attempt) || !session.state.is_connecting() {
                    return;
                }
                match self.transition(&mut session, CallTransition::MediaConnected) {
                    Ok(()) => info!("Call connected (attempt {})", attempt),
                    Err(e) => warn!("{}", e),
                }
            }
            PeerEvent::ConnectionStateChanged(PeerConnectionState::Failed) => {
                error!("Peer connection failed (attempt {})", attempt);
                self.end_attempt(attempt, EndReason::ConnectionFailed, |_| true)
                    .await;
            }
            PeerEvent::ConnectionStateChanged(PeerConnectionState::Disconnected) => {
                if self.session.lock().await.is_current(attempt) {
                    warn!("Peer connection interrupted (attempt {})", attempt);
                    self.events
                        .emit_notice(Notice::warning("Connection interrupted"));
                }
            }
            PeerEvent::ConnectionStateChanged(state) => {
                trace!("Peer connection state {:?}", state);
            }
        }
    }

    fn arm_connect_timeout(&self, attempt: u64) {
        let Some(timeout) = self.config.connect_timeout() else {
            return;
        };
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(this) = weak.upgrade() else {
                return;
            };
            if this
                .end_attempt(attempt, EndReason::ConnectTimeout, CallState::is_connecting)
                .await
            {
                warn!("Call did not connect within {:?}", timeout);
            }
        });
    }

    // ---- teardown ----

    async fn fail(&self, attempt: u64, err: CallError) {
        if err.is_cancellation() {
            debug!("Attempt {} cancelled", attempt);
            return;
        }
        let reason = match &err {
            CallError::Media(_) => EndReason::MediaUnavailable,
            _ => EndReason::NegotiationFailed,
        };
        error!("Call attempt {} failed: {}", attempt, err);
        self.end_attempt(attempt, reason, |_| true).await;
    }

    /// End `attempt` if it is still current and `only_if` holds for its
    /// state. Returns whether it was ended here.
    ///
    /// END (or DECLINED, while ringing) goes out only when the end started
    /// on this side.
    async fn end_attempt<F>(&self, attempt: u64, reason: EndReason, only_if: F) -> bool
    where
        F: FnOnce(&CallState) -> bool,
    {
        let (peer, outbound) = {
            let mut session = self.session.lock().await;
            if !session.is_current(attempt) || !only_if(&session.state) {
                return false;
            }
            let reason = match reason {
                EndReason::LocalEnded if session.state.is_incoming_ringing() => {
                    EndReason::LocalDeclined
                }
                other => other,
            };
            let outbound = match reason {
                EndReason::RemoteEnded | EndReason::RemoteDeclined => None,
                EndReason::LocalDeclined => Some(Signal::Declined),
                _ => Some(Signal::End),
            };
            if let Err(e) = self.transition(&mut session, CallTransition::Terminated { reason }) {
                warn!("{}", e);
                return false;
            }
            let peer = session.peer.take();
            session.reset();
            info!("Call attempt {} ended: {:?}", attempt, reason);
            self.notify_end(reason);
            (peer, outbound)
        };

        if let Some(signal) = outbound
            && let Err(e) = self.send_signal(&signal).await
        {
            warn!("Failed to send {}: {}", signal.kind(), e);
        }
        if let Some(peer) = peer {
            peer.close().await;
        }
        true
    }

    fn notify_end(&self, reason: EndReason) {
        let notice = match reason {
            EndReason::RemoteDeclined => Notice::info("Call declined"),
            EndReason::RemoteEnded => Notice::info("Call ended"),
            EndReason::ConnectionFailed => Notice::error("Connection failed"),
            EndReason::ConnectTimeout => Notice::error("Failed to connect"),
            EndReason::MediaUnavailable => Notice::error("Camera and microphone unavailable"),
            EndReason::NegotiationFailed => Notice::error("Connection error"),
            EndReason::LocalEnded | EndReason::LocalDeclined => return,
        };
        self.events.emit_notice(notice);
    }

    // ---- helpers ----

    async fn lock_current(&self, attempt: u64) -> Result<MutexGuard<'_, CallSession>, CallError> {
        let session = self.session.lock().await;
        if session.is_current(attempt) {
            Ok(session)
        } else {
            Err(CallError::Closed)
        }
    }

    fn transition(
        &self,
        session: &mut CallSession,
        transition: CallTransition,
    ) -> Result<(), CallError> {
        let from = session.state.name();
        session.state.apply(transition)?;
        debug!("Call state {} -> {}", from, session.state.name());
        self.events.emit_state(StateChanged {
            session_id: session.session_id.clone(),
            from,
            state: session.state.clone(),
        });
        Ok(())
    }
}

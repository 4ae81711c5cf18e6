//! Peer connection manager: one native peer connection plus local media for
//! exactly one call attempt.

use callcore::{
    CallRole, FacingMode, IceCandidate, IceCandidateBuffer, SessionDescription, SignalingOp,
    SignalingState, SignalingViolation,
};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::CallError;
use crate::media::{
    self, MediaConstraints, MediaDevices, MediaError, MediaStream, MediaTrack, TrackKind,
};
use crate::peer::PeerConnection;

/// What happened to a remote candidate handed to the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    Applied,
    /// Held until a remote description is applied.
    Buffered,
}

/// Outcome of swapping the outbound video track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackReplacement {
    /// Swapped on the existing sender; no renegotiation.
    Replaced,
    /// No video sender existed; a new track was added and the caller must
    /// renegotiate.
    AddedNeedsRenegotiation,
}

/// Bounded retry for camera switches.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

struct ManagerState {
    signaling: SignalingState,
    pending: IceCandidateBuffer,
    remote_description_set: bool,
    /// SDP of the last remote offer applied, to skip redeliveries.
    last_remote_offer: Option<String>,
    local_stream: Option<MediaStream>,
    facing: FacingMode,
}

/// Wraps the native connection and keeps every public operation inside the
/// signaling-state rules. Errors are returned, never thrown into the caller's
/// task.
pub struct PeerConnectionManager {
    role: CallRole,
    pc: Arc<dyn PeerConnection>,
    closed: AtomicBool,
    state: Mutex<ManagerState>,
}

impl PeerConnectionManager {
    pub fn new(role: CallRole, pc: Arc<dyn PeerConnection>) -> Self {
        Self {
            role,
            pc,
            closed: AtomicBool::new(false),
            state: Mutex::new(ManagerState {
                signaling: SignalingState::New,
                pending: IceCandidateBuffer::new(),
                remote_description_set: false,
                last_remote_offer: None,
                local_stream: None,
                facing: FacingMode::User,
            }),
        }
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn signaling_state(&self) -> SignalingState {
        self.state.lock().await.signaling
    }

    pub async fn pending_candidate_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn facing(&self) -> FacingMode {
        self.state.lock().await.facing
    }

    pub async fn has_video(&self) -> bool {
        self.state
            .lock()
            .await
            .local_stream
            .as_ref()
            .is_some_and(MediaStream::has_video)
    }

    pub async fn live_track_count(&self) -> usize {
        self.state
            .lock()
            .await
            .local_stream
            .as_ref()
            .map_or(0, MediaStream::live_track_count)
    }

    fn ensure_open(&self) -> Result<(), CallError> {
        if self.is_closed() {
            Err(CallError::Closed)
        } else {
            Ok(())
        }
    }

    /// Acquire camera and microphone (or microphone alone) and attach the
    /// tracks. Returns the camera error when the call fell back to audio.
    ///
    /// If the manager is closed while the request is in flight, the stream
    /// that eventually arrives is stopped immediately.
    pub async fn acquire_media(
        &self,
        devices: &dyn MediaDevices,
        facing: FacingMode,
    ) -> Result<Option<MediaError>, CallError> {
        self.ensure_open()?;
        let acquired = media::acquire_media(devices, facing).await?;

        if self.is_closed() {
            debug!("Media arrived after close, releasing it");
            acquired.stream.stop_all();
            return Err(CallError::Closed);
        }

        let mut state = self.state.lock().await;
        if self.is_closed() {
            acquired.stream.stop_all();
            return Err(CallError::Closed);
        }
        let next = state.signaling.after(SignalingOp::MediaAttached).inspect_err(|_| {
            acquired.stream.stop_all();
        })?;

        for track in acquired.stream.tracks() {
            if let Err(e) = self.pc.add_track(track.clone()).await {
                acquired.stream.stop_all();
                return Err(CallError::Peer(e));
            }
        }

        info!(
            "Local media attached ({} tracks, video: {})",
            acquired.stream.tracks().len(),
            acquired.stream.has_video()
        );
        state.signaling = next;
        state.local_stream = Some(acquired.stream);
        state.facing = facing;
        Ok(acquired.fallback)
    }

    /// Create and apply a local offer.
    ///
    /// Only legal from `stable`; anywhere else this logs and returns
    /// `Ok(None)`.
    pub async fn create_offer(&self) -> Result<Option<SessionDescription>, CallError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        if state.signaling != SignalingState::Stable {
            warn!(
                "Ignoring create_offer in signaling state {}",
                state.signaling
            );
            return Ok(None);
        }

        let offer = self.pc.create_offer().await.map_err(CallError::Peer)?;
        self.ensure_open()?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(CallError::Peer)?;
        state.signaling = state.signaling.after(SignalingOp::SetLocalOffer)?;
        debug!("Local offer applied");
        Ok(Some(offer))
    }

    /// Apply a remote offer and answer it.
    ///
    /// Returns `Ok(None)` when this exact offer was already processed.
    pub async fn consume_remote_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<Option<SessionDescription>, CallError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        if state.last_remote_offer.as_deref() == Some(offer.sdp.as_str()) {
            debug!("Skipping redelivered offer");
            return Ok(None);
        }

        let next = state
            .signaling
            .after(SignalingOp::SetRemoteOffer)
            .inspect_err(|v| error!("Cannot apply remote offer ({}, role {:?})", v, self.role))?;
        self.pc
            .set_remote_description(offer.clone())
            .await
            .map_err(CallError::Peer)?;
        state.signaling = next;
        state.remote_description_set = true;
        state.last_remote_offer = Some(offer.sdp);
        self.flush_pending(&mut state).await;

        let answer = self.pc.create_answer().await.map_err(CallError::Peer)?;
        self.ensure_open()?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(CallError::Peer)?;
        state.signaling = state.signaling.after(SignalingOp::SetLocalAnswer)?;
        debug!("Remote offer applied, local answer created");
        Ok(Some(answer))
    }

    /// Apply the remote answer to our offer.
    ///
    /// Returns `Ok(false)` for a late or duplicate answer arriving in
    /// `stable`.
    pub async fn consume_remote_answer(
        &self,
        answer: SessionDescription,
    ) -> Result<bool, CallError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        match state.signaling {
            SignalingState::Stable => {
                debug!("Ignoring answer in stable state (late or duplicate)");
                Ok(false)
            }
            SignalingState::HaveLocalOffer => {
                self.pc
                    .set_remote_description(answer)
                    .await
                    .map_err(CallError::Peer)?;
                state.signaling = state.signaling.after(SignalingOp::SetRemoteAnswer)?;
                state.remote_description_set = true;
                self.flush_pending(&mut state).await;
                debug!("Remote answer applied");
                Ok(true)
            }
            current => {
                let violation = SignalingViolation {
                    state: current,
                    op: SignalingOp::SetRemoteAnswer,
                };
                error!("Cannot apply remote answer: {} (role {:?})", violation, self.role);
                Err(violation.into())
            }
        }
    }

    /// Hand over a remote candidate. Buffered until a remote description is
    /// in place.
    pub async fn add_remote_ice_candidate(
        &self,
        candidate: IceCandidate,
    ) -> Result<CandidateDisposition, CallError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;
        if !state.remote_description_set {
            state.pending.push(candidate);
            debug!("Buffered remote candidate ({} pending)", state.pending.len());
            return Ok(CandidateDisposition::Buffered);
        }
        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(CallError::Peer)?;
        Ok(CandidateDisposition::Applied)
    }

    async fn flush_pending(&self, state: &mut ManagerState) {
        let buffered = state.pending.drain();
        if buffered.is_empty() {
            return;
        }
        debug!("Flushing {} buffered remote candidates", buffered.len());
        for candidate in buffered {
            if let Err(e) = self.pc.add_ice_candidate(candidate).await {
                warn!("Failed to apply buffered candidate: {}", e);
            }
        }
    }

    /// Swap the outbound video track, stopping the previous one.
    pub async fn replace_video_track(
        &self,
        track: Arc<dyn MediaTrack>,
    ) -> Result<TrackReplacement, CallError> {
        self.ensure_open()?;
        let mut state = self.state.lock().await;

        let mut video_sender = None;
        for sender in self.pc.senders().await {
            if sender.track_kind() == Some(TrackKind::Video) {
                video_sender = Some(sender);
                break;
            }
        }

        let outcome = match video_sender {
            Some(sender) => {
                sender
                    .replace_track(Some(track.clone()))
                    .await
                    .map_err(CallError::Peer)?;
                TrackReplacement::Replaced
            }
            None => {
                self.pc
                    .add_track(track.clone())
                    .await
                    .map_err(CallError::Peer)?;
                TrackReplacement::AddedNeedsRenegotiation
            }
        };

        let stream = state.local_stream.get_or_insert_with(MediaStream::default);
        stream.stop_kind(TrackKind::Video);
        stream.add_track(track);
        Ok(outcome)
    }

    /// Switch to the camera facing `facing`.
    ///
    /// The current camera is released first so the device is free. Gives up
    /// after `policy.attempts` failed requests.
    pub async fn switch_camera(
        &self,
        devices: &dyn MediaDevices,
        facing: FacingMode,
        policy: RetryPolicy,
    ) -> Result<TrackReplacement, CallError> {
        self.ensure_open()?;
        {
            let mut state = self.state.lock().await;
            if let Some(stream) = state.local_stream.as_mut() {
                stream.stop_kind(TrackKind::Video);
            }
        }

        let attempts = policy.attempts.max(1);
        let mut last_err = MediaError::NotFound("camera".to_string());
        for attempt in 1..=attempts {
            match devices
                .get_user_media(MediaConstraints::video_only(facing))
                .await
            {
                Ok(stream) => {
                    if self.is_closed() {
                        stream.stop_all();
                        return Err(CallError::Closed);
                    }
                    let Some(track) = stream.tracks_of(TrackKind::Video).next().cloned() else {
                        stream.stop_all();
                        last_err = MediaError::NotFound("camera".to_string());
                        continue;
                    };
                    let outcome = self.replace_video_track(track).await?;
                    self.state.lock().await.facing = facing;
                    info!("Switched camera to {:?} ({:?})", facing, outcome);
                    return Ok(outcome);
                }
                Err(e) => {
                    warn!(
                        "Camera switch attempt {}/{} failed: {}",
                        attempt, attempts, e
                    );
                    last_err = e;
                    if attempt < attempts {
                        tokio::time::sleep(policy.backoff).await;
                        self.ensure_open()?;
                    }
                }
            }
        }
        Err(CallError::Media(last_err))
    }

    pub async fn set_audio_enabled(&self, enabled: bool) {
        if let Some(stream) = self.state.lock().await.local_stream.as_ref() {
            stream.set_enabled(TrackKind::Audio, enabled);
        }
    }

    pub async fn set_video_enabled(&self, enabled: bool) {
        if let Some(stream) = self.state.lock().await.local_stream.as_ref() {
            stream.set_enabled(TrackKind::Video, enabled);
        }
    }

    /// Tear everything down. Safe to call any number of times.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pc.detach_handlers();

        let mut state = self.state.lock().await;
        if let Some(stream) = state.local_stream.take() {
            stream.stop_all();
        }
        if !self.pc.signaling_state().is_closed() {
            self.pc.close().await;
        }
        state.pending.clear();
        state.signaling = SignalingState::Closed;
        debug!("Peer connection closed ({:?})", self.role);
    }
}

//! In-process stand-ins for the native media and peer-connection primitives.
//!
//! They follow the browser rules closely enough to drive real call flows
//! without hardware: description mutations are rejected in the wrong
//! signaling state, candidates are gathered after the first local
//! description, candidates are refused before a remote description exists,
//! and the connection reports `connected` once descriptions and at least one
//! remote candidate are in place. Used by the demo binary and by tests.

use async_trait::async_trait;
use callcore::{IceCandidate, SdpType, SessionDescription, SignalingState};
use dashmap::DashMap;
use log::{debug, trace};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::media::{
    MediaConstraints, MediaDevices, MediaError, MediaStream, MediaTrack, TrackKind,
};
use crate::peer::{
    PeerConnection, PeerConnectionFactory, PeerConnectionState, PeerEvent, RtcConfiguration,
    RtpSender,
};

static NEXT_TRACK: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
pub struct LoopbackTrack {
    id: String,
    kind: TrackKind,
    live: AtomicBool,
    enabled: AtomicBool,
}

impl LoopbackTrack {
    pub fn new(kind: TrackKind) -> Arc<Self> {
        let n = NEXT_TRACK.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self {
            id: format!("{}-{}", kind.as_str(), n),
            kind,
            live: AtomicBool::new(true),
            enabled: AtomicBool::new(true),
        })
    }
}

impl MediaTrack for LoopbackTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn stop(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            trace!("Track {} stopped", self.id);
        }
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

/// Simulated camera and microphone.
#[derive(Default)]
pub struct LoopbackMediaDevices {
    requests: AtomicUsize,
    deny_video: AtomicBool,
    deny_all: AtomicBool,
    /// Upcoming video requests that fail with "device busy".
    busy_video_requests: AtomicU32,
    delay_ms: AtomicU64,
    issued: DashMap<String, Arc<LoopbackTrack>>,
}

impl LoopbackMediaDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse camera permission.
    pub fn deny_video(self) -> Self {
        self.deny_video.store(true, Ordering::SeqCst);
        self
    }

    /// Refuse both camera and microphone permission.
    pub fn deny_all(self) -> Self {
        self.deny_all.store(true, Ordering::SeqCst);
        self
    }

    /// Resolve every request only after `delay`.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.delay_ms.store(
            u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            Ordering::SeqCst,
        );
        self
    }

    pub fn set_busy_video_requests(&self, count: u32) {
        self.busy_video_requests.store(count, Ordering::SeqCst);
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Tracks handed out and not yet stopped.
    pub fn live_track_count(&self) -> usize {
        self.issued.iter().filter(|t| t.is_live()).count()
    }

    fn issue(&self, kind: TrackKind) -> Arc<dyn MediaTrack> {
        let track = LoopbackTrack::new(kind);
        self.issued.insert(track.id.clone(), track.clone());
        track
    }
}

#[async_trait]
impl MediaDevices for LoopbackMediaDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, MediaError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if self.deny_all.load(Ordering::SeqCst) {
            let what = if constraints.audio {
                "microphone"
            } else {
                "camera"
            };
            return Err(MediaError::PermissionDenied(what));
        }
        if constraints.video.is_some() {
            if self.deny_video.load(Ordering::SeqCst) {
                return Err(MediaError::PermissionDenied("camera"));
            }
            let busy = self
                .busy_video_requests
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if busy {
                return Err(MediaError::DeviceBusy("camera".to_string()));
            }
        }

        let mut stream = MediaStream::default();
        if constraints.audio {
            stream.add_track(self.issue(TrackKind::Audio));
        }
        if let Some(facing) = constraints.video {
            debug!("Opening {:?} camera", facing);
            stream.add_track(self.issue(TrackKind::Video));
        }
        Ok(stream)
    }
}

/// How a loopback connection behaves once negotiation is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectBehavior {
    #[default]
    Connect,
    /// Report `failed` instead of `connected`.
    Fail,
    /// Never leave `connecting`.
    Stall,
}

/// Creates [`LoopbackPeerConnection`]s and keeps them for inspection.
pub struct LoopbackPeerFactory {
    behavior: ConnectBehavior,
    candidates_per_gathering: usize,
    created: DashMap<usize, Arc<LoopbackPeerConnection>>,
}

impl Default for LoopbackPeerFactory {
    fn default() -> Self {
        Self {
            behavior: ConnectBehavior::Connect,
            candidates_per_gathering: 2,
            created: DashMap::new(),
        }
    }
}

impl LoopbackPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(mut self, behavior: ConnectBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_candidates(mut self, count: usize) -> Self {
        self.candidates_per_gathering = count;
        self
    }

    pub fn created_count(&self) -> usize {
        self.created.len()
    }

    /// The `n`th connection created, zero-based.
    pub fn connection(&self, n: usize) -> Option<Arc<LoopbackPeerConnection>> {
        self.created.get(&n).map(|c| c.clone())
    }
}

#[async_trait]
impl PeerConnectionFactory for LoopbackPeerFactory {
    async fn create(
        &self,
        config: &RtcConfiguration,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, anyhow::Error> {
        debug!(
            "Creating loopback peer connection ({} ICE servers)",
            config.ice_servers.len()
        );
        let pc = Arc::new(LoopbackPeerConnection::new(
            events,
            self.behavior,
            self.candidates_per_gathering,
        ));
        self.created.insert(self.created.len(), pc.clone());
        Ok(pc)
    }
}

struct LoopbackSender {
    kind: TrackKind,
    track: Mutex<Option<Arc<dyn MediaTrack>>>,
}

#[async_trait]
impl RtpSender for LoopbackSender {
    fn track_kind(&self) -> Option<TrackKind> {
        Some(self.kind)
    }

    async fn replace_track(&self, track: Option<Arc<dyn MediaTrack>>) -> Result<(), anyhow::Error> {
        if let Some(t) = &track
            && t.kind() != self.kind
        {
            anyhow::bail!("cannot replace {} track with {}", self.kind.as_str(), t.kind().as_str());
        }
        *self.track.lock().unwrap_or_else(PoisonError::into_inner) = track;
        Ok(())
    }
}

#[derive(Default)]
struct PcInner {
    signaling: SignalingState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    gathered: bool,
    remote_candidates: Vec<IceCandidate>,
    connection: Option<PeerConnectionState>,
    senders: Vec<Arc<LoopbackSender>>,
    events: Option<mpsc::UnboundedSender<PeerEvent>>,
    answers_created: usize,
    offers_created: usize,
}

/// Simulated native peer connection.
pub struct LoopbackPeerConnection {
    inner: Mutex<PcInner>,
    behavior: ConnectBehavior,
    candidates_per_gathering: usize,
    session_id: u64,
    ufrag: String,
}

impl LoopbackPeerConnection {
    fn new(
        events: mpsc::UnboundedSender<PeerEvent>,
        behavior: ConnectBehavior,
        candidates_per_gathering: usize,
    ) -> Self {
        Self {
            inner: Mutex::new(PcInner {
                signaling: SignalingState::Stable,
                events: Some(events),
                ..Default::default()
            }),
            behavior,
            candidates_per_gathering,
            session_id: rand::random::<u32>() as u64,
            ufrag: format!("{:08x}", rand::random::<u32>()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PcInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn answers_created(&self) -> usize {
        self.lock().answers_created
    }

    pub fn offers_created(&self) -> usize {
        self.lock().offers_created
    }

    /// Remote candidates in the order they were applied.
    pub fn applied_remote_candidates(&self) -> Vec<IceCandidate> {
        self.lock().remote_candidates.clone()
    }

    pub fn connection_state(&self) -> Option<PeerConnectionState> {
        self.lock().connection
    }

    pub fn sender_count(&self) -> usize {
        self.lock().senders.len()
    }

    fn build_sdp(&self, inner: &PcInner, version: usize) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=ice-ufrag:{}\r\n",
            self.session_id, version, self.ufrag
        );
        for (mid, sender) in inner.senders.iter().enumerate() {
            sdp.push_str(&format!(
                "m={} 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:{}\r\n",
                sender.kind.as_str(),
                mid
            ));
        }
        sdp
    }

    fn emit(inner: &PcInner, event: PeerEvent) {
        if let Some(tx) = &inner.events {
            let _ = tx.send(event);
        }
    }

    fn gather(&self, inner: &mut PcInner) {
        if inner.gathered {
            return;
        }
        inner.gathered = true;
        for n in 0..self.candidates_per_gathering {
            let candidate = IceCandidate::new(format!(
                "candidate:{} 1 udp {} 192.0.2.{} {} typ host",
                n + 1,
                2_130_706_431u32 - n as u32,
                (self.session_id % 200) + 1,
                50_000 + n
            ))
            .with_sdp_mid("0")
            .with_sdp_m_line_index(0)
            .with_username_fragment(self.ufrag.clone());
            Self::emit(inner, PeerEvent::IceCandidate(candidate));
        }
    }

    fn maybe_connect(&self, inner: &mut PcInner) {
        let ready = inner.signaling == SignalingState::Stable
            && inner.local.is_some()
            && inner.remote.is_some()
            && !inner.remote_candidates.is_empty();
        if !ready || inner.connection.is_some() {
            return;
        }
        inner.connection = Some(PeerConnectionState::Connecting);
        Self::emit(
            inner,
            PeerEvent::ConnectionStateChanged(PeerConnectionState::Connecting),
        );
        let outcome = match self.behavior {
            ConnectBehavior::Connect => PeerConnectionState::Connected,
            ConnectBehavior::Fail => PeerConnectionState::Failed,
            ConnectBehavior::Stall => return,
        };
        inner.connection = Some(outcome);
        Self::emit(inner, PeerEvent::ConnectionStateChanged(outcome));
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, anyhow::Error> {
        let mut inner = self.lock();
        if !matches!(
            inner.signaling,
            SignalingState::Stable | SignalingState::HaveLocalOffer
        ) {
            anyhow::bail!("createOffer in state {}", inner.signaling);
        }
        inner.offers_created += 1;
        let version = inner.offers_created + inner.answers_created;
        Ok(SessionDescription::offer(self.build_sdp(&inner, version)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, anyhow::Error> {
        let mut inner = self.lock();
        if inner.signaling != SignalingState::HaveRemoteOffer {
            anyhow::bail!("createAnswer in state {}", inner.signaling);
        }
        inner.answers_created += 1;
        let version = inner.offers_created + inner.answers_created;
        Ok(SessionDescription::answer(self.build_sdp(&inner, version)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), anyhow::Error> {
        let mut inner = self.lock();
        inner.signaling = match (inner.signaling, desc.sdp_type) {
            (SignalingState::Stable | SignalingState::HaveLocalOffer, SdpType::Offer) => {
                SignalingState::HaveLocalOffer
            }
            (SignalingState::HaveRemoteOffer, SdpType::Answer) => SignalingState::Stable,
            (state, kind) => anyhow::bail!("setLocalDescription({:?}) in state {}", kind, state),
        };
        inner.local = Some(desc);
        self.gather(&mut inner);
        self.maybe_connect(&mut inner);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), anyhow::Error> {
        let mut inner = self.lock();
        inner.signaling = match (inner.signaling, desc.sdp_type) {
            (SignalingState::Stable | SignalingState::HaveLocalOffer, SdpType::Offer) => {
                SignalingState::HaveRemoteOffer
            }
            (SignalingState::HaveLocalOffer, SdpType::Answer) => SignalingState::Stable,
            (state, kind) => anyhow::bail!("setRemoteDescription({:?}) in state {}", kind, state),
        };
        inner.remote = Some(desc);
        self.maybe_connect(&mut inner);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), anyhow::Error> {
        let mut inner = self.lock();
        if inner.signaling.is_closed() {
            anyhow::bail!("addIceCandidate on closed connection");
        }
        if inner.remote.is_none() {
            anyhow::bail!("addIceCandidate before remote description");
        }
        inner.remote_candidates.push(candidate);
        self.maybe_connect(&mut inner);
        Ok(())
    }

    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), anyhow::Error> {
        let mut inner = self.lock();
        if inner.signaling.is_closed() {
            anyhow::bail!("addTrack on closed connection");
        }
        inner.senders.push(Arc::new(LoopbackSender {
            kind: track.kind(),
            track: Mutex::new(Some(track)),
        }));
        Ok(())
    }

    async fn senders(&self) -> Vec<Arc<dyn RtpSender>> {
        self.lock()
            .senders
            .iter()
            .map(|s| s.clone() as Arc<dyn RtpSender>)
            .collect()
    }

    fn signaling_state(&self) -> SignalingState {
        self.lock().signaling
    }

    fn detach_handlers(&self) {
        self.lock().events = None;
    }

    async fn close(&self) {
        let mut inner = self.lock();
        inner.signaling = SignalingState::Closed;
        inner.connection = Some(PeerConnectionState::Closed);
        Self::emit(
            &inner,
            PeerEvent::ConnectionStateChanged(PeerConnectionState::Closed),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn new_pc(factory: &LoopbackPeerFactory) -> (Arc<dyn PeerConnection>, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pc = factory
            .create(&RtcConfiguration::default(), tx)
            .await
            .unwrap();
        (pc, rx)
    }

    #[test]
    fn test_oversized_media_delay_saturates() {
        let devices = LoopbackMediaDevices::new().with_delay(Duration::MAX);
        assert_eq!(devices.delay_ms.load(Ordering::SeqCst), u64::MAX);
    }

    #[tokio::test]
    async fn test_answer_before_offer_is_rejected() {
        let factory = LoopbackPeerFactory::new();
        let (pc, _rx) = new_pc(&factory).await;
        let err = pc
            .set_remote_description(SessionDescription::answer("v=0"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("stable"));
    }

    #[tokio::test]
    async fn test_candidates_gathered_after_local_description() {
        let factory = LoopbackPeerFactory::new().with_candidates(3);
        let (pc, mut rx) = new_pc(&factory).await;

        let offer = pc.create_offer().await.unwrap();
        assert!(rx.try_recv().is_err());
        pc.set_local_description(offer).await.unwrap();

        let mut gathered = 0;
        while let Ok(PeerEvent::IceCandidate(_)) = rx.try_recv() {
            gathered += 1;
        }
        assert_eq!(gathered, 3);
    }

    #[tokio::test]
    async fn test_candidate_before_remote_description_is_rejected() {
        let factory = LoopbackPeerFactory::new();
        let (pc, _rx) = new_pc(&factory).await;
        assert!(
            pc.add_ice_candidate(IceCandidate::new("candidate:1"))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_detached_handlers_stay_silent_on_close() {
        let factory = LoopbackPeerFactory::new();
        let (pc, mut rx) = new_pc(&factory).await;
        pc.detach_handlers();
        pc.close().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(pc.signaling_state(), SignalingState::Closed);
    }
}

use callcore::{CallRole, CallState, ConversationId, EndReason, MediaQuality};
use creator_call::calls::CallCoordinator;
use creator_call::channel::{ChannelStatus, InMemoryHub};
use creator_call::config::CallConfig;
use creator_call::error::CallError;
use creator_call::events::NoticeKind;
use creator_call::loopback::{ConnectBehavior, LoopbackMediaDevices, LoopbackPeerFactory};
use futures_util::future::join;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const CONVERSATION: &str = "dm-alice-bob";

struct Participant {
    coordinator: Arc<CallCoordinator>,
    devices: Arc<LoopbackMediaDevices>,
    peers: Arc<LoopbackPeerFactory>,
    _listener: JoinHandle<()>,
}

fn participant_with(
    hub: &InMemoryHub,
    id: &str,
    config: CallConfig,
    devices: LoopbackMediaDevices,
    peers: LoopbackPeerFactory,
) -> Participant {
    let devices = Arc::new(devices);
    let peers = Arc::new(peers);
    let coordinator = CallCoordinator::new(
        id,
        CONVERSATION,
        config,
        Arc::new(hub.client(id)),
        devices.clone(),
        peers.clone(),
    );
    let listener = coordinator.listen();
    Participant {
        coordinator,
        devices,
        peers,
        _listener: listener,
    }
}

fn participant(hub: &InMemoryHub, id: &str) -> Participant {
    participant_with(
        hub,
        id,
        CallConfig::default(),
        LoopbackMediaDevices::new(),
        LoopbackPeerFactory::new(),
    )
}

async fn wait_for_state(
    coordinator: &CallCoordinator,
    check: impl Fn(&CallState) -> bool,
) -> CallState {
    for _ in 0..1000 {
        let state = coordinator.state().await;
        if check(&state) {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "{}: state never matched, still {:?}",
        coordinator.local_id(),
        coordinator.state().await
    );
}

async fn wait_until(what: &str, check: impl Fn() -> bool) {
    for _ in 0..1000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Alice calls, Bob accepts, both reach active.
async fn connect(alice: &Participant, bob: &Participant) {
    let mut incoming = bob.coordinator.events().incoming_call.subscribe();
    alice.coordinator.start_call().await.unwrap();
    incoming.recv().await.unwrap();
    bob.coordinator.gate().accept().await.unwrap();

    wait_for_state(&alice.coordinator, CallState::is_active).await;
    wait_for_state(&bob.coordinator, CallState::is_active).await;
}

fn sent_texts(hub: &InMemoryHub, prefix: &str) -> usize {
    hub.history(&ConversationId::new(CONVERSATION))
        .iter()
        .filter(|m| m.text.starts_with(prefix))
        .count()
}

#[tokio::test]
async fn test_full_call_connects_both_sides_once() {
    let _ = env_logger::builder().is_test(true).try_init();
    let hub = InMemoryHub::new();
    let alice = participant(&hub, "alice");
    let bob = participant(&hub, "bob");
    let mut alice_states = alice.coordinator.events().state_changed.subscribe();
    let mut bob_states = bob.coordinator.events().state_changed.subscribe();

    connect(&alice, &bob).await;

    assert_eq!(alice.coordinator.pending_ice_candidates().await, 0);
    assert_eq!(bob.coordinator.pending_ice_candidates().await, 0);

    let alice_snapshot = alice.coordinator.snapshot().await;
    assert_eq!(alice_snapshot.local_role, Some(CallRole::Initiator));
    assert!(alice_snapshot.is_video_enabled);
    let bob_snapshot = bob.coordinator.snapshot().await;
    assert_eq!(bob_snapshot.local_role, Some(CallRole::Receiver));
    assert_eq!(bob_snapshot.remote_participant.unwrap().as_str(), "alice");

    for states in [&mut alice_states, &mut bob_states] {
        let mut activations = 0;
        while let Ok(change) = states.try_recv() {
            if change.state.is_active() {
                activations += 1;
            }
        }
        assert_eq!(activations, 1);
    }
    assert_eq!(sent_texts(&hub, "VIDEO_CALL_OFFER:"), 1);
    assert_eq!(sent_texts(&hub, "VIDEO_CALL_ANSWER:"), 1);
}

#[tokio::test]
async fn test_decline_never_creates_connection_on_callee() {
    let hub = InMemoryHub::new();
    let alice = participant(&hub, "alice");
    let bob = participant(&hub, "bob");
    let mut incoming = bob.coordinator.events().incoming_call.subscribe();
    let mut alice_notices = alice.coordinator.events().notice.subscribe();

    alice.coordinator.start_call().await.unwrap();
    incoming.recv().await.unwrap();
    let gate = bob.coordinator.gate();
    assert!(gate.is_visible().await);
    gate.decline().await.unwrap();

    let alice_state = wait_for_state(&alice.coordinator, CallState::is_ended).await;
    assert_eq!(alice_state.end_reason(), Some(EndReason::RemoteDeclined));
    assert_eq!(
        bob.coordinator.state().await.end_reason(),
        Some(EndReason::LocalDeclined)
    );
    assert!(!gate.is_visible().await);

    assert_eq!(bob.peers.created_count(), 0);
    assert_eq!(bob.devices.request_count(), 0);
    wait_until("alice to release media", || alice.devices.live_track_count() == 0).await;

    let notice = alice_notices.recv().await.unwrap();
    assert_eq!(notice.kind, NoticeKind::Info);
    assert_eq!(sent_texts(&hub, "VIDEO_CALL_DECLINED"), 1);
}

#[tokio::test]
async fn test_end_while_active_releases_everything() {
    let hub = InMemoryHub::new();
    let alice = participant(&hub, "alice");
    let bob = participant(&hub, "bob");
    connect(&alice, &bob).await;

    alice.coordinator.end_call().await.unwrap();

    let alice_state = alice.coordinator.state().await;
    assert_eq!(alice_state.end_reason(), Some(EndReason::LocalEnded));
    let bob_state = wait_for_state(&bob.coordinator, CallState::is_ended).await;
    assert_eq!(bob_state.end_reason(), Some(EndReason::RemoteEnded));
    assert!(matches!(
        bob_state,
        CallState::Ended {
            duration_secs: Some(_),
            ..
        }
    ));

    wait_until("alice to release media", || alice.devices.live_track_count() == 0).await;
    wait_until("bob to release media", || bob.devices.live_track_count() == 0).await;
    assert!(!alice.coordinator.has_connection().await);
    assert!(!bob.coordinator.has_connection().await);

    // a new call may start from ended
    alice.coordinator.start_call().await.unwrap();
    assert_eq!(
        alice.coordinator.session_id().await.unwrap().as_str(),
        "dm-alice-bob#2"
    );
    wait_for_state(&bob.coordinator, CallState::is_incoming_ringing).await;
}

#[tokio::test]
async fn test_video_denied_continues_audio_only() {
    let hub = InMemoryHub::new();
    let alice = participant_with(
        &hub,
        "alice",
        CallConfig::default(),
        LoopbackMediaDevices::new().deny_video(),
        LoopbackPeerFactory::new(),
    );
    let bob = participant(&hub, "bob");
    let mut alice_notices = alice.coordinator.events().notice.subscribe();

    connect(&alice, &bob).await;

    let snapshot = alice.coordinator.snapshot().await;
    assert!(!snapshot.is_video_enabled);
    assert_eq!(sent_texts(&hub, "VIDEO_CALL_OFFER:"), 1);
    assert_eq!(alice.devices.live_track_count(), 1);

    let notice = alice_notices.recv().await.unwrap();
    assert_eq!(notice.kind, NoticeKind::Warning);

    assert!(bob.coordinator.snapshot().await.is_video_enabled);
}

#[tokio::test]
async fn test_duplicate_delivery_answers_once() {
    let hub = InMemoryHub::new();
    hub.set_duplicate_delivery(true);
    let alice = participant(&hub, "alice");
    let bob = participant(&hub, "bob");

    connect(&alice, &bob).await;

    let bob_pc = bob.peers.connection(0).unwrap();
    assert_eq!(bob_pc.answers_created(), 1);
    assert_eq!(bob.peers.created_count(), 1);
    assert_eq!(alice.peers.created_count(), 1);
    assert_eq!(sent_texts(&hub, "VIDEO_CALL_ANSWER:"), 1);
    assert_eq!(bob.coordinator.pending_ice_candidates().await, 0);
}

#[tokio::test]
async fn test_double_end_sends_one_end() {
    let hub = InMemoryHub::new();
    let alice = participant(&hub, "alice");
    let bob = participant(&hub, "bob");
    connect(&alice, &bob).await;

    alice.coordinator.end_call().await.unwrap();
    alice.coordinator.end_call().await.unwrap();
    wait_for_state(&bob.coordinator, CallState::is_ended).await;
    bob.coordinator.end_call().await.unwrap();

    assert_eq!(sent_texts(&hub, "VIDEO_CALL_END"), 1);
}

#[tokio::test]
async fn test_early_candidates_survive_until_accept() {
    let hub = InMemoryHub::new();
    let alice = participant(&hub, "alice");
    let bob = participant(&hub, "bob");
    let mut incoming = bob.coordinator.events().incoming_call.subscribe();

    alice.coordinator.start_call().await.unwrap();
    incoming.recv().await.unwrap();
    wait_until("alice's candidates to be sent", || {
        sent_texts(&hub, "VIDEO_CALL_ICE:") == 2
    })
    .await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(bob.coordinator.pending_ice_candidates().await, 2);

    bob.coordinator.accept_call().await.unwrap();
    wait_for_state(&bob.coordinator, CallState::is_active).await;

    let applied = bob.peers.connection(0).unwrap().applied_remote_candidates();
    assert_eq!(applied.len(), 2);
    assert!(applied[0].candidate.starts_with("candidate:1 "));
    assert!(applied[1].candidate.starts_with("candidate:2 "));
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout_ends_stalled_call() {
    let hub = InMemoryHub::new();
    let config = CallConfig {
        connect_timeout_secs: Some(5),
        ..CallConfig::default()
    };
    let alice = participant_with(
        &hub,
        "alice",
        config.clone(),
        LoopbackMediaDevices::new(),
        LoopbackPeerFactory::new().with_behavior(ConnectBehavior::Stall),
    );
    let bob = participant_with(
        &hub,
        "bob",
        config,
        LoopbackMediaDevices::new(),
        LoopbackPeerFactory::new(),
    );
    let mut alice_notices = alice.coordinator.events().notice.subscribe();
    let mut incoming = bob.coordinator.events().incoming_call.subscribe();

    alice.coordinator.start_call().await.unwrap();
    incoming.recv().await.unwrap();
    bob.coordinator.accept_call().await.unwrap();

    wait_for_state(&alice.coordinator, CallState::is_connecting).await;
    let alice_state = wait_for_state(&alice.coordinator, CallState::is_ended).await;
    assert_eq!(alice_state.end_reason(), Some(EndReason::ConnectTimeout));

    let bob_state = wait_for_state(&bob.coordinator, CallState::is_ended).await;
    assert_eq!(bob_state.end_reason(), Some(EndReason::RemoteEnded));

    let mut saw_error = false;
    while let Ok(notice) = alice_notices.try_recv() {
        saw_error |= notice.kind == NoticeKind::Error;
    }
    assert!(saw_error);
}

#[tokio::test]
async fn test_connection_failure_ends_call() {
    let hub = InMemoryHub::new();
    let alice = participant(&hub, "alice");
    let bob = participant_with(
        &hub,
        "bob",
        CallConfig::default(),
        LoopbackMediaDevices::new(),
        LoopbackPeerFactory::new().with_behavior(ConnectBehavior::Fail),
    );
    let mut incoming = bob.coordinator.events().incoming_call.subscribe();

    alice.coordinator.start_call().await.unwrap();
    incoming.recv().await.unwrap();
    bob.coordinator.accept_call().await.unwrap();

    let bob_state = wait_for_state(&bob.coordinator, CallState::is_ended).await;
    assert_eq!(bob_state.end_reason(), Some(EndReason::ConnectionFailed));
    wait_until("bob to release media", || bob.devices.live_track_count() == 0).await;
    wait_for_state(&alice.coordinator, CallState::is_ended).await;
}

#[tokio::test]
async fn test_channel_error_keeps_active_call_but_blocks_new_one() {
    let hub = InMemoryHub::new();
    let conversation = ConversationId::new(CONVERSATION);
    let alice = participant(&hub, "alice");
    let bob = participant(&hub, "bob");
    connect(&alice, &bob).await;
    let mut alice_notices = alice.coordinator.events().notice.subscribe();

    hub.set_status(&conversation, ChannelStatus::Error);
    wait_until("alice to see the outage", || {
        !alice.coordinator.is_channel_available()
    })
    .await;

    assert!(alice.coordinator.state().await.is_active());
    assert!(bob.coordinator.state().await.is_active());
    assert_eq!(
        alice_notices.recv().await.unwrap().kind,
        NoticeKind::Warning
    );
    assert!(matches!(
        alice.coordinator.start_call().await,
        Err(CallError::ChannelUnavailable)
    ));

    hub.set_status(&conversation, ChannelStatus::Subscribed);
    wait_until("alice to see the channel back", || {
        alice.coordinator.is_channel_available()
    })
    .await;
    assert!(matches!(
        alice.coordinator.start_call().await,
        Err(CallError::Busy("active"))
    ));
}

#[tokio::test]
async fn test_own_offer_echo_does_not_ring() {
    let hub = InMemoryHub::new();
    let alice = participant(&hub, "alice");
    let mut incoming = alice.coordinator.events().incoming_call.subscribe();

    alice.coordinator.start_call().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(matches!(
        alice.coordinator.state().await,
        CallState::OutgoingRinging { .. }
    ));
    assert!(incoming.try_recv().is_err());
}

#[tokio::test]
async fn test_glare_resolves_to_one_call() {
    let hub = InMemoryHub::new();
    let alice = participant(&hub, "alice");
    let bob = participant(&hub, "bob");

    let (a, b) = join(
        alice.coordinator.start_call(),
        bob.coordinator.start_call(),
    )
    .await;
    a.unwrap();
    b.unwrap();

    wait_for_state(&alice.coordinator, CallState::is_active).await;
    wait_for_state(&bob.coordinator, CallState::is_active).await;

    // the greater id yields and answers
    assert_eq!(
        bob.coordinator.snapshot().await.local_role,
        Some(CallRole::Receiver)
    );
    assert_eq!(
        alice.coordinator.snapshot().await.local_role,
        Some(CallRole::Initiator)
    );
    assert_eq!(bob.peers.connection(0).unwrap().answers_created(), 1);
    assert_eq!(alice.peers.connection(0).unwrap().answers_created(), 0);
    assert_eq!(alice.peers.created_count(), 1);
    assert_eq!(bob.peers.created_count(), 1);
}

#[tokio::test]
async fn test_camera_switch_exhaustion_degrades_then_recovers() {
    let hub = InMemoryHub::new();
    let config = CallConfig {
        camera_switch_attempts: 3,
        camera_retry_backoff_ms: 1,
        ..CallConfig::default()
    };
    let alice = participant_with(
        &hub,
        "alice",
        config,
        LoopbackMediaDevices::new(),
        LoopbackPeerFactory::new(),
    );
    let bob = participant(&hub, "bob");
    connect(&alice, &bob).await;
    let mut alice_notices = alice.coordinator.events().notice.subscribe();

    alice.devices.set_busy_video_requests(10);
    alice.coordinator.switch_camera().await.unwrap();

    let state = alice.coordinator.state().await;
    assert_eq!(state.media_quality(), Some(MediaQuality::Degraded));
    let snapshot = alice.coordinator.snapshot().await;
    assert!(!snapshot.is_video_enabled);
    assert!(snapshot.is_front_camera);
    assert_eq!(
        alice_notices.recv().await.unwrap().kind,
        NoticeKind::Warning
    );

    alice.devices.set_busy_video_requests(0);
    alice.coordinator.switch_camera().await.unwrap();

    let state = alice.coordinator.state().await;
    assert_eq!(state.media_quality(), Some(MediaQuality::Full));
    let snapshot = alice.coordinator.snapshot().await;
    assert!(snapshot.is_video_enabled);
    assert!(!snapshot.is_front_camera);
    assert!(bob.coordinator.state().await.is_active());
}

#[tokio::test]
async fn test_end_during_media_acquisition_releases_late_stream() {
    let hub = InMemoryHub::new();
    let alice = participant(&hub, "alice");
    let bob = participant_with(
        &hub,
        "bob",
        CallConfig::default(),
        LoopbackMediaDevices::new().with_delay(Duration::from_millis(100)),
        LoopbackPeerFactory::new(),
    );
    let mut incoming = bob.coordinator.events().incoming_call.subscribe();

    alice.coordinator.start_call().await.unwrap();
    incoming.recv().await.unwrap();

    let accepting = {
        let coordinator = bob.coordinator.clone();
        tokio::spawn(async move { coordinator.accept_call().await })
    };
    wait_until("bob to request media", || bob.devices.request_count() == 1).await;
    bob.coordinator.end_call().await.unwrap();
    accepting.await.unwrap().unwrap();

    assert_eq!(
        bob.coordinator.state().await.end_reason(),
        Some(EndReason::LocalEnded)
    );
    wait_until("bob's late stream to be stopped", || {
        bob.devices.live_track_count() == 0
    })
    .await;
    let alice_state = wait_for_state(&alice.coordinator, CallState::is_ended).await;
    assert_eq!(alice_state.end_reason(), Some(EndReason::RemoteEnded));
}

#[tokio::test]
async fn test_mute_and_camera_toggle_follow_session() {
    let hub = InMemoryHub::new();
    let alice = participant(&hub, "alice");
    let bob = participant(&hub, "bob");
    assert!(matches!(
        alice.coordinator.set_muted(true).await,
        Err(CallError::NoConnection)
    ));
    connect(&alice, &bob).await;

    alice.coordinator.set_muted(true).await.unwrap();
    alice.coordinator.set_video_enabled(false).await.unwrap();
    let snapshot = alice.coordinator.snapshot().await;
    assert!(snapshot.is_muted);
    assert!(!snapshot.is_video_enabled);

    alice.coordinator.end_call().await.unwrap();
    let snapshot = alice.coordinator.snapshot().await;
    assert!(!snapshot.is_muted);
    assert!(snapshot.session_id.is_none());
}

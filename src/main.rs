use callcore::CallState;
use chrono::Local;
use clap::{Parser, ValueEnum};
use creator_call::calls::CallCoordinator;
use creator_call::channel::InMemoryHub;
use creator_call::config::CallConfig;
use creator_call::loopback::{LoopbackMediaDevices, LoopbackPeerFactory};
use futures_util::future::join;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

// Runs a simulated call between two participants over an in-process channel.
//
// Usage:
//   cargo run                                   # alice calls bob, bob accepts
//   cargo run -- decline                        # bob declines
//   cargo run -- video-denied                   # bob has no camera permission
//   cargo run -- glare                          # both call at the same time
//   cargo run -- --duplicate-delivery call      # every message delivered twice

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    Call,
    Decline,
    VideoDenied,
    Glare,
}

#[derive(Debug, Parser)]
#[command(name = "creator-call", about = "Simulated one-to-one video call")]
struct Cli {
    #[arg(value_enum, default_value_t = Scenario::Call)]
    scenario: Scenario,

    /// JSON call configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    log_level: String,

    /// Deliver every channel message twice
    #[arg(long)]
    duplicate_delivery: bool,

    /// Seconds to stay in the call before hanging up
    #[arg(long, default_value_t = 1)]
    hold_secs: u64,
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<(), anyhow::Error> {
    let config = match &cli.config {
        Some(path) => CallConfig::load(path)?,
        None => CallConfig::default(),
    };
    if !config.has_turn() {
        info!("No TURN server configured; peers behind symmetric NAT will not connect");
    }

    let hub = InMemoryHub::new();
    hub.set_duplicate_delivery(cli.duplicate_delivery);

    let bob_devices = match cli.scenario {
        Scenario::VideoDenied => LoopbackMediaDevices::new().deny_video(),
        _ => LoopbackMediaDevices::new(),
    };
    let alice = participant(&hub, "alice", &config, LoopbackMediaDevices::new());
    let bob = participant(&hub, "bob", &config, bob_devices);
    let _alice_channel = alice.listen();
    let _bob_channel = bob.listen();
    log_events(&alice);
    log_events(&bob);

    if cli.scenario == Scenario::Glare {
        let (a, b) = join(alice.start_call(), bob.start_call()).await;
        a?;
        b?;
    } else {
        let mut incoming = bob.events().incoming_call.subscribe();
        alice.start_call().await?;
        let call = incoming.recv().await?;
        info!("bob: {} is calling ({})", call.from, call.session_id);

        let gate = bob.gate();
        if cli.scenario == Scenario::Decline {
            gate.decline().await?;
        } else {
            gate.accept().await?;
        }
    }

    let settle = config.connect_timeout().unwrap_or(Duration::from_secs(10));
    let state = wait_settled(&alice, settle).await;
    if state.is_active() {
        tokio::time::sleep(Duration::from_secs(cli.hold_secs)).await;
        alice.end_call().await?;
        wait_settled(&bob, settle).await;
    } else {
        warn!("alice: call did not connect ({})", state.name());
    }

    for coordinator in [&alice, &bob] {
        let snapshot = coordinator.snapshot().await;
        println!(
            "{}: {}",
            coordinator.local_id(),
            serde_json::to_string_pretty(&snapshot)?
        );
    }
    Ok(())
}

fn participant(
    hub: &InMemoryHub,
    id: &str,
    config: &CallConfig,
    devices: LoopbackMediaDevices,
) -> Arc<CallCoordinator> {
    CallCoordinator::new(
        id,
        "demo-dm",
        config.clone(),
        Arc::new(hub.client(id)),
        Arc::new(devices),
        Arc::new(LoopbackPeerFactory::new()),
    )
}

fn log_events(coordinator: &Arc<CallCoordinator>) {
    let who = coordinator.local_id().clone();
    let mut states = coordinator.events().state_changed.subscribe();
    let mut notices = coordinator.events().notice.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Ok(change) = states.recv() => {
                    info!("{}: {} -> {}", who, change.from, change.state.name());
                }
                Ok(notice) = notices.recv() => {
                    info!("{}: [{:?}] {}", who, notice.kind, notice.message);
                }
                else => break,
            }
        }
    });
}

/// Wait until the call is active or over, or `limit` passes.
async fn wait_settled(coordinator: &CallCoordinator, limit: Duration) -> CallState {
    let deadline = Instant::now() + limit;
    loop {
        let state = coordinator.state().await;
        if state.is_active() || state.is_ended() || Instant::now() >= deadline {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

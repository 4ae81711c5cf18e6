//! Call configuration: ICE servers, timeouts and camera retry policy.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// A STUN or TURN server handed to the native peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

/// Configuration for a call coordinator.
///
/// No TURN server is configured by default, so two peers that are both
/// behind symmetric NAT cannot connect unless one is added here.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub ice_servers: Vec<IceServer>,
    /// How long `connecting` may last before the call is failed.
    /// `None` waits forever.
    pub connect_timeout_secs: Option<u64>,
    /// Attempts at acquiring the new camera during a camera switch.
    pub camera_switch_attempts: u32,
    /// Pause between camera switch attempts.
    pub camera_retry_backoff_ms: u64,
    /// Capacity of the call event broadcast channel.
    pub event_capacity: usize,
    /// Chat-visible text posted when a call starts.
    pub call_marker_text: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                IceServer::stun("stun:stun.l.google.com:19302"),
                IceServer::stun("stun:stun1.l.google.com:19302"),
            ],
            connect_timeout_secs: Some(30),
            camera_switch_attempts: 3,
            camera_retry_backoff_ms: 250,
            event_capacity: 100,
            call_marker_text: "📹 Started a video call".to_string(),
        }
    }
}

impl CallConfig {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(Self::from_json_str(&raw)?)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }

    pub fn camera_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.camera_retry_backoff_ms)
    }

    pub fn has_turn(&self) -> bool {
        self.ice_servers.iter().any(IceServer::is_turn)
    }
}

use serde::{Deserialize, Serialize};

use crate::negotiation::Role;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Negotiation role of this peer
    pub role: Role,
    /// Side channel settings
    pub signaling: SignalingConfig,
    /// Transport engine settings
    pub webrtc: WebRtcConfig,
    /// Frame dispatch settings
    pub dispatch: DispatchConfig,
    /// Latency probe settings
    pub probe: ProbeConfig,
    /// Synthetic video source / analyzer geometry
    pub synthetic: SyntheticConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            role: Role::Answerer,
            signaling: SignalingConfig::default(),
            webrtc: WebRtcConfig::default(),
            dispatch: DispatchConfig::default(),
            probe: ProbeConfig::default(),
            synthetic: SyntheticConfig::default(),
        }
    }
}

/// Message framing on the signaling stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// One JSON object per `\n`-terminated line
    #[default]
    Lines,
    /// Variable-length header followed by the JSON body
    LengthPrefixed,
}

/// Signaling channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Host to listen on or connect to
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Upper bound for establishing the stream (ms)
    pub connect_timeout_ms: u64,
    /// Delay between connection attempts on the connecting side (ms)
    pub retry_interval_ms: u64,
    /// Wire framing
    pub framing: Framing,
    /// Largest accepted message body in bytes
    pub max_message_bytes: usize,
    /// Whether this peer listens. `None` means the offerer listens.
    pub listen: Option<bool>,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1234,
            connect_timeout_ms: 10_000,
            retry_interval_ms: 200,
            framing: Framing::Lines,
            max_message_bytes: 1024 * 1024,
            listen: None,
        }
    }
}

impl SignalingConfig {
    /// Resolve whether the given role listens or connects
    pub fn listens(&self, role: Role) -> bool {
        self.listen.unwrap_or(role == Role::Offerer)
    }
}

/// WebRTC engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// Send local candidates as separate signaling messages instead of
    /// waiting for gathering to finish
    pub trickle_ice: bool,
    /// ICE gathering wait when not trickling (ms)
    pub gathering_timeout_ms: u64,
    /// Data channel label used by the latency probe
    pub probe_label: String,
    /// Publish the synthetic video track when offering
    pub publish_synthetic: bool,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            // Host candidates are enough for the loopback setup
            stun_servers: vec![],
            trickle_ice: false,
            gathering_timeout_ms: 5000,
            probe_label: "probe".to_string(),
            publish_synthetic: true,
        }
    }
}

/// Frame dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Upper bound for one analysis request (ms)
    pub analysis_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            analysis_timeout_ms: 500,
        }
    }
}

/// Latency probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Ping period (ms)
    pub interval_ms: u64,
    /// Whether this peer issues pings. `None` means the offerer issues.
    pub issue: Option<bool>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            issue: None,
        }
    }
}

impl ProbeConfig {
    /// Resolve whether the given role issues pings
    pub fn issues(&self, role: Role) -> bool {
        self.issue.unwrap_or(role == Role::Offerer)
    }
}

/// Synthetic bouncing-ball geometry, shared by the source and the analyzer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    /// Ball radius in pixels
    pub radius: u32,
    /// Pixels moved per frame on each axis
    pub speed: i32,
    /// Frames per second
    pub fps: u32,
    /// Luma value above which a pixel counts as part of the ball
    pub threshold: u8,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            radius: 30,
            speed: 3,
            fps: 1,
            threshold: 128,
        }
    }
}

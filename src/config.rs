//! Transport configuration
//!
//! Every section uses `#[serde(default)]`, so a partial JSON document only
//! overrides the fields it names. Durations are stored as milliseconds.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::channel::ReconnectPolicy;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub websocket: WebSocketConfig,
    pub webrtc: WebRtcConfig,
    pub audio: AudioConfig,
    pub media: MediaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Endpoint of the duplex socket (`ws://` or `wss://`)
    pub url: String,
    /// Handshake must complete within this window
    pub connect_timeout_ms: u64,
    /// Keep-alive tick period
    pub keep_alive_interval_ms: u64,
    /// Silence on the inbound side longer than this marks the channel dead
    pub keep_alive_timeout_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_interval_ms: u64,
    pub reconnect_decay: f64,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8765".to_string(),
            connect_timeout_ms: 15_000,
            keep_alive_interval_ms: 5_000,
            keep_alive_timeout_ms: 15_000,
            max_reconnect_attempts: 2,
            reconnect_interval_ms: 1_000,
            max_reconnect_interval_ms: 30_000,
            reconnect_decay: 1.5,
        }
    }
}

impl WebSocketConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_millis(self.keep_alive_timeout_ms)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            self.max_reconnect_attempts,
            Duration::from_millis(self.reconnect_interval_ms),
            Duration::from_millis(self.max_reconnect_interval_ms),
            self.reconnect_decay,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// Offer/answer endpoint (HTTP POST)
    pub offer_url: String,
    pub ice_servers: Vec<String>,
    /// Restrict the audio section to one codec (e.g. "opus")
    pub audio_codec: Option<String>,
    /// Restrict the video section to one codec (e.g. "VP8")
    pub video_codec: Option<String>,
    pub max_recovery_attempts: u32,
    /// ICE `disconnected` is given this long to heal before hard recovery
    pub disconnect_grace_ms: u64,
    /// Wait before hard recovery when soft renegotiation throws
    pub soft_failure_retry_ms: u64,
    /// How long a new peer connection gets to come up during recovery
    pub recovery_timeout_ms: u64,
    /// Label of the control data channel
    pub data_channel_label: String,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            offer_url: "http://localhost:7860/api/offer".to_string(),
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            audio_codec: None,
            video_codec: None,
            max_recovery_attempts: 3,
            disconnect_grace_ms: 5_000,
            soft_failure_retry_ms: 2_000,
            recovery_timeout_ms: 15_000,
            data_channel_label: "chat".to_string(),
        }
    }
}

impl WebRtcConfig {
    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn soft_failure_retry(&self) -> Duration {
        Duration::from_millis(self.soft_failure_retry_ms)
    }

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Minimum chunk size in bytes of mono PCM16
    pub chunk_size_bytes: usize,
    /// Sample rate sent on the wire (capture is downsampled to this)
    pub wire_sample_rate: u32,
    /// Sample rate of synthesized audio from the remote side
    pub output_sample_rate: u32,
    /// Chunks per `raw-audio-batch` message
    pub batch_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            // 100ms of 16kHz mono PCM16
            chunk_size_bytes: 3_200,
            wire_sample_rate: 16_000,
            output_sample_rate: 24_000,
            batch_size: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub enable_mic: bool,
    pub enable_cam: bool,
    pub enable_speaker: bool,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            enable_mic: true,
            enable_cam: false,
            enable_speaker: true,
        }
    }
}

impl TransportConfig {
    pub fn from_json_str(json: &str) -> Result<Self, String> {
        serde_json::from_str(json).map_err(|e| format!("Invalid transport config: {}", e))
    }
}

/// Load configuration from a JSON file, falling back to defaults
///
/// A missing file is not an error; unreadable or malformed files are logged.
pub fn load_config(path: &Path) -> TransportConfig {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<TransportConfig>(&contents) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Config: failed to parse {:?}: {}", path, e);
                TransportConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => TransportConfig::default(),
        Err(e) => {
            log::warn!("Config: failed to read {:?}: {}", path, e);
            TransportConfig::default()
        }
    }
}

/// Write configuration atomically (temp file in the same directory, then rename)
pub fn save_config(path: &Path, config: &TransportConfig) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(config).map_err(|e| format!("Serialize config: {}", e))?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp config {:?}: {}", tmp_path, e))?;

    // Windows rename refuses to replace an existing file
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing config {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp config {:?} to {:?}: {}", tmp_path, path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = TransportConfig::from_json_str(
            r#"{ "websocket": { "url": "wss://example.test/ws", "max_reconnect_attempts": 5 } }"#,
        )
        .unwrap();

        assert_eq!(config.websocket.url, "wss://example.test/ws");
        assert_eq!(config.websocket.max_reconnect_attempts, 5);
        assert_eq!(config.websocket.keep_alive_interval_ms, 5_000);
        assert_eq!(config.webrtc.max_recovery_attempts, 3);
        assert!(config.media.enable_mic);
    }

    #[test]
    fn test_reconnect_policy_from_config() {
        let config = WebSocketConfig::default();
        let policy = config.reconnect_policy();
        assert_eq!(policy.max_attempts(), 2);
        assert_eq!(policy.delay_for(0), Duration::from_millis(1_000));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("nope.json"));
        assert_eq!(config.audio.chunk_size_bytes, 3_200);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("transport.json");

        let mut config = TransportConfig::default();
        config.webrtc.audio_codec = Some("opus".to_string());
        config.audio.batch_size = 4;
        save_config(&path, &config).unwrap();

        let loaded = load_config(&path);
        assert_eq!(loaded.webrtc.audio_codec.as_deref(), Some("opus"));
        assert_eq!(loaded.audio.batch_size, 4);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_load_malformed_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();

        let config = load_config(&path);
        assert_eq!(config.websocket.max_reconnect_attempts, 2);
    }
}

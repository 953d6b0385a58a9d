//! Node configuration.
//!
//! Static configuration is layered: defaults, then an optional config file,
//! then `VIDMESH_`-prefixed environment variables. Broadcast and transcoder
//! settings that the control plane mutates at runtime live behind a single
//! mutex with copy-on-read accessors; their defaults are constants.

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::profiles::{self, VideoProfile};

pub const DEFAULT_BROADCAST_PRICE: i64 = 150;
pub const DEFAULT_TRANSCODER_FEE_CUT: u8 = 10;
pub const DEFAULT_TRANSCODER_REWARD_CUT: u8 = 10;
pub const DEFAULT_TRANSCODER_SEGMENT_PRICE: i64 = 150;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub media: MediaConfig,
    pub chain: ChainConfig,
    pub discovery: DiscoveryConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub rtmp_port: u16,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            rtmp_port: 1935,
            http_port: 8935,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://vidmesh.db?mode=rwc".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Wall-clock length of one segment, seconds.
    pub seg_length_secs: u64,
    /// How long a playlist request waits for a usable playlist, seconds.
    pub hls_wait_secs: u64,
    /// Idle limit before a subscriber is reaped, seconds.
    pub idle_limit_secs: u64,
    /// Reaper sweep frequency, seconds.
    pub unsub_freq_secs: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            seg_length_secs: 8,
            hls_wait_secs: 10,
            idle_limit_secs: 10,
            unsub_freq_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub enabled: bool,
    pub rpc_timeout_secs: u64,
    pub mined_tx_timeout_secs: u64,
    pub round_length: i64,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rpc_timeout_secs: 5,
            mined_tx_timeout_secs: 60,
            round_length: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub poll_interval_secs: u64,
    pub orch_info_timeout_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 3600,
            orch_info_timeout_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// "", "s3" or "gs".
    pub backend: String,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret: String,
}

impl Config {
    /// Load configuration: defaults < config file < environment.
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("VIDMESH")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    pub fn rtmp_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.rtmp_port)
    }

    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }
}

/// Runtime-mutable broadcast settings. The price doubles as the broadcaster
/// max price during discovery.
#[derive(Clone, Debug)]
pub struct BroadcastSettings {
    pub price: i64,
    pub profile: VideoProfile,
}

/// Runtime-mutable transcoder settings. The segment price is configuration
/// only; nothing in the node reads it back.
#[derive(Clone, Debug)]
pub struct TranscoderSettings {
    pub fee_cut: u8,
    pub reward_cut: u8,
    pub segment_price: i64,
}

struct RuntimeSettings {
    broadcast: BroadcastSettings,
    transcoder: TranscoderSettings,
}

static SETTINGS: Mutex<Option<RuntimeSettings>> = Mutex::new(None);

fn with_settings<T>(f: impl FnOnce(&mut RuntimeSettings) -> T) -> T {
    let mut guard = SETTINGS.lock();
    let settings = guard.get_or_insert_with(|| RuntimeSettings {
        broadcast: BroadcastSettings {
            price: DEFAULT_BROADCAST_PRICE,
            profile: profiles::p_240p_30fps_4_3(),
        },
        transcoder: TranscoderSettings {
            fee_cut: DEFAULT_TRANSCODER_FEE_CUT,
            reward_cut: DEFAULT_TRANSCODER_REWARD_CUT,
            segment_price: DEFAULT_TRANSCODER_SEGMENT_PRICE,
        },
    });
    f(settings)
}

pub fn broadcast_settings() -> BroadcastSettings {
    with_settings(|s| s.broadcast.clone())
}

pub fn set_broadcast_price(price: i64) {
    with_settings(|s| s.broadcast.price = price);
}

pub fn set_broadcast_profile(profile: VideoProfile) {
    with_settings(|s| s.broadcast.profile = profile);
}

pub fn transcoder_settings() -> TranscoderSettings {
    with_settings(|s| s.transcoder.clone())
}

pub fn set_transcoder_fee_cut(fee_cut: u8) {
    with_settings(|s| s.transcoder.fee_cut = fee_cut);
}

pub fn set_transcoder_reward_cut(reward_cut: u8) {
    with_settings(|s| s.transcoder.reward_cut = reward_cut);
}

pub fn set_transcoder_segment_price(price: i64) {
    with_settings(|s| s.transcoder.segment_price = price);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.rtmp_port, 1935);
        assert_eq!(config.media.seg_length_secs, 8);
        assert_eq!(config.media.idle_limit_secs, 10);
        assert_eq!(config.media.unsub_freq_secs, 5);
        assert_eq!(config.chain.round_length, 20);
        assert!(!config.database.url.is_empty());
    }

    #[test]
    fn test_addresses() {
        let config = Config::default();
        assert_eq!(config.rtmp_address(), "127.0.0.1:1935");
        assert_eq!(config.http_address(), "127.0.0.1:8935");
    }

    #[test]
    fn test_runtime_settings_roundtrip() {
        let before = broadcast_settings();
        assert!(before.price > 0);

        set_broadcast_price(before.price + 1);
        assert_eq!(broadcast_settings().price, before.price + 1);
        set_broadcast_price(before.price);

        set_transcoder_fee_cut(25);
        assert_eq!(transcoder_settings().fee_cut, 25);
        set_transcoder_fee_cut(DEFAULT_TRANSCODER_FEE_CUT);
    }
}

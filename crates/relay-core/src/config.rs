//! Configuration system for the relay.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $UDROP_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/udrop/config.toml
//!   3. ~/.config/udrop/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub network: NetworkConfig,
    pub data: DataConfig,
    pub ttl: TtlConfig,
    pub scan: ScanConfig,
    pub rtc: RtcConfig,
    pub rate_limits: RateLimitsConfig,
    pub quotas: QuotasConfig,
    pub bandwidth: BandwidthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub data_dir: PathBuf,
    /// Path to the HMAC signing secret. Auto-generated (0o600) on first run.
    pub secret_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
    pub claim_ttl_secs: u64,
    pub transfer_ttl_secs: u64,
    pub download_token_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub max_scan_bytes: u64,
    pub max_scan_duration_secs: u64,
    /// How long an in-progress scan session may sit idle before the sweeper
    /// reclaims it — independent of `max_scan_duration_secs`, which bounds
    /// the scanner call itself.
    pub scan_session_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RtcConfig {
    pub stun_urls: Vec<String>,
    pub turn_urls: Vec<String>,
    pub turn_shared_secret: Option<String>,
    pub turn_credential_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitWindow {
    pub max: u64,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitsConfig {
    pub health: RateLimitWindow,
    pub v1: RateLimitWindow,
    pub session_claim: RateLimitWindow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaPair {
    pub per_ip: u64,
    pub per_session: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotasConfig {
    pub sessions_per_day: QuotaPair,
    pub transfers_per_day: QuotaPair,
    pub bytes_per_day: QuotaPair,
    pub concurrent_transfers: QuotaPair,
    pub relay_per_day: QuotaPair,
    pub relay_concurrent: QuotaPair,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthConfig {
    pub per_transfer_bps: u64,
    pub global_bps: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            data: DataConfig::default(),
            ttl: TtlConfig::default(),
            scan: ScanConfig::default(),
            rtc: RtcConfig::default(),
            rate_limits: RateLimitsConfig::default(),
            quotas: QuotasConfig::default(),
            bandwidth: BandwidthConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8443".to_string(),
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: data_dir().join("data"),
            secret_path: data_dir().join("capability.secret"),
        }
    }
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            claim_ttl_secs: 180,    // 3 min, within the 2-5 min range
            transfer_ttl_secs: 300, // 5 min, within the 1-15 min range
            download_token_ttl_secs: 300,
            sweep_interval_secs: 30,
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_scan_bytes: 50 * 1024 * 1024,
            max_scan_duration_secs: 10,
            scan_session_ttl_secs: 300,
        }
    }
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            stun_urls: Vec::new(),
            turn_urls: Vec::new(),
            turn_shared_secret: None,
            turn_credential_ttl_secs: 300,
        }
    }
}

impl Default for RateLimitWindow {
    fn default() -> Self {
        Self {
            max: 60,
            window_secs: 60,
        }
    }
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            health: RateLimitWindow { max: 120, window_secs: 60 },
            v1: RateLimitWindow { max: 60, window_secs: 60 },
            session_claim: RateLimitWindow { max: 10, window_secs: 60 },
        }
    }
}

impl Default for QuotaPair {
    fn default() -> Self {
        Self {
            per_ip: 0,
            per_session: 0,
        }
    }
}

impl Default for QuotasConfig {
    fn default() -> Self {
        Self {
            sessions_per_day: QuotaPair { per_ip: 50, per_session: 0 },
            transfers_per_day: QuotaPair { per_ip: 200, per_session: 20 },
            bytes_per_day: QuotaPair { per_ip: 10 * 1024 * 1024 * 1024, per_session: 2 * 1024 * 1024 * 1024 },
            concurrent_transfers: QuotaPair { per_ip: 10, per_session: 3 },
            relay_per_day: QuotaPair { per_ip: 200, per_session: 0 },
            relay_concurrent: QuotaPair { per_ip: 5, per_session: 0 },
        }
    }
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            per_transfer_bps: 10 * 1024 * 1024,
            global_bps: 200 * 1024 * 1024,
        }
    }
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("udrop")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("udrop")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

impl RelayConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            RelayConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn file_path() -> PathBuf {
        std::env::var("UDROP_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&RelayConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("UDROP_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Ok(v) = std::env::var("UDROP_DATA__DATA_DIR") {
            self.data.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("UDROP_TTL__TRANSFER_TTL_SECS") {
            if let Ok(secs) = v.parse() {
                self.ttl.transfer_ttl_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("UDROP_RTC__TURN_SHARED_SECRET") {
            self.rtc.turn_shared_secret = Some(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ttls_are_within_spec_ranges() {
        let config = RelayConfig::default();
        assert!((120..=300).contains(&config.ttl.claim_ttl_secs));
        assert!((60..=900).contains(&config.ttl.transfer_ttl_secs));
        assert!(config.ttl.download_token_ttl_secs <= 300);
    }

    #[test]
    fn zero_quota_means_unlimited_by_convention() {
        let config = RelayConfig::default();
        // per_session defaults for sessions_per_day is 0 -> unlimited
        assert_eq!(config.quotas.sessions_per_day.per_session, 0);
    }

    #[test]
    fn write_default_if_missing_creates_file() {
        let tmp = std::env::temp_dir().join(format!("udrop-config-test-{}", std::process::id()));
        let config_path = tmp.join("config.toml");
        std::fs::create_dir_all(&tmp).unwrap();

        unsafe {
            std::env::set_var("UDROP_CONFIG", config_path.to_str().unwrap());
        }

        let path = RelayConfig::write_default_if_missing().expect("write should succeed");
        assert!(path.exists());

        let config = RelayConfig::load().expect("load should succeed");
        assert_eq!(config.scan.max_scan_bytes, 50 * 1024 * 1024);

        unsafe {
            std::env::remove_var("UDROP_CONFIG");
        }
        let _ = std::fs::remove_dir_all(&tmp);
    }
}

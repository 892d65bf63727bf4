//! Configuration loading and validation (§3 ModuleConfig, §6 Configuration).
//!
//! Recognized options are validated once at load time; invalid or
//! conflicting configuration never surfaces as a runtime error (§4.3, §7).

use crate::error::GatewayError;
use crate::types::SensorType;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct ConversionSpec {
    pub kind: String,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub signed: bool,
    #[serde(default)]
    pub clamp: Option<(f64, f64)>,
}

fn default_scale() -> f64 {
    1.0
}

const KNOWN_CONVERSION_KINDS: &[&str] = &["linear"];

#[derive(Debug, Clone, Deserialize)]
pub struct ModuleConfig {
    pub module_id: String,
    pub host: String,
    #[serde(default = "default_modbus_port")]
    pub port: u16,
    pub slave_addr: u8,
    pub function_code: u8,
    pub start_register: u16,
    pub register_count: u16,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    pub sensor_type: SensorType,
    pub channel_count: u32,
    #[serde(default)]
    pub conversion: Option<ConversionSpec>,
    #[serde(default)]
    pub is_rtc: bool,
}

fn default_modbus_port() -> u16 {
    502
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    #[serde(default)]
    pub db: i64,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_cache_pool_size")]
    pub pool_size: u32,
}

fn default_redis_port() -> u16 {
    6379
}

fn default_cache_pool_size() -> u32 {
    4
}

impl CacheConfig {
    pub fn redis_url(&self) -> String {
        match &self.password {
            Some(pw) => format!("redis://:{pw}@{}:{}/{}", self.host, self.port, self.db),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DocumentStoreConfig {
    pub uri: String,
    pub database: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectBackoffConfig {
    #[serde(default = "default_backoff_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_jitter_pct")]
    pub jitter_pct: f64,
}

fn default_backoff_initial_ms() -> u64 {
    1_000
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_jitter_pct() -> f64 {
    0.2
}

impl Default for ReconnectBackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_backoff_initial_ms(),
            max_ms: default_backoff_max_ms(),
            multiplier: default_backoff_multiplier(),
            jitter_pct: default_jitter_pct(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcquisitionConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub default_poll_interval_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub default_read_timeout_ms: u64,
    #[serde(default)]
    pub reconnect_backoff: ReconnectBackoffConfig,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_read_timeout_ms() -> u64 {
    1_000
}
fn default_failure_threshold() -> u32 {
    3
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            default_poll_interval_ms: default_poll_interval_ms(),
            default_read_timeout_ms: default_read_timeout_ms(),
            reconnect_backoff: ReconnectBackoffConfig::default(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_realtime_period_ms")]
    pub realtime_period_ms: u64,
    #[serde(default = "default_historical_period_ms")]
    pub historical_period_ms: u64,
    #[serde(default = "default_timeseries_period_ms")]
    pub timeseries_period_ms: u64,
    #[serde(default = "default_statistics_period_ms")]
    pub statistics_period_ms: u64,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_realtime_period_ms() -> u64 {
    1_000
}
fn default_historical_period_ms() -> u64 {
    5_000
}
fn default_timeseries_period_ms() -> u64 {
    2_000
}
fn default_statistics_period_ms() -> u64 {
    10_000
}
fn default_page_size() -> usize {
    200
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            realtime_period_ms: default_realtime_period_ms(),
            historical_period_ms: default_historical_period_ms(),
            timeseries_period_ms: default_timeseries_period_ms(),
            statistics_period_ms: default_statistics_period_ms(),
            page_size: default_page_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
    pub cache: CacheConfig,
    pub document_store: DocumentStoreConfig,
    #[serde(default)]
    pub session_prefix: Option<String>,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

impl Config {
    /// Load from a TOML file and validate. Never partially valid: either a
    /// fully checked `Config` or a `GatewayError::ConfigError`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, GatewayError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::ConfigError(format!("reading config file: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| GatewayError::ConfigError(format!("parsing config file: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        let mut seen = HashSet::new();
        for m in &self.modules {
            if !seen.insert(m.module_id.clone()) {
                return Err(GatewayError::ConfigError(format!(
                    "duplicate module_id: {}",
                    m.module_id
                )));
            }
            m.validate()?;
        }
        Ok(())
    }
}

impl ModuleConfig {
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.channel_count > self.register_count as u32 {
            return Err(GatewayError::ConfigError(format!(
                "module {}: channel_count ({}) exceeds register_count ({})",
                self.module_id, self.channel_count, self.register_count
            )));
        }
        if !(1..=247).contains(&self.slave_addr) {
            return Err(GatewayError::ConfigError(format!(
                "module {}: slave_addr {} out of range 1..=247",
                self.module_id, self.slave_addr
            )));
        }
        if self.function_code != 3 && self.function_code != 4 {
            return Err(GatewayError::ConfigError(format!(
                "module {}: function_code must be 3 or 4, got {}",
                self.module_id, self.function_code
            )));
        }
        if !(1..=125).contains(&self.register_count) {
            return Err(GatewayError::ConfigError(format!(
                "module {}: register_count {} out of range 1..=125",
                self.module_id, self.register_count
            )));
        }
        if let Some(conv) = &self.conversion {
            if !KNOWN_CONVERSION_KINDS.contains(&conv.kind.as_str()) {
                return Err(GatewayError::ConfigError(format!(
                    "module {}: unknown conversion kind '{}'",
                    self.module_id, conv.kind
                )));
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_module() -> ModuleConfig {
        ModuleConfig {
            module_id: "m1".into(),
            host: "127.0.0.1".into(),
            port: 502,
            slave_addr: 1,
            function_code: 4,
            start_register: 0,
            register_count: 2,
            poll_interval_ms: 1000,
            sensor_type: SensorType::Temperature,
            channel_count: 2,
            conversion: None,
            is_rtc: true,
        }
    }

    #[test]
    fn rejects_channel_count_over_register_count() {
        let mut m = base_module();
        m.channel_count = 5;
        assert!(m.validate().is_err());
    }

    #[test]
    fn rejects_bad_function_code() {
        let mut m = base_module();
        m.function_code = 6;
        assert!(m.validate().is_err());
    }

    #[test]
    fn rejects_unknown_conversion_kind() {
        let mut m = base_module();
        m.conversion = Some(ConversionSpec {
            kind: "magic".into(),
            scale: 1.0,
            offset: 0.0,
            signed: false,
            clamp: None,
        });
        assert!(m.validate().is_err());
    }

    #[test]
    fn accepts_valid_module() {
        assert!(base_module().validate().is_ok());
    }

    #[test]
    fn duplicate_module_id_rejected() {
        let cfg = Config {
            modules: vec![base_module(), base_module()],
            cache: CacheConfig {
                host: "localhost".into(),
                port: 6379,
                db: 0,
                password: None,
                pool_size: 4,
            },
            document_store: DocumentStoreConfig {
                uri: "mongodb://localhost".into(),
                database: "sensors".into(),
            },
            session_prefix: None,
            acquisition: AcquisitionConfig::default(),
            sync: SyncConfig::default(),
        };
        assert!(cfg.validate().is_err());
    }
}

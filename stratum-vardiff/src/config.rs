//! Configuration management for stratum-vardiff.
//!
//! This module handles loading and validating configuration from a TOML file
//! and environment variables. Every field has a default, so an empty (or
//! missing) file yields a usable configuration. Configuration is fixed once
//! the controller is constructed; there is no hot reload.
//!
//! ```toml
//! [vardiff]
//! target_interval = 15
//! retarget_window = 120
//! variance_percent = 30.0
//! min_difficulty = 16.0
//! max_difficulty = 1024.0
//! pool_target = 32.0
//! use_network_cap = true
//!
//! [rpc]
//! url = "http://127.0.0.1:8332"
//! user = "pool"
//! password = "secret"
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::tracing::prelude::*;
use crate::types::RetargetBounds;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_VAR: &str = "VARDIFF_CONFIG";

/// Configuration file used when `VARDIFF_CONFIG` is not set.
pub const DEFAULT_CONFIG_PATH: &str = "vardiff.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Retargeting policy
    pub vardiff: VardiffConfig,

    /// Node RPC used for the network difficulty cap
    pub rpc: RpcConfig,
}

/// Retargeting policy. All durations are in whole seconds.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct VardiffConfig {
    /// Desired average time between shares from one worker
    pub target_interval: u64,

    /// Minimum time between two retarget evaluations for one worker
    pub retarget_window: u64,

    /// Tolerated deviation from the target interval, in percent
    pub variance_percent: f64,

    pub min_difficulty: f64,
    pub max_difficulty: f64,

    /// Difficulty recorded for workers that are new or were idle
    pub pool_target: f64,

    /// Never raise a worker above the current network difficulty
    pub use_network_cap: bool,

    /// Maximum age of the cached network difficulty
    pub difficulty_refresh_interval: u64,

    /// Workers silent for longer than this start over
    pub idle_expiry: u64,

    /// How often idle workers are swept out of memory
    pub sweep_interval: u64,
}

impl Default for VardiffConfig {
    fn default() -> Self {
        Self {
            target_interval: 15,
            retarget_window: 120,
            variance_percent: 30.0,
            min_difficulty: 16.0,
            max_difficulty: 1024.0,
            pool_target: 32.0,
            use_network_cap: false,
            difficulty_refresh_interval: 86_400,
            idle_expiry: 600,
            sweep_interval: 60,
        }
    }
}

impl VardiffConfig {
    /// Target interval with the variance band applied.
    pub fn bounds(&self) -> RetargetBounds {
        RetargetBounds::new(self.target_interval as f64, self.variance_percent)
    }

    /// Number of inter-share samples kept per worker.
    ///
    /// Four samples per target interval that fits in the retarget window.
    pub fn buffer_capacity(&self) -> usize {
        let per_window = self.retarget_window / self.target_interval.max(1);
        ((per_window * 4) as usize).max(1)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval.max(1))
    }

    /// Check the policy for values that would make retargeting meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.target_interval == 0 {
            return Err(Error::Config("target_interval must be positive".into()));
        }
        if self.retarget_window < self.target_interval {
            return Err(Error::Config(format!(
                "retarget_window ({}) must be at least target_interval ({})",
                self.retarget_window, self.target_interval
            )));
        }
        if !(0.0..100.0).contains(&self.variance_percent) {
            return Err(Error::Config(format!(
                "variance_percent must be in [0, 100), got {}",
                self.variance_percent
            )));
        }
        if !self.min_difficulty.is_finite() || self.min_difficulty <= 0.0 {
            return Err(Error::Config(format!(
                "min_difficulty must be positive, got {}",
                self.min_difficulty
            )));
        }
        if !self.max_difficulty.is_finite() || self.min_difficulty > self.max_difficulty {
            return Err(Error::Config(format!(
                "min_difficulty ({}) exceeds max_difficulty ({})",
                self.min_difficulty, self.max_difficulty
            )));
        }
        if !self.pool_target.is_finite() || self.pool_target <= 0.0 {
            return Err(Error::Config(format!(
                "pool_target must be positive, got {}",
                self.pool_target
            )));
        }
        // Zero would treat every share after the first as a returning worker.
        if self.idle_expiry == 0 {
            return Err(Error::Config("idle_expiry must be positive".into()));
        }
        Ok(())
    }
}

/// Node RPC connection settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RpcConfig {
    /// JSON-RPC endpoint (http://host:port)
    pub url: String,

    pub user: Option<String>,
    pub password: Option<String>,

    /// Per-request timeout
    pub timeout_secs: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8332".to_string(),
            user: None,
            password: None,
            timeout_secs: 5,
        }
    }
}

impl RpcConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// The file named by `VARDIFF_CONFIG` (or `vardiff.toml`) is read if it
    /// exists, then `VARDIFF_*` environment variables are applied on top.
    pub fn load() -> Result<Self> {
        let path: PathBuf = std::env::var(CONFIG_PATH_VAR)
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
            .into();

        let mut config = if path.exists() {
            Self::read_file(&path)?
        } else {
            debug!(path = %path.display(), "No configuration file, using defaults");
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.vardiff.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = Self::read_file(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.vardiff.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML text without touching the environment.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.vardiff.validate()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&text)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Override fields from environment-style variables.
    ///
    /// `lookup` returns the value of a variable, if set. Unparseable values
    /// are configuration errors rather than being silently ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let v = &mut self.vardiff;
        override_parsed(&lookup, "VARDIFF_TARGET_INTERVAL", &mut v.target_interval)?;
        override_parsed(&lookup, "VARDIFF_RETARGET_WINDOW", &mut v.retarget_window)?;
        override_parsed(&lookup, "VARDIFF_VARIANCE_PERCENT", &mut v.variance_percent)?;
        override_parsed(&lookup, "VARDIFF_MIN_DIFFICULTY", &mut v.min_difficulty)?;
        override_parsed(&lookup, "VARDIFF_MAX_DIFFICULTY", &mut v.max_difficulty)?;
        override_parsed(&lookup, "VARDIFF_POOL_TARGET", &mut v.pool_target)?;
        override_parsed(&lookup, "VARDIFF_USE_NETWORK_CAP", &mut v.use_network_cap)?;
        override_parsed(
            &lookup,
            "VARDIFF_DIFFICULTY_REFRESH_INTERVAL",
            &mut v.difficulty_refresh_interval,
        )?;
        override_parsed(&lookup, "VARDIFF_IDLE_EXPIRY", &mut v.idle_expiry)?;
        override_parsed(&lookup, "VARDIFF_SWEEP_INTERVAL", &mut v.sweep_interval)?;

        let rpc = &mut self.rpc;
        if let Some(url) = lookup("VARDIFF_RPC_URL") {
            rpc.url = url;
        }
        if let Some(user) = lookup("VARDIFF_RPC_USER") {
            rpc.user = Some(user);
        }
        if let Some(password) = lookup("VARDIFF_RPC_PASSWORD") {
            rpc.password = Some(password);
        }
        override_parsed(&lookup, "VARDIFF_RPC_TIMEOUT_SECS", &mut rpc.timeout_secs)?;

        Ok(())
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, field: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = lookup(key) {
        *field = raw
            .trim()
            .parse()
            .map_err(|_| Error::Config(format!("invalid value for {}: {:?}", key, raw)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use test_case::test_case;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.vardiff.validate().unwrap();
        assert_eq!(config.vardiff.buffer_capacity(), 32);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.vardiff, VardiffConfig::default());
        assert_eq!(config.rpc, RpcConfig::default());
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml_str(
            r#"
            [vardiff]
            target_interval = 10
            retarget_window = 60
            use_network_cap = true

            [rpc]
            url = "http://node:18332"
            user = "pool"
            "#,
        )
        .unwrap();

        assert_eq!(config.vardiff.target_interval, 10);
        assert_eq!(config.vardiff.retarget_window, 60);
        assert!(config.vardiff.use_network_cap);
        assert_eq!(config.vardiff.buffer_capacity(), 24);
        // untouched fields keep their defaults
        assert_eq!(config.vardiff.pool_target, 32.0);
        assert_eq!(config.rpc.url, "http://node:18332");
        assert_eq!(config.rpc.user.as_deref(), Some("pool"));
        assert_eq!(config.rpc.password, None);
    }

    #[test]
    fn test_malformed_toml() {
        let err = Config::from_toml_str("[vardiff]\ntarget_interval = \"soon\"").unwrap_err();
        assert!(matches!(err, Error::Toml(_)));
    }

    #[test]
    fn test_buffer_capacity_rounds_down() {
        let config = VardiffConfig {
            target_interval: 15,
            retarget_window: 100,
            ..Default::default()
        };
        // 100 / 15 = 6 whole intervals
        assert_eq!(config.buffer_capacity(), 24);
    }

    #[test_case(VardiffConfig { target_interval: 0, ..Default::default() } ; "zero target interval")]
    #[test_case(VardiffConfig { retarget_window: 10, ..Default::default() } ; "window shorter than target")]
    #[test_case(VardiffConfig { variance_percent: 100.0, ..Default::default() } ; "variance too large")]
    #[test_case(VardiffConfig { variance_percent: -5.0, ..Default::default() } ; "negative variance")]
    #[test_case(VardiffConfig { min_difficulty: 0.0, ..Default::default() } ; "zero minimum")]
    #[test_case(VardiffConfig { min_difficulty: 2048.0, ..Default::default() } ; "min above max")]
    #[test_case(VardiffConfig { pool_target: 0.0, ..Default::default() } ; "zero pool target")]
    #[test_case(VardiffConfig { idle_expiry: 0, ..Default::default() } ; "zero idle expiry")]
    fn test_validate_rejects(config: VardiffConfig) {
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("VARDIFF_TARGET_INTERVAL", "20"),
            ("VARDIFF_VARIANCE_PERCENT", "25.5"),
            ("VARDIFF_USE_NETWORK_CAP", "true"),
            ("VARDIFF_RPC_URL", "http://10.0.0.2:8332"),
            ("VARDIFF_RPC_PASSWORD", "hunter2"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_env(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.vardiff.target_interval, 20);
        assert_eq!(config.vardiff.variance_percent, 25.5);
        assert!(config.vardiff.use_network_cap);
        assert_eq!(config.rpc.url, "http://10.0.0.2:8332");
        assert_eq!(config.rpc.password.as_deref(), Some("hunter2"));
        assert_eq!(config.rpc.user, None);
    }

    #[test]
    fn test_env_override_unparseable() {
        let mut config = Config::default();
        let err = config
            .apply_env(|key| (key == "VARDIFF_IDLE_EXPIRY").then(|| "ten minutes".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}

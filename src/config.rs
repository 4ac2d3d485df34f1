//! Configuration for the core: token, server settings, and the
//! snapshot/discovery defaults that govern every discovery job.

use crate::error::PercyError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// API token (required).
    pub token: String,

    /// Control-server port (default 5338).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Whether to start the ControlServer at all (default true).
    #[serde(default = "default_true")]
    pub server: bool,

    #[serde(default)]
    pub snapshot: SnapshotDefaults,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Set from `PERCY_ENABLE=0`. When false, `start()` still creates a
    /// build and the control server but never launches Chrome, and
    /// `snapshot()` is a no-op success. Lets CI wrappers run instrumented
    /// code unmodified against a percy-less environment.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Set from `PERCY_PARALLEL_NONCE`. Groups snapshots from multiple
    /// parallel CI shards into the same build. Passed through to
    /// `createBuild`.
    #[serde(default)]
    pub parallel_nonce: Option<String>,

    /// Set from `PERCY_PARALLEL_TOTAL`: total shard count for the parallel
    /// nonce above.
    #[serde(default)]
    pub parallel_total: Option<u32>,
}

fn default_port() -> u16 {
    5338
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            token: String::new(),
            port: default_port(),
            server: true,
            snapshot: SnapshotDefaults::default(),
            discovery: DiscoveryConfig::default(),
            enabled: true,
            parallel_nonce: None,
            parallel_total: None,
        }
    }
}

impl Config {
    /// Merges `PERCY_TOKEN`, `PERCY_ENABLE`, `PERCY_PARALLEL_NONCE` and
    /// `PERCY_PARALLEL_TOTAL` over an already-loaded config, mirroring the
    /// precedence file < env < CLI flag.
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(token) = std::env::var("PERCY_TOKEN") {
            if !token.is_empty() {
                self.token = token;
            }
        }
        if let Ok(enable) = std::env::var("PERCY_ENABLE") {
            self.enabled = enable != "0";
        }
        if let Ok(nonce) = std::env::var("PERCY_PARALLEL_NONCE") {
            if !nonce.is_empty() {
                self.parallel_nonce = Some(nonce);
            }
        }
        if let Ok(total) = std::env::var("PERCY_PARALLEL_TOTAL") {
            if let Ok(total) = total.parse::<u32>() {
                self.parallel_total = Some(total);
            }
        }
        self
    }

    /// Validates every config invariant. Called once, at `start()`.
    pub fn validate(&self) -> Result<(), PercyError> {
        if self.token.is_empty() {
            return Err(PercyError::ConfigValidationError(
                "token is required".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(PercyError::ConfigValidationError(
                "port must be 1-65535".to_string(),
            ));
        }
        if self.snapshot.widths.is_empty() {
            return Err(PercyError::ConfigValidationError(
                "snapshot.widths must be non-empty".to_string(),
            ));
        }
        for w in &self.snapshot.widths {
            if *w == 0 || *w > 2000 {
                return Err(PercyError::ConfigValidationError(format!(
                    "snapshot width {w} out of range 1-2000"
                )));
            }
        }
        if self.snapshot.min_height == 0 || self.snapshot.min_height > 2000 {
            return Err(PercyError::ConfigValidationError(
                "snapshot.minHeight must be 1-2000".to_string(),
            ));
        }
        if self.discovery.concurrency == 0 {
            return Err(PercyError::ConfigValidationError(
                "discovery.concurrency must be >= 1".to_string(),
            ));
        }
        // An empty-string hostname pattern matches nothing and is almost
        // certainly a misconfiguration; reject it outright.
        for pattern in self
            .discovery
            .allowed_hostnames
            .iter()
            .chain(self.discovery.disallowed_hostnames.iter())
        {
            if pattern.is_empty() {
                return Err(PercyError::ConfigValidationError(
                    "hostname glob patterns must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SnapshotDefaults {
    #[serde(default = "default_widths")]
    pub widths: Vec<u32>,

    #[serde(rename = "minHeight", default = "default_min_height")]
    pub min_height: u32,

    #[serde(rename = "percyCSS", default)]
    pub percy_css: String,
}

fn default_widths() -> Vec<u32> {
    vec![375, 1280]
}

fn default_min_height() -> u32 {
    1024
}

impl Default for SnapshotDefaults {
    fn default() -> Self {
        Self {
            widths: default_widths(),
            min_height: default_min_height(),
            percy_css: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(rename = "allowedHostnames", default)]
    pub allowed_hostnames: Vec<String>,

    #[serde(rename = "disallowedHostnames", default)]
    pub disallowed_hostnames: Vec<String>,

    #[serde(rename = "networkIdleTimeout", default = "default_network_idle_ms")]
    pub network_idle_timeout_ms: u64,

    #[serde(rename = "disableAssetCache", default)]
    pub disable_asset_cache: bool,

    #[serde(rename = "requestHeaders", default)]
    pub request_headers: HashMap<String, String>,
}

fn default_concurrency() -> usize {
    5
}

fn default_network_idle_ms() -> u64 {
    100
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            allowed_hostnames: Vec::new(),
            disallowed_hostnames: Vec::new(),
            network_idle_timeout_ms: default_network_idle_ms(),
            disable_asset_cache: false,
            request_headers: HashMap::new(),
        }
    }
}

/// Timeouts: browser launch 30s, page navigation 30s, network-idle window
/// 100ms (overridable via `discovery.networkIdleTimeout`), body fetch 5s
/// (one retry), API call 30s.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub browser_launch: std::time::Duration,
    pub navigation: std::time::Duration,
    pub body_fetch: std::time::Duration,
    pub api_call: std::time::Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            browser_launch: std::time::Duration::from_secs(30),
            navigation: std::time::Duration::from_secs(30),
            body_fetch: std::time::Duration::from_secs(5),
            api_call: std::time::Duration::from_secs(30),
        }
    }
}

/// Deterministic headless Chrome argument set: no-sandbox, disable-dev-shm,
/// headless, hide-scrollbars. One process per PercyCore, so there's no
/// per-instance user-data-dir sharding to do here, a single fixed temp dir
/// suffices and is reused across relaunches.
pub fn chrome_args(user_data_dir: &std::path::Path) -> Vec<String> {
    vec![
        "--headless=new".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--hide-scrollbars".to_string(),
        "--disable-gpu".to_string(),
        format!("--user-data-dir={}", user_data_dir.display()),
    ]
}

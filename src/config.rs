//! Configuration for the replication engine.
//!
//! Configuration is passed to [`ReplicationEngine::new()`](crate::ReplicationEngine::new)
//! and can be constructed programmatically or loaded from a JSON file with
//! [`ReplicationConfig::from_file`].
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── directory: PathBuf             # Storage root (registry, log, publications)
//! ├── hostname: String               # Public hostname used in our timestamp URIs
//! ├── keypair_path: PathBuf          # Hex Ed25519 secret seed
//! └── settings: ReplicationSettings
//!     ├── http: HttpConfig           # Timeouts, user agent, rate limit
//!     ├── schedule: ScheduleConfig   # Poll interval
//!     ├── attachments: AttachmentConfig
//!     └── verification: VerificationConfig
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "directory": "/var/lib/chronicle",
//!   "hostname": "pdc.example.org",
//!   "keypair_path": "/etc/chronicle/key",
//!   "settings": {
//!     "http": { "connect_timeout": "5s", "request_timeout": "30s", "idle_timeout": "15s" },
//!     "schedule": { "interval": "1m" }
//!   }
//! }
//! ```

use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config: passed from the binary to ReplicationEngine::new()
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `ReplicationEngine::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Storage root. Holds `peers`, `accessions` and `publications/`.
    pub directory: PathBuf,

    /// Hostname this server is reachable at. Our own receipt timestamps
    /// point at `https://{hostname}/publications/{digest}`.
    pub hostname: String,

    /// File holding the server's hex-encoded Ed25519 secret seed.
    pub keypair_path: PathBuf,

    /// Tunable parameters.
    #[serde(default)]
    pub settings: ReplicationSettings,
}

impl ReplicationConfig {
    /// Load a JSON config file and validate it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ReplicationError::storage(path, e))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| ReplicationError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.hostname.trim().is_empty() {
            return Err(ReplicationError::Config("hostname must not be empty".into()));
        }
        if self.settings.attachments.max_concurrent == 0 {
            return Err(ReplicationError::Config(
                "attachments.max_concurrent must be at least 1".into(),
            ));
        }
        for (name, value) in [
            ("http.connect_timeout", &self.settings.http.connect_timeout),
            ("http.request_timeout", &self.settings.http.request_timeout),
            ("http.idle_timeout", &self.settings.http.idle_timeout),
            ("schedule.interval", &self.settings.schedule.interval),
        ] {
            humantime::parse_duration(value).map_err(|e| {
                ReplicationError::Config(format!("{} {:?}: {}", name, value, e))
            })?;
        }
        Ok(())
    }

    /// Create a minimal config for testing, rooted at `directory`.
    pub fn for_testing(directory: impl Into<PathBuf>) -> Self {
        let directory = directory.into();
        Self {
            keypair_path: directory.join("key"),
            directory,
            hostname: "localhost".to_string(),
            settings: ReplicationSettings::default(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicationSettings
// ═══════════════════════════════════════════════════════════════════════════════

/// General settings for the replication logic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationSettings {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub attachments: AttachmentConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
}

// ═══════════════════════════════════════════════════════════════════════════════
// HttpConfig: outbound requests to peers
// ═══════════════════════════════════════════════════════════════════════════════

/// Settings for the HTTP client used to talk to peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// TCP connect timeout as a duration string (e.g., "5s").
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,

    /// How long to wait for a response's status and headers.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,

    /// Longest gap allowed between two chunks of a response body. A feed or
    /// attachment may stream for as long as it keeps making progress.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: String,

    /// `User-Agent` header sent to peers.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    // ─────────────────────────────────────────────────────────────────────────
    // Rate Limiting (shared across all peer runs)
    // ─────────────────────────────────────────────────────────────────────────

    /// Enable rate limiting of outbound requests.
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Maximum requests per second (sustained rate).
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Maximum burst size for rate limiting.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_connect_timeout() -> String {
    "10s".to_string()
}

fn default_request_timeout() -> String {
    "60s".to_string()
}

fn default_idle_timeout() -> String {
    "30s".to_string()
}

fn default_user_agent() -> String {
    concat!("chronicle-replicate/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_false() -> bool {
    false
}

fn default_true() -> bool {
    true
}

fn default_rate_limit_per_sec() -> u32 {
    50
}

fn default_rate_limit_burst() -> u32 {
    20
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            idle_timeout: default_idle_timeout(),
            user_agent: default_user_agent(),
            rate_limit_enabled: false,
            rate_limit_per_sec: 50,
            rate_limit_burst: 20,
        }
    }
}

impl HttpConfig {
    /// Parse the connect_timeout string to a Duration.
    pub fn connect_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.connect_timeout).unwrap_or(Duration::from_secs(10))
    }

    /// Parse the request_timeout string to a Duration.
    pub fn request_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.request_timeout).unwrap_or(Duration::from_secs(60))
    }

    pub fn idle_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.idle_timeout).unwrap_or(Duration::from_secs(30))
    }

    /// Create rate limit configuration from the HTTP settings.
    ///
    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<crate::resilience::RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(crate::resilience::RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ScheduleConfig: poll loop
// ═══════════════════════════════════════════════════════════════════════════════

/// How often [`run()`](crate::ReplicationEngine::run) starts a cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Delay between the end of one cycle and the start of the next.
    #[serde(default = "default_interval")]
    pub interval: String,
}

fn default_interval() -> String {
    "5m".to_string()
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
        }
    }
}

impl ScheduleConfig {
    /// Parse the interval string to a Duration.
    pub fn interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.interval).unwrap_or(Duration::from_secs(300))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// AttachmentConfig / VerificationConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Attachment download settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentConfig {
    /// Maximum attachments downloaded at once for a single accession.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_max_concurrent() -> usize {
    8
}

impl Default for AttachmentConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}

/// Extra checks on records we already hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Re-read a record that is already stored and check its digest before
    /// advancing the cursor past it.
    #[serde(default = "default_true")]
    pub recheck_known_records: bool,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            recheck_known_records: true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

//! Configuration and the key-value store it persists to.
//!
//! Uses `heapless::String` for the handful of strings the cab needs, with
//! builder methods for every section.
//!
//! # Example
//!
//! ```rust
//! use rs_knobcab::config::{Config, ConfigStore, MemoryConfigStore, ServerConfig};
//!
//! let store = MemoryConfigStore::new();
//! store.save("server_ip", "192.168.1.10").unwrap();
//! store.save("speed_steps", "8").unwrap();
//!
//! let config = Config::load_from(&store);
//! assert_eq!(config.server.host.as_str(), "192.168.1.10");
//! assert_eq!(config.throttle.steps_per_click, 8);
//! assert_eq!(config.server.withrottle_port, 12090);
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use heapless::String as HString;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Maximum length for short config strings (hostnames, names)
pub const MAX_SHORT_STRING: usize = 64;

/// Type alias for short config strings
pub type ShortString = HString<MAX_SHORT_STRING>;

/// Store key for the server host.
pub const KEY_SERVER_IP: &str = "server_ip";
/// Store key for the WiThrottle port.
pub const KEY_WT_PORT: &str = "wt_port";
/// Store key for the JSON port.
pub const KEY_JSON_PORT: &str = "json_port";
/// Store key for the power manager name.
pub const KEY_POWER_MGR: &str = "power_mgr";
/// Store key for speed steps per knob click.
pub const KEY_SPEED_STEPS: &str = "speed_steps";

/// Allowed range for speed steps per knob click.
pub const STEPS_PER_CLICK_RANGE: core::ops::RangeInclusive<u8> = 1..=20;

/// Create a ShortString from a &str, truncating at a char boundary if too long
pub fn short_string(s: &str) -> ShortString {
    let mut hs = ShortString::new();
    for c in s.chars() {
        if hs.push(c).is_err() {
            break;
        }
    }
    hs
}

// ============================================================================
// Key-value store
// ============================================================================

/// Persistent key-value storage for settings.
pub trait ConfigStore: Send + Sync {
    /// Value stored under `key`.
    fn load(&self, key: &str) -> Option<String>;

    /// Stores `value` under `key`.
    fn save(&self, key: &str, value: &str) -> Result<()>;
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryConfigStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn save(&self, key: &str, value: &str) -> Result<()> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}

/// Store backed by a flat JSON object on disk.
///
/// The file is read once on open and rewritten on every save.
#[derive(Debug)]
pub struct JsonFileConfigStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl JsonFileConfigStore {
    /// Opens `path`, starting empty if the file does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), "opened config store");
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    /// File backing this store.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for JsonFileConfigStore {
    fn load(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn save(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_owned(), value.to_owned());
        let text = serde_json::to_string_pretty(&*values)?;
        std::fs::write(&self.path, text)
            .map_err(|e| Error::Config(format!("{}: {e}", self.path.display())))
    }
}

fn load_parsed<T: core::str::FromStr>(store: &dyn ConfigStore, key: &str) -> Option<T> {
    let raw = store.load(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable config value");
            None
        }
    }
}

// ============================================================================
// Main Config
// ============================================================================

/// Complete application configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Layout server addressing
    pub server: ServerConfig,
    /// Device identification
    pub device: DeviceConfig,
    /// Throttle controller behavior
    pub throttle: ThrottleConfig,
    /// Reconnect policy
    pub reconnect: ReconnectConfig,
    /// Virtual panel web server
    pub web: WebConfig,
}

impl Config {
    /// Set server configuration
    pub fn with_server(mut self, server: ServerConfig) -> Self {
        self.server = server;
        self
    }

    /// Set device configuration
    pub fn with_device(mut self, device: DeviceConfig) -> Self {
        self.device = device;
        self
    }

    /// Set throttle configuration
    pub fn with_throttle(mut self, throttle: ThrottleConfig) -> Self {
        self.throttle = throttle;
        self
    }

    /// Set reconnect configuration
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set web configuration
    pub fn with_web(mut self, web: WebConfig) -> Self {
        self.web = web;
        self
    }

    /// Defaults overlaid with whatever `store` holds.
    pub fn load_from(store: &dyn ConfigStore) -> Self {
        let mut config = Self::default();
        if let Some(host) = store.load(KEY_SERVER_IP) {
            config.server.host = short_string(host.trim());
        }
        if let Some(port) = load_parsed(store, KEY_WT_PORT) {
            config.server.withrottle_port = port;
        }
        if let Some(port) = load_parsed(store, KEY_JSON_PORT) {
            config.server.json_port = port;
        }
        if let Some(name) = store.load(KEY_POWER_MGR) {
            config.server.power_manager = short_string(name.trim());
        }
        if let Some(steps) = load_parsed::<u8>(store, KEY_SPEED_STEPS) {
            config.throttle = config.throttle.with_steps_per_click(steps);
        }
        config
    }

    /// Persists the server section and speed steps to `store`.
    pub fn save_to(&self, store: &dyn ConfigStore) -> Result<()> {
        store.save(KEY_SERVER_IP, &self.server.host)?;
        store.save(KEY_WT_PORT, &self.server.withrottle_port.to_string())?;
        store.save(KEY_JSON_PORT, &self.server.json_port.to_string())?;
        store.save(KEY_POWER_MGR, &self.server.power_manager)?;
        store.save(KEY_SPEED_STEPS, &self.throttle.steps_per_click.to_string())
    }
}

// ============================================================================
// Server Config
// ============================================================================

/// Where the layout server lives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server hostname or IP (empty = not configured)
    pub host: ShortString,
    /// WiThrottle TCP port
    pub withrottle_port: u16,
    /// JSON WebSocket port
    pub json_port: u16,
    /// Power manager the JSON client controls
    pub power_manager: ShortString,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: ShortString::new(),
            withrottle_port: 12090,
            json_port: 12080,
            power_manager: short_string("DCC++"),
        }
    }
}

impl ServerConfig {
    /// Set the host
    pub fn with_host(mut self, host: &str) -> Self {
        self.host = short_string(host);
        self
    }

    /// Set the WiThrottle port
    pub fn with_withrottle_port(mut self, port: u16) -> Self {
        self.withrottle_port = port;
        self
    }

    /// Set the JSON port
    pub fn with_json_port(mut self, port: u16) -> Self {
        self.json_port = port;
        self
    }

    /// Set the power manager name
    pub fn with_power_manager(mut self, name: &str) -> Self {
        self.power_manager = short_string(name);
        self
    }

    /// True once a host is set.
    pub fn is_configured(&self) -> bool {
        !self.host.is_empty()
    }
}

// ============================================================================
// Device Config
// ============================================================================

/// Device identification configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Name announced to the WiThrottle server
    pub name: ShortString,
    /// Hardware id announced to the WiThrottle server
    pub hardware_id: ShortString,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: short_string("rs-knobcab"),
            hardware_id: short_string("knobcab-0001"),
        }
    }
}

impl DeviceConfig {
    /// Set the device name
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = short_string(name);
        self
    }

    /// Set the hardware id
    pub fn with_hardware_id(mut self, id: &str) -> Self {
        self.hardware_id = short_string(id);
        self
    }
}

// ============================================================================
// Throttle Config
// ============================================================================

/// Throttle controller configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Speed steps added per knob detent (1..=20)
    pub steps_per_click: u8,
    /// Interval between speed/direction reconciliation polls
    pub poll_interval_ms: u32,
    /// Interval between WiThrottle heartbeats
    pub heartbeat_ms: u32,
    /// How long an entry point waits for the state lock
    pub lock_timeout_ms: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            steps_per_click: 4,
            poll_interval_ms: 10_000,
            heartbeat_ms: 10_000,
            lock_timeout_ms: 50,
        }
    }
}

impl ThrottleConfig {
    /// Set speed steps per click, clamped to 1..=20
    pub fn with_steps_per_click(mut self, steps: u8) -> Self {
        self.steps_per_click = steps.clamp(*STEPS_PER_CLICK_RANGE.start(), *STEPS_PER_CLICK_RANGE.end());
        self
    }

    /// Set the poll interval
    pub fn with_poll_interval_ms(mut self, ms: u32) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set the heartbeat interval
    pub fn with_heartbeat_ms(mut self, ms: u32) -> Self {
        self.heartbeat_ms = ms;
        self
    }

    /// Set the lock timeout
    pub fn with_lock_timeout_ms(mut self, ms: u32) -> Self {
        self.lock_timeout_ms = ms;
        self
    }

    /// Poll interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.poll_interval_ms))
    }

    /// Heartbeat interval as a `Duration`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.heartbeat_ms))
    }

    /// Lock timeout as a `Duration`.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.lock_timeout_ms))
    }
}

// ============================================================================
// Reconnect Config
// ============================================================================

/// Reconnect supervisor policy
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Interval between health checks
    pub check_interval_ms: u32,
    /// Backoff before the first retry; doubles per consecutive failure
    pub base_backoff_ms: u32,
    /// Upper bound on backoff
    pub max_backoff_ms: u32,
    /// Whether the supervisor starts enabled
    pub enabled: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 5_000,
            base_backoff_ms: 5_000,
            max_backoff_ms: 60_000,
            enabled: true,
        }
    }
}

impl ReconnectConfig {
    /// Set the check interval
    pub fn with_check_interval_ms(mut self, ms: u32) -> Self {
        self.check_interval_ms = ms;
        self
    }

    /// Set base and maximum backoff
    pub fn with_backoff_ms(mut self, base: u32, max: u32) -> Self {
        self.base_backoff_ms = base;
        self.max_backoff_ms = max.max(base);
        self
    }

    /// Enable or disable the supervisor
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

// ============================================================================
// Web Config
// ============================================================================

/// Virtual panel web server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebConfig {
    /// Port to listen on
    pub port: u16,
    /// Whether to enable CORS for all origins
    pub cors_permissive: bool,
    /// Whether web server is enabled
    pub enabled: bool,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            cors_permissive: true,
            enabled: false,
        }
    }
}

impl WebConfig {
    /// Set the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set CORS mode
    pub fn with_cors(mut self, permissive: bool) -> Self {
        self.cors_permissive = permissive;
        self
    }

    /// Enable or disable web server
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

// ============================================================================
// Tests
// ============================================================================

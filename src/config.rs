use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::client::address::{DEFAULT_PORT, DEFAULT_UNIX_PATH};
use crate::client::MAX_FILTER_LEN;
use crate::protocol::Category;

/// Top-level configuration for the flowtap agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Distributor socket connection configuration.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Event log output configuration.
    #[serde(default)]
    pub output: OutputConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Per-category dispatch configuration.
    #[serde(default)]
    pub events: EventsConfig,

    /// How often per-category event counts are logged. Default: 60s.
    #[serde(default = "default_stats_interval", with = "humantime_serde")]
    pub stats_interval: Duration,
}

/// Distributor socket connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Explicit TCP host. When set, TCP is used unconditionally.
    #[serde(default)]
    pub host: Option<String>,

    /// TCP port. Default: 7000.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Unix socket path, used when it exists and is a socket.
    /// Default: "/tmp/ndpid-distributor.sock".
    #[serde(default = "default_unix_path")]
    pub unix: Option<PathBuf>,

    /// Per-read deadline. Default: none (block until data arrives).
    #[serde(default, with = "humantime_serde")]
    pub read_timeout: Option<Duration>,

    /// Server-side filter expression sent once after connecting.
    #[serde(default)]
    pub filter: Option<String>,

    /// Reconnect after the daemon closes the connection. Default: false.
    #[serde(default)]
    pub reconnect: bool,

    /// Delay between reconnect attempts. Default: 5s.
    #[serde(default = "default_reconnect_interval", with = "humantime_serde")]
    pub reconnect_interval: Duration,
}

/// Event log output configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Directory receiving `<filename>.json` files. Default: "/var/log".
    #[serde(default = "default_output_directory")]
    pub directory: PathBuf,

    /// chrono format string for the `timestamp` field.
    /// Default: "%Y-%m-%dT%H:%M:%S".
    #[serde(default = "default_timestamp_format")]
    pub timestamp_format: String,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthConfig {
    /// Listen address, ":port" shorthand accepted. Default: "" (disabled).
    #[serde(default)]
    pub addr: String,
}

/// Dispatch configuration for every event category.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventsConfig {
    #[serde(default)]
    pub packet: EventConfig,
    #[serde(default)]
    pub flow: EventConfig,
    #[serde(default)]
    pub daemon: EventConfig,
    #[serde(default)]
    pub error: EventConfig,
}

impl EventsConfig {
    pub fn get(&self, category: Category) -> &EventConfig {
        match category {
            Category::Packet => &self.packet,
            Category::Flow => &self.flow,
            Category::Daemon => &self.daemon,
            Category::Error => &self.error,
        }
    }

    pub fn get_mut(&mut self, category: Category) -> &mut EventConfig {
        match category {
            Category::Packet => &mut self.packet,
            Category::Flow => &mut self.flow,
            Category::Daemon => &mut self.daemon,
            Category::Error => &mut self.error,
        }
    }
}

/// Dispatch configuration for one event category.
#[derive(Debug, Clone, Deserialize)]
pub struct EventConfig {
    /// Dispatch this category at all. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Event names to keep. Empty keeps every event.
    #[serde(default)]
    pub event_names: Vec<String>,

    /// Top-level fields removed before the event reaches the sink.
    #[serde(default)]
    pub ignore_fields: Vec<String>,

    /// Risk ids removed from `ndpi.flow_risk`.
    #[serde(default)]
    pub ignore_risks: Vec<String>,

    /// Output file stem. Default: "<category>_event".
    #[serde(default)]
    pub filename: Option<String>,

    /// Number of worker tasks. Default: 1.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Maximum queued jobs. Default: 1024.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// What to do when the queue is full. Default: block.
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

impl EventConfig {
    /// Output file stem for `category`.
    pub fn file_stem(&self, category: Category) -> String {
        self.filename
            .clone()
            .unwrap_or_else(|| format!("{category}_event"))
    }
}

/// Behavior of a full dispatch queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait for space, applying back-pressure to ingestion.
    Block,
    /// Evict the oldest queued job.
    DropOldest,
    /// Discard the new job.
    Reject,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        Self::Block
    }
}

impl OverflowPolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::DropOldest => "drop_oldest",
            Self::Reject => "reject",
        }
    }
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_unix_path() -> Option<PathBuf> {
    Some(PathBuf::from(DEFAULT_UNIX_PATH))
}

fn default_reconnect_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_output_directory() -> PathBuf {
    PathBuf::from("/var/log")
}

fn default_timestamp_format() -> String {
    "%Y-%m-%dT%H:%M:%S".to_string()
}

fn default_workers() -> usize {
    1
}

fn default_queue_size() -> usize {
    1024
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            connection: ConnectionConfig::default(),
            output: OutputConfig::default(),
            health: HealthConfig::default(),
            events: EventsConfig::default(),
            stats_interval: default_stats_interval(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_port(),
            unix: default_unix_path(),
            read_timeout: None,
            filter: None,
            reconnect: false,
            reconnect_interval: default_reconnect_interval(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_directory(),
            timestamp_format: default_timestamp_format(),
        }
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            event_names: Vec::new(),
            ignore_fields: Vec::new(),
            ignore_risks: Vec::new(),
            filename: None,
            workers: default_workers(),
            queue_size: default_queue_size(),
            overflow: OverflowPolicy::default(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.connection.port == 0 {
            bail!("connection.port must be positive");
        }

        if let Some(filter) = &self.connection.filter {
            if filter.len() > MAX_FILTER_LEN {
                bail!(
                    "connection.filter is {} bytes, at most {MAX_FILTER_LEN} allowed",
                    filter.len()
                );
            }
        }

        if self.connection.reconnect && self.connection.reconnect_interval.is_zero() {
            bail!("connection.reconnect_interval must be positive when reconnect is enabled");
        }

        if self.stats_interval.is_zero() {
            bail!("stats_interval must be positive");
        }

        for category in Category::all() {
            let events = self.events.get(*category);
            if !events.enabled {
                continue;
            }

            if events.workers == 0 {
                bail!("events.{category}.workers must be positive");
            }
            if events.queue_size == 0 {
                bail!("events.{category}.queue_size must be positive");
            }
            if events.file_stem(*category).trim().is_empty() {
                bail!("events.{category}.filename must not be empty");
            }
        }

        Ok(())
    }

    /// Whether any category is dispatched.
    pub fn any_enabled(&self) -> bool {
        Category::all().iter().any(|c| self.events.get(*c).enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.connection.port, 7000);
        assert_eq!(
            cfg.connection.unix.as_deref(),
            Some(Path::new("/tmp/ndpid-distributor.sock"))
        );
        assert!(cfg.connection.host.is_none());
        assert!(cfg.connection.read_timeout.is_none());
        assert_eq!(cfg.connection.reconnect_interval, Duration::from_secs(5));
        assert_eq!(cfg.output.directory, PathBuf::from("/var/log"));
        assert_eq!(cfg.output.timestamp_format, "%Y-%m-%dT%H:%M:%S");
        assert!(cfg.health.addr.is_empty());
        assert_eq!(cfg.stats_interval, Duration::from_secs(60));
        assert!(!cfg.any_enabled());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
connection:
  host: 10.0.0.5
  port: 7001
  read_timeout: 250ms
  filter: "flow_event_name == 'end'"
  reconnect: true
output:
  directory: /tmp/flowtap
health:
  addr: ":9090"
events:
  flow:
    enabled: true
    event_names: [end, idle]
    ignore_fields: [flow_state]
    ignore_risks: ["15"]
    workers: 4
    queue_size: 64
    overflow: drop_oldest
  daemon:
    enabled: true
    filename: daemon
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.connection.host.as_deref(), Some("10.0.0.5"));
        assert_eq!(cfg.connection.port, 7001);
        assert_eq!(
            cfg.connection.read_timeout,
            Some(Duration::from_millis(250))
        );
        assert!(cfg.connection.reconnect);
        assert_eq!(cfg.health.addr, ":9090");

        let flow = cfg.events.get(Category::Flow);
        assert!(flow.enabled);
        assert_eq!(flow.event_names, vec!["end", "idle"]);
        assert_eq!(flow.workers, 4);
        assert_eq!(flow.queue_size, 64);
        assert_eq!(flow.overflow, OverflowPolicy::DropOldest);
        assert_eq!(flow.file_stem(Category::Flow), "flow_event");

        let daemon = cfg.events.get(Category::Daemon);
        assert_eq!(daemon.file_stem(Category::Daemon), "daemon");
        assert_eq!(daemon.overflow, OverflowPolicy::Block);

        assert!(!cfg.events.get(Category::Packet).enabled);
    }

    #[test]
    fn test_unknown_overflow_policy_rejected() {
        let yaml = "events:\n  flow:\n    overflow: spill\n";
        assert!(serde_yaml::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn test_validation_port_zero() {
        let mut cfg = Config::default();
        cfg.connection.port = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("connection.port"));
    }

    #[test]
    fn test_validation_filter_too_long() {
        let mut cfg = Config::default();
        cfg.connection.filter = Some("x".repeat(MAX_FILTER_LEN + 1));
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("connection.filter"));

        cfg.connection.filter = Some("x".repeat(MAX_FILTER_LEN));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_workers_zero() {
        let mut cfg = Config::default();
        cfg.events.packet.workers = 0;
        // Disabled categories are not checked.
        assert!(cfg.validate().is_ok());

        cfg.events.packet.enabled = true;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("events.packet.workers"));
    }

    #[test]
    fn test_validation_queue_size_zero() {
        let mut cfg = Config::default();
        cfg.events.error.enabled = true;
        cfg.events.error.queue_size = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("events.error.queue_size"));
    }

    #[test]
    fn test_validation_empty_filename() {
        let mut cfg = Config::default();
        cfg.events.daemon.enabled = true;
        cfg.events.daemon.filename = Some(String::new());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("events.daemon.filename"));
    }

    #[test]
    fn test_validation_reconnect_interval() {
        let mut cfg = Config::default();
        cfg.connection.reconnect_interval = Duration::ZERO;
        assert!(cfg.validate().is_ok());

        cfg.connection.reconnect = true;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("reconnect_interval"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowtap.yaml");
        std::fs::write(&path, "connection:\n  port: 7010\n").unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.connection.port, 7010);

        let err = Config::load(&dir.path().join("missing.yaml")).unwrap_err();
        assert!(format!("{err:#}").contains("reading config file"));
    }
}

use std::{fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use serde::Deserialize;

use crate::live::StreamSettings;
use crate::store::{Backend, RoomPolicy};

/// Command line options for the view server and its clients.
#[derive(Parser, Debug, Default)]
#[command(name = "pawpaint-view", version, about = "PawPaint room viewer")]
pub struct Cli {
    /// Override bind address (host:port).
    #[arg(long, global = true)]
    pub bind: Option<String>,
    /// Override server port.
    #[arg(long, global = true)]
    pub port: Option<u16>,
    /// Enable or disable logging (true/false).
    #[arg(long, global = true)]
    pub logging: Option<bool>,
    /// Path to configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// SQLite file for the durable key-value backend.
    #[arg(long, global = true)]
    pub kv: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the HTTP server (default).
    Serve,
    /// Follow a room and print each new snapshot.
    Watch {
        code: String,
        /// Base URL of the view server; defaults to the configured bind address.
        #[arg(long)]
        server: Option<String>,
    },
    /// Upload an image file as the room's snapshot.
    Publish {
        code: String,
        file: PathBuf,
        #[arg(long)]
        server: Option<String>,
        /// Keep re-stamping the room every SECS seconds until interrupted.
        #[arg(long, value_name = "SECS")]
        keepalive: Option<u64>,
    },
    /// List recently active rooms.
    Rooms {
        #[arg(long)]
        server: Option<String>,
    },
}

/// Backend requested in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    /// Key-value store when a path is configured, edge cache otherwise.
    #[default]
    Auto,
    Kv,
    Cache,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageConfig {
    pub backend: BackendChoice,
    pub kv_path: Option<PathBuf>,
    /// Maximum number of responses held by the edge cache.
    pub cache_capacity: usize,
    /// Interval between expiry sweeps.
    pub housekeeping: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendChoice::Auto,
            kv_path: None,
            cache_capacity: default_cache_capacity(),
            housekeeping: Duration::from_secs(default_housekeeping_secs()),
        }
    }
}

impl StorageConfig {
    pub fn resolved_backend(&self) -> Backend {
        match self.backend {
            BackendChoice::Kv => Backend::Kv,
            BackendChoice::Cache => Backend::Cache,
            BackendChoice::Auto if self.kv_path.is_some() => Backend::Kv,
            BackendChoice::Auto => Backend::Cache,
        }
    }

    /// Configured SQLite path, or one under the platform data directory.
    pub fn kv_path_or_default(&self) -> PathBuf {
        if let Some(path) = &self.kv_path {
            return path.clone();
        }
        ProjectDirs::from("", "", "pawpaint_view")
            .map(|dirs| dirs.data_dir().join("view.sqlite3"))
            .unwrap_or_else(|| PathBuf::from("./pawpaint_view_data/view.sqlite3"))
    }
}

/// Runtime configuration resolved from file, env and CLI.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind: String,
    pub logging_enabled: bool,
    /// When false the stream endpoint answers with one JSON snapshot.
    pub streaming: bool,
    pub max_body_kb: usize,
    pub storage: StorageConfig,
    pub rooms: RoomPolicy,
    pub stream: StreamSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: format!("127.0.0.1:{}", default_port()),
            logging_enabled: true,
            streaming: true,
            max_body_kb: default_max_body_kb(),
            storage: StorageConfig::default(),
            rooms: RoomPolicy::default(),
            stream: StreamSettings::default(),
        }
    }
}

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    logging: FileLogging,
    #[serde(default)]
    storage: FileStorage,
    #[serde(default)]
    rooms: FileRooms,
    #[serde(default)]
    stream: FileStream,
}

#[derive(Deserialize)]
struct FileServer {
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_true")]
    streaming: bool,
    #[serde(default = "default_max_body_kb")]
    max_body_kb: usize,
}

#[derive(Deserialize)]
struct FileLogging {
    #[serde(default = "default_true")]
    enabled: bool,
}

#[derive(Deserialize)]
struct FileStorage {
    #[serde(default)]
    backend: BackendChoice,
    #[serde(default)]
    kv_path: Option<PathBuf>,
    #[serde(default = "default_cache_capacity")]
    cache_capacity: usize,
    #[serde(default = "default_housekeeping_secs")]
    housekeeping_secs: u64,
}

#[derive(Deserialize, Default)]
struct FileRooms {
    active_window_secs: Option<u64>,
    index_window_secs: Option<u64>,
    ttl_secs: Option<u64>,
    max_rooms: Option<usize>,
}

#[derive(Deserialize, Default)]
struct FileStream {
    fast_ms: Option<u64>,
    slow_ms: Option<u64>,
    recent_activity_ms: Option<u64>,
    heartbeat_secs: Option<u64>,
    max_session_secs: Option<u64>,
    retry_ms: Option<u64>,
}

fn default_port() -> u16 {
    8788
}

fn default_true() -> bool {
    true
}

// fits a full-size data URI plus the JSON envelope
fn default_max_body_kb() -> usize {
    4096
}

fn default_cache_capacity() -> usize {
    512
}

fn default_housekeeping_secs() -> u64 {
    300
}

impl Default for FileServer {
    fn default() -> Self {
        Self {
            port: default_port(),
            streaming: true,
            max_body_kb: default_max_body_kb(),
        }
    }
}

impl Default for FileLogging {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for FileStorage {
    fn default() -> Self {
        Self {
            backend: BackendChoice::Auto,
            kv_path: None,
            cache_capacity: default_cache_capacity(),
            housekeeping_secs: default_housekeeping_secs(),
        }
    }
}

impl FileRooms {
    fn apply(&self, policy: &mut RoomPolicy) {
        if let Some(s) = self.active_window_secs {
            policy.active_window = Duration::from_secs(s);
        }
        if let Some(s) = self.index_window_secs {
            policy.index_window = Duration::from_secs(s);
        }
        if let Some(s) = self.ttl_secs {
            policy.ttl = Duration::from_secs(s);
        }
        if let Some(n) = self.max_rooms {
            policy.max_rooms = n;
        }
    }
}

impl FileStream {
    fn apply(&self, stream: &mut StreamSettings) {
        if let Some(ms) = self.fast_ms {
            stream.fast_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.slow_ms {
            stream.slow_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = self.recent_activity_ms {
            stream.recent_activity = Duration::from_millis(ms);
        }
        if let Some(s) = self.heartbeat_secs {
            stream.heartbeat = Duration::from_secs(s);
        }
        if let Some(s) = self.max_session_secs {
            stream.max_lifetime = Duration::from_secs(s);
        }
        if let Some(ms) = self.retry_ms {
            stream.retry = Duration::from_millis(ms);
        }
    }
}

impl Config {
    /// Resolve configuration from CLI, environment variables, config file and defaults.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut cfg = Config::default();
        let mut port = default_port();

        // config file path precedence: CLI -> ENV -> default
        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("PAWPAINT_VIEW_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/pawpaint_view.toml"));

        if let Ok(bytes) = fs::read(&config_path) {
            let contents = String::from_utf8_lossy(&bytes);
            let file_cfg: FileConfig = toml::from_str(&contents)
                .with_context(|| format!("invalid config file {}", config_path.display()))?;
            port = file_cfg.server.port;
            cfg.streaming = file_cfg.server.streaming;
            cfg.max_body_kb = file_cfg.server.max_body_kb;
            cfg.logging_enabled = file_cfg.logging.enabled;
            cfg.storage = StorageConfig {
                backend: file_cfg.storage.backend,
                kv_path: file_cfg.storage.kv_path,
                cache_capacity: file_cfg.storage.cache_capacity,
                housekeeping: Duration::from_secs(file_cfg.storage.housekeeping_secs),
            };
            file_cfg.rooms.apply(&mut cfg.rooms);
            file_cfg.stream.apply(&mut cfg.stream);
        }

        // environment overrides
        if let Ok(p) = std::env::var("PAWPAINT_VIEW_PORT") {
            if let Ok(p) = p.parse::<u16>() {
                port = p;
            }
        }
        if let Ok(l) = std::env::var("PAWPAINT_VIEW_LOGGING") {
            if let Ok(l) = l.parse::<bool>() {
                cfg.logging_enabled = l;
            }
        }
        if let Ok(kv) = std::env::var("PAWPAINT_VIEW_KV") {
            if !kv.is_empty() {
                cfg.storage.kv_path = Some(PathBuf::from(kv));
            }
        }

        // CLI overrides
        if let Some(p) = cli.port {
            port = p;
        }
        if let Some(l) = cli.logging {
            cfg.logging_enabled = l;
        }
        if let Some(kv) = &cli.kv {
            cfg.storage.kv_path = Some(kv.clone());
        }

        if !(1024..=65535).contains(&port) {
            anyhow::bail!("invalid_port");
        }
        if cfg.rooms.max_rooms == 0 {
            anyhow::bail!("rooms.max_rooms must be at least 1");
        }
        if cfg.storage.housekeeping.is_zero() {
            anyhow::bail!("storage.housekeeping_secs must be at least 1");
        }

        // bind address precedence for host override
        cfg.bind = if let Some(b) = &cli.bind {
            b.clone()
        } else if let Ok(b) = std::env::var("BIND") {
            b
        } else {
            format!("127.0.0.1:{}", port)
        };

        Ok(cfg)
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_kb * 1024
    }

    /// Base URL clients use when no `--server` is given.
    pub fn local_url(&self) -> String {
        format!("http://{}", self.bind)
    }
}

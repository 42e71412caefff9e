use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides `server.port`
pub const PORT_ENV: &str = "PORT";

/// Global configuration shared by all three services
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Streamer list store
    #[serde(default)]
    pub streamers: StreamerStoreConfig,

    /// Worker process supervisor
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Cheatsheet store
    #[serde(default)]
    pub cheatsheets: CheatsheetStoreConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port (default: 5001, overridden by the PORT environment variable)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Maximum accepted request body size in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,
}

impl ServerConfig {
    /// Socket address built from `bind` and `port`
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address {}:{}: {}", self.bind, self.port, e))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StreamerStoreConfig {
    /// JSON file holding the five streamer slots
    #[serde(default = "default_streamers_file")]
    pub file: PathBuf,
}

impl Default for StreamerStoreConfig {
    fn default() -> Self {
        Self {
            file: default_streamers_file(),
        }
    }
}

/// Configuration for the supervised worker
///
/// # Security Warning
///
/// `command` and `args` are executed directly with the permissions of the
/// service. Protect the configuration file accordingly.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SupervisorConfig {
    /// Command to launch. When `args` is empty it is split with shell-word rules.
    pub command: Option<String>,

    /// Arguments passed to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the worker
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables for the worker
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Seconds to wait after SIGTERM before sending SIGKILL. Unset waits forever.
    pub shutdown_grace_period_secs: Option<u64>,

    /// File recording the pid of the running worker
    pub pid_file: Option<PathBuf>,

    /// Stop the worker when the service itself shuts down
    #[serde(default)]
    pub stop_on_shutdown: bool,
}

impl SupervisorConfig {
    /// Create a config for `command` with explicit arguments
    pub fn new(command: &str, args: Vec<String>) -> Self {
        Self {
            command: Some(command.to_string()),
            args,
            ..Self::default()
        }
    }

    /// Set the grace period (builder pattern)
    pub fn with_grace_period(mut self, secs: u64) -> Self {
        self.shutdown_grace_period_secs = Some(secs);
        self
    }

    /// Set the pid file (builder pattern)
    pub fn with_pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_file = Some(path.into());
        self
    }

    pub fn shutdown_grace_period(&self) -> Option<Duration> {
        self.shutdown_grace_period_secs.map(Duration::from_secs)
    }

    /// Resolve the program and its argument list
    pub fn program(&self) -> anyhow::Result<(String, Vec<String>)> {
        let command = self
            .command
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| anyhow::anyhow!("supervisor requires a 'command' field"))?;

        if !self.args.is_empty() {
            return Ok((command.to_string(), self.args.clone()));
        }

        let mut words = shell_words::split(command)
            .map_err(|e| anyhow::anyhow!("Invalid supervisor command '{}': {}", command, e))?;
        if words.is_empty() {
            anyhow::bail!("supervisor requires a 'command' field");
        }
        let program = words.remove(0);
        Ok((program, words))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CheatsheetStoreConfig {
    /// Directory holding `{id}.txt` and `{id}.html` files
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// JSON file mapping identifiers to filenames
    #[serde(default = "default_metadata_file")]
    pub metadata_file: PathBuf,

    /// Escape HTML-sensitive characters when rendering (default: true)
    #[serde(default = "default_escape_html")]
    pub escape_html: bool,
}

impl CheatsheetStoreConfig {
    /// Config rooted in a single directory (used by tests and embedders)
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            storage_dir: dir.join(default_storage_dir()),
            metadata_file: dir.join(default_metadata_file()),
            escape_html: true,
        }
    }
}

impl Default for CheatsheetStoreConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            metadata_file: default_metadata_file(),
            escape_html: default_escape_html(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    5001
}

fn default_max_body_bytes() -> u64 {
    16 * 1024 * 1024
}

fn default_streamers_file() -> PathBuf {
    PathBuf::from("streamers.json")
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("cheatsheets")
}

fn default_metadata_file() -> PathBuf {
    PathBuf::from("cheatsheets_metadata.json")
}

fn default_escape_html() -> bool {
    true
}

impl Config {
    /// Load a config file and apply the PORT override
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_override(std::env::var(PORT_ENV).ok().as_deref())?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise start from defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            return Self::load(path);
        }
        let mut config = Config::default();
        config.apply_env_override(std::env::var(PORT_ENV).ok().as_deref())?;
        Ok(config)
    }

    /// Apply a PORT value taken from the environment
    pub fn apply_env_override(&mut self, port: Option<&str>) -> anyhow::Result<()> {
        if let Some(raw) = port {
            let port: u16 = raw
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid {} value '{}': {}", PORT_ENV, raw, e))?;
            self.server.port = port;
        }
        Ok(())
    }

    /// Validate the sections needed by the supervisor service
    pub fn validate_supervisor(&self) -> anyhow::Result<()> {
        self.supervisor.program().map(|_| ())
    }
}

/// Core types and structures for the lxce container engine
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Hostname used when a space config does not carry one
pub const DEFAULT_HOSTNAME: &str = "localhost";

/// Parent directory of every space rootfs unless overridden
pub const DEFAULT_CSPACE_ROOTFS_PATH: &str = "/var/lib/lxce/cspaces";

/// Where contained app bundles live when the manifest has no explicit path
pub const DEFAULT_CAPP_PKG_PATH: &str = "/capps/pkgs";

/// Per-app configuration file expected at the root of every app bundle
pub const CAPP_CONFIG_FILE: &str = "config.json";

/// Upper bound on the capability list of a single space or app
pub const MAX_CAPABILITIES: usize = 64;

/// Config files larger than this are rejected before parsing
pub const CONFIG_MAX_SIZE: u64 = 1024 * 1024;

/// Space target value that makes the `serial` field mandatory
pub const TARGET_SERIAL: &str = "serial";

pub const DEFAULT_CONFIG_FILE: &str = "/etc/lxce/lxce.toml";

/// `{"type": "<name>"}` entry used by namespace and capability lists
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeEntry {
    #[serde(rename = "type")]
    pub kind: String,
}

impl TypeEntry {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
        }
    }
}

/// Space flavour, selects the capability bundle dropped at creation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpaceKind {
    #[default]
    Boot,
    Service,
    Shutdown,
}

impl fmt::Display for SpaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpaceKind::Boot => write!(f, "boot"),
            SpaceKind::Service => write!(f, "service"),
            SpaceKind::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Contained space configuration, one JSON file per space
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpaceConfig {
    pub version: String,
    pub target: String,
    #[serde(default)]
    pub serial: Option<String>,
    pub name: String,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default)]
    pub uid: u32,
    #[serde(default)]
    pub gid: u32,
    #[serde(default, rename = "type")]
    pub kind: SpaceKind,
    /// Rootfs directory; defaults to `DEFAULT_CSPACE_ROOTFS_PATH/<name>/`
    #[serde(default)]
    pub rootfs: Option<PathBuf>,
    #[serde(default)]
    pub namespaces: Vec<TypeEntry>,
    #[serde(default)]
    pub capabilities: Vec<TypeEntry>,
    /// File this config was read from
    #[serde(skip)]
    pub config_file: Option<PathBuf>,
}

fn default_hostname() -> String {
    DEFAULT_HOSTNAME.to_string()
}

impl SpaceConfig {
    /// Read and validate a space config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = read_config_file(path)?;
        let mut config = Self::from_json(&contents)?;
        config.config_file = Some(path.to_path_buf());
        Ok(config)
    }

    /// Parse and validate a space config from its JSON text
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SpaceConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(LxceError::Config("Space name is empty".to_string()));
        }

        if self.target == TARGET_SERIAL && self.serial.is_none() {
            return Err(LxceError::Config(format!(
                "Space: {} target is '{}' but no serial is given",
                self.name, TARGET_SERIAL
            )));
        }

        if self.capabilities.len() > MAX_CAPABILITIES {
            return Err(LxceError::Config(format!(
                "Space: {} defines {} capabilities, at most {} are supported",
                self.name,
                self.capabilities.len(),
                MAX_CAPABILITIES
            )));
        }

        crate::capability::parse_namespaces(&self.namespaces)?;
        crate::capability::parse_capabilities(&self.capabilities)?;

        Ok(())
    }

    /// Effective rootfs directory of the space
    pub fn rootfs_path(&self) -> PathBuf {
        match self.rootfs {
            Some(ref rootfs) => rootfs.clone(),
            None => Path::new(DEFAULT_CSPACE_ROOTFS_PATH).join(&self.name),
        }
    }
}

/// One application entry of the manifest
///
/// Entries lacking a name, tag or contained target are skipped, not rejected.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    /// Name of the space the app runs in
    #[serde(default)]
    pub contained: Option<String>,
    #[serde(default)]
    pub restart: bool,
    /// Bundle location inside the space, defaults to `DEFAULT_CAPP_PKG_PATH/<name>_<tag>`
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl ManifestEntry {
    pub fn is_valid(&self) -> bool {
        self.name.as_deref().is_some_and(|s| !s.is_empty())
            && self.tag.as_deref().is_some_and(|s| !s.is_empty())
            && self.contained.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// Bundle path of the app, resolved against the default package directory
    pub fn bundle_path(&self) -> Option<PathBuf> {
        if let Some(ref path) = self.path {
            return Some(path.clone());
        }
        let name = self.name.as_deref()?;
        let tag = self.tag.as_deref()?;
        Some(Path::new(DEFAULT_CAPP_PKG_PATH).join(format!("{}_{}", name, tag)))
    }
}

/// Application manifest
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub capps: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = read_config_file(path)?;
        Self::from_json(&contents)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Process section of an app config
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Program to exec, searched in PATH when not absolute
    pub exec: String,
    /// Arguments after argv[0]
    #[serde(default)]
    pub argv: Vec<String>,
    /// Environment in `KEY=VALUE` form
    #[serde(default)]
    pub env: Vec<String>,
}

/// Per-app configuration read from `<bundle>/config.json` inside the space
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub namespaces: Vec<TypeEntry>,
    #[serde(default)]
    pub capabilities: Vec<TypeEntry>,
    pub process: ProcessConfig,
}

impl AppConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = read_config_file(path)?;
        Self::from_json(&contents)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: AppConfig = serde_json::from_str(json)?;

        if config.process.exec.is_empty() {
            return Err(LxceError::Config("App exec path is empty".to_string()));
        }
        if config.capabilities.len() > MAX_CAPABILITIES {
            return Err(LxceError::Config(format!(
                "App defines {} capabilities, at most {} are supported",
                config.capabilities.len(),
                MAX_CAPABILITIES
            )));
        }

        Ok(config)
    }

    /// argv handed to exec, argv[0] being the program itself
    pub fn exec_argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.process.argv.len() + 1);
        argv.push(self.process.exec.clone());
        argv.extend(self.process.argv.iter().cloned());
        argv
    }
}

/// Engine section of the orchestrator config
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_status_file")]
    pub status_file: PathBuf,
    #[serde(default = "default_level")]
    pub level: String,
    pub manifest: PathBuf,
    #[serde(default)]
    pub spaces: Vec<PathBuf>,
    /// Mailbox wait bound and main loop tick
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// How often RUN apps are asked for their status
    #[serde(default = "default_status_interval")]
    pub status_interval_ms: u64,
    /// Upper bound for all spaces to leave the CREATE state at startup
    #[serde(default = "default_start_timeout")]
    pub start_timeout_ms: u64,
}

fn default_status_file() -> PathBuf {
    PathBuf::from("/var/run/lxce.status")
}

fn default_level() -> String {
    "DEBUG".to_string()
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_status_interval() -> u64 {
    10_000
}

fn default_start_timeout() -> u64 {
    30_000
}

/// uid/gid range mapped into every space user namespace
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserNsConfig {
    pub offset: u32,
    pub count: u32,
}

impl Default for UserNsConfig {
    fn default() -> Self {
        Self {
            offset: 100_000,
            count: 65_536,
        }
    }
}

/// Orchestrator configuration (TOML)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LxceConfig {
    pub config: EngineConfig,
    #[serde(default)]
    pub user_ns: UserNsConfig,
}

impl LxceConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = read_config_file(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: LxceConfig = toml::from_str(contents)?;
        if config.user_ns.count == 0 {
            return Err(LxceError::Config(
                "user_ns.count must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms.max(1))
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.config.status_interval_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.config.start_timeout_ms)
    }
}

/// Read a config file after checking it is not unreasonably large
pub fn read_config_file(path: &Path) -> Result<String> {
    let metadata = fs::metadata(path).map_err(|e| {
        LxceError::Config(format!("Error opening file: {} Error: {}", path.display(), e))
    })?;

    if metadata.len() > CONFIG_MAX_SIZE {
        return Err(LxceError::Config(format!(
            "Error opening file: {} Error: File size too big: {}",
            path.display(),
            metadata.len()
        )));
    }

    Ok(fs::read_to_string(path)?)
}

/// Custom error types for lxce
#[derive(Error, Debug)]
pub enum LxceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Socket read failed for a reason other than a timeout
    #[error("Read error: {0}")]
    ReadError(String),

    #[error("Read timed out")]
    ReadTimeout,

    #[error("Memory error: {0}")]
    MemoryError(String),

    /// Short read or write on a fixed-size handshake message
    #[error("Protocol mismatch: expected {expected} bytes, got {got}")]
    ProtocolMismatch { expected: usize, got: usize },

    #[error("Namespace setup failure: {0}")]
    NamespaceSetup(String),

    #[error("Capability error: {0}")]
    Capability(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Process error: {0}")]
    Process(String),
}

/// Result type alias for lxce operations
pub type Result<T> = std::result::Result<T, LxceError>;

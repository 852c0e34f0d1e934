use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Requests a single virtual key may make inside one hourly window.
pub const MAX_REQUESTS_PER_HOUR: u32 = 100;

/// Total wall-clock budget for one chat request once it has been admitted.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Per-call timeout on the outbound provider request.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(15);

/// Timeout for provider health probes.
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Environment override tracking
// ---------------------------------------------------------------------------

/// Records which settings were replaced by `LLMGW_*` environment variables.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    overrides: HashMap<String, String>,
}

impl EnvOverrides {
    /// Check whether a setting key (e.g. "server.port") is overridden by an env var.
    pub fn is_overridden(&self, key: &str) -> bool {
        self.overrides.contains_key(key)
    }

    /// Get the env var name that overrides the given setting key.
    pub fn env_var_for(&self, key: &str) -> Option<&str> {
        self.overrides.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.overrides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }

    fn record(&mut self, key: &str, env_var: &str) {
        self.overrides.insert(key.to_string(), env_var.to_string());
    }
}

// ---------------------------------------------------------------------------
// Main configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "default_providers")]
    pub providers: BTreeMap<String, ProviderEndpoint>,
    /// Env var overrides are not serialized to TOML.
    #[serde(skip)]
    pub env_overrides: EnvOverrides,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Read-only map of virtual keys to provider credentials.
    #[serde(default = "default_keys_path")]
    pub keys_path: PathBuf,
    /// Usage counters, owned exclusively by the usage store.
    #[serde(default = "default_usage_path")]
    pub usage_path: PathBuf,
    /// Overwrite the usage file with an empty map at startup instead of
    /// keeping the counters from the previous run.
    #[serde(default)]
    pub reset_usage_on_startup: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            keys_path: default_keys_path(),
            usage_path: default_usage_path(),
            reset_usage_on_startup: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_requests_per_hour")]
    pub max_requests_per_hour: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,
    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout_secs: u64,
    #[serde(default)]
    pub window: WindowMode,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_requests_per_hour: default_max_requests_per_hour(),
            request_timeout_secs: default_request_timeout_secs(),
            upstream_timeout_secs: default_upstream_timeout_secs(),
            health_timeout_secs: default_health_timeout_secs(),
            window: WindowMode::default(),
        }
    }
}

impl LimitsConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }
}

/// How `last_reset` moves when a request is committed.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WindowMode {
    /// Every commit moves `last_reset` to now; the hour is measured from the
    /// most recent request.
    #[default]
    Floating,
    /// `last_reset` only moves when a record is created or its hour expires.
    Fixed,
}

impl std::fmt::Display for WindowMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Floating => write!(f, "floating"),
            Self::Fixed => write!(f, "fixed"),
        }
    }
}

impl FromStr for WindowMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "floating" | "sliding" => Ok(Self::Floating),
            "fixed" => Ok(Self::Fixed),
            _ => Err(format!("Unknown window mode: {s}")),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct GatewayConfig {
    /// Forward the client's original body bytes instead of the re-serialized
    /// `{"prompt": ...}` view.
    #[serde(default)]
    pub forward_original_body: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AuditConfig {
    /// Append audit lines to this file. Stdout when unset.
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Upstream URLs for a single provider id.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProviderEndpoint {
    pub chat_url: String,
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Default value functions
// ---------------------------------------------------------------------------

const fn default_port() -> u16 {
    8080
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_keys_path() -> PathBuf {
    PathBuf::from("keys.json")
}
fn default_usage_path() -> PathBuf {
    PathBuf::from("usage.json")
}
const fn default_max_requests_per_hour() -> u32 {
    MAX_REQUESTS_PER_HOUR
}
const fn default_request_timeout_secs() -> u64 {
    REQUEST_TIMEOUT.as_secs()
}
const fn default_upstream_timeout_secs() -> u64 {
    UPSTREAM_TIMEOUT.as_secs()
}
const fn default_health_timeout_secs() -> u64 {
    HEALTH_TIMEOUT.as_secs()
}
fn default_log_level() -> String {
    "info".to_string()
}

/// The built-in provider table: OpenAI and Anthropic.
pub fn default_providers() -> BTreeMap<String, ProviderEndpoint> {
    BTreeMap::from([
        (
            "anthropic".to_string(),
            ProviderEndpoint {
                chat_url: "https://api.anthropic.com/v1/complete".to_string(),
                health_url: Some("https://api.anthropic.com/v1/models".to_string()),
            },
        ),
        (
            "openai".to_string(),
            ProviderEndpoint {
                chat_url: "https://api.openai.com/v1/chat/completions".to_string(),
                health_url: Some("https://status.openai.com/api/v2/summary.json".to_string()),
            },
        ),
    ])
}

// ---------------------------------------------------------------------------
// Config loading and env overrides
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a TOML file, then apply environment variable
    /// overrides. Any setting prefixed with `LLMGW_` takes precedence over the
    /// file value and is tracked in `env_overrides`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            config
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    fn apply_env_overrides(&mut self) {
        let mut ov = EnvOverrides::default();

        macro_rules! env_bool {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    $field = matches!(val.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
                    ov.record($key, $env);
                }
            };
        }
        macro_rules! env_parse {
            ($key:expr, $env:expr, $field:expr) => {
                if let Ok(val) = std::env::var($env) {
                    if let Ok(parsed) = val.parse() {
                        $field = parsed;
                        ov.record($key, $env);
                    } else {
                        tracing::warn!(env = $env, value = %val, "Ignoring unparseable env override");
                    }
                }
            };
        }

        // -- Server --
        env_parse!("server.host", "LLMGW_SERVER_HOST", self.server.host);
        env_parse!("server.port", "LLMGW_SERVER_PORT", self.server.port);

        // -- Storage --
        env_parse!("storage.keys_path", "LLMGW_KEYS_PATH", self.storage.keys_path);
        env_parse!("storage.usage_path", "LLMGW_USAGE_PATH", self.storage.usage_path);
        env_bool!(
            "storage.reset_usage_on_startup",
            "LLMGW_RESET_USAGE_ON_STARTUP",
            self.storage.reset_usage_on_startup
        );

        // -- Limits --
        env_parse!(
            "limits.max_requests_per_hour",
            "LLMGW_MAX_REQUESTS_PER_HOUR",
            self.limits.max_requests_per_hour
        );
        env_parse!(
            "limits.request_timeout_secs",
            "LLMGW_REQUEST_TIMEOUT_SECS",
            self.limits.request_timeout_secs
        );
        env_parse!(
            "limits.upstream_timeout_secs",
            "LLMGW_UPSTREAM_TIMEOUT_SECS",
            self.limits.upstream_timeout_secs
        );
        env_parse!(
            "limits.health_timeout_secs",
            "LLMGW_HEALTH_TIMEOUT_SECS",
            self.limits.health_timeout_secs
        );
        env_parse!("limits.window", "LLMGW_WINDOW", self.limits.window);

        // -- Gateway --
        env_bool!(
            "gateway.forward_original_body",
            "LLMGW_FORWARD_ORIGINAL_BODY",
            self.gateway.forward_original_body
        );

        // -- Audit --
        if let Ok(val) = std::env::var("LLMGW_AUDIT_PATH") {
            self.audit.path = if val.is_empty() { None } else { Some(PathBuf::from(val)) };
            ov.record("audit.path", "LLMGW_AUDIT_PATH");
        }

        // -- Logging --
        env_parse!("logging.level", "LLMGW_LOG_LEVEL", self.logging.level);
        env_bool!("logging.json", "LLMGW_LOG_JSON", self.logging.json);

        self.env_overrides = ov;
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            limits: LimitsConfig::default(),
            gateway: GatewayConfig::default(),
            audit: AuditConfig::default(),
            logging: LoggingConfig::default(),
            providers: default_providers(),
            env_overrides: EnvOverrides::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

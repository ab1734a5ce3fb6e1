//! Configuration management for crawlmesh nodes
//!
//! Configuration is loaded from a TOML file or from `CRAWLMESH_*` environment
//! variables; environment values override file values when both are used.
//! Every section falls back to its defaults when omitted.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::cluster::{ClusterConfig, Node, ScoreWeights, CAP_HTTP_SCRAPING};
use crate::queue::QueueConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity and capabilities of this node
    pub node: NodeConfig,

    /// Coordination store and broker backends plus cluster timing
    pub coordination: CoordinationConfig,

    /// Priority queue configuration
    pub queue: QueueConfig,

    /// Load score weights
    pub scheduler: ScoreWeights,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Node identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Unique node id; generated when not configured
    pub id: String,

    /// Address other components reach this node at
    pub address: String,

    pub port: u16,

    /// Advertised capabilities (e.g. `http_scraping`, `browser_scraping`)
    pub capabilities: Vec<String>,

    pub metadata: HashMap<String, String>,

    /// Interval of load reports in milliseconds
    pub load_report_interval_ms: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!("node-{}", &suffix[..8]),
            address: "127.0.0.1".to_string(),
            port: 9000,
            capabilities: vec![CAP_HTTP_SCRAPING.to_string()],
            metadata: HashMap::new(),
            load_report_interval_ms: 10_000,
        }
    }
}

impl NodeConfig {
    /// Build the registry entry announced at startup
    pub fn to_node(&self) -> Node {
        let mut node = Node::new(&self.id, &self.address, self.port)
            .with_capabilities(self.capabilities.iter().cloned());
        node.metadata = self.metadata.clone();
        node
    }

    pub fn load_report_interval(&self) -> Duration {
        Duration::from_millis(self.load_report_interval_ms)
    }
}

/// Backend kind for the coordination store and the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// In-process store and broker; single-process clusters and tests
    #[default]
    Memory,
    /// Redis hashes for coordination, Redis streams for the queue
    Redis,
}

impl FromStr for Backend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => anyhow::bail!("unknown backend: {other}"),
        }
    }
}

/// Coordination configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub backend: Backend,

    /// Redis URL used by the `redis` backend
    pub redis_url: String,

    /// Connection pool size of the `redis` backend
    pub redis_pool_size: usize,

    /// Lease, election and watch timing
    pub cluster: ClusterConfig,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            redis_url: "redis://localhost:6379".to_string(),
            redis_pool_size: 10,
            cluster: ClusterConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("text"),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_var(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid value for {name}: {e}")),
        None => Ok(None),
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Override fields with any `CRAWLMESH_*` variables that are set
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(id) = env_var("CRAWLMESH_NODE_ID") {
            self.node.id = id;
        }
        if let Some(address) = env_var("CRAWLMESH_NODE_ADDRESS") {
            self.node.address = address;
        }
        if let Some(port) = env_parse("CRAWLMESH_NODE_PORT")? {
            self.node.port = port;
        }
        if let Some(capabilities) = env_var("CRAWLMESH_CAPABILITIES") {
            self.node.capabilities = capabilities
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(backend) = env_parse("CRAWLMESH_BACKEND")? {
            self.coordination.backend = backend;
        }
        if let Some(url) = env_var("CRAWLMESH_REDIS_URL") {
            self.coordination.redis_url = url;
        }
        if let Some(prefix) = env_var("CRAWLMESH_KEY_PREFIX") {
            self.coordination.cluster.key_prefix = prefix;
        }
        if let Some(ttl) = env_parse("CRAWLMESH_LEASE_TTL_MS")? {
            self.coordination.cluster.lease_ttl_ms = ttl;
        }
        if let Some(ttl) = env_parse("CRAWLMESH_LEADER_TTL_MS")? {
            self.coordination.cluster.leader_ttl_ms = ttl;
        }

        if let Some(prefix) = env_var("CRAWLMESH_QUEUE_PREFIX") {
            self.queue.topic_prefix = prefix;
        }
        if let Some(depth) = env_parse("CRAWLMESH_MAX_DEPTH")? {
            self.queue.max_depth = depth;
        }

        if let Some(level) = env_var("CRAWLMESH_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = env_var("CRAWLMESH_LOG_FORMAT") {
            self.logging.format = format;
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.node.id.is_empty() {
            anyhow::bail!("node.id must not be empty");
        }

        if self.node.id.contains('/') {
            anyhow::bail!("node.id must not contain '/'");
        }

        if self.node.load_report_interval_ms == 0 {
            anyhow::bail!("node.load_report_interval_ms must be greater than 0");
        }

        if self.coordination.backend == Backend::Redis && self.coordination.redis_url.is_empty() {
            anyhow::bail!("coordination.redis_url is required for the redis backend");
        }

        self.coordination
            .cluster
            .validate()
            .context("Invalid coordination.cluster settings")?;
        self.queue.validate().context("Invalid queue settings")?;

        let weights = &self.scheduler;
        if [weights.cpu, weights.memory, weights.jobs, weights.priority_scale]
            .iter()
            .any(|w| !w.is_finite() || *w < 0.0)
        {
            anyhow::bail!("scheduler weights must be finite and non-negative");
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            anyhow::bail!("logging.format must be 'text' or 'json'");
        }

        Ok(())
    }

    /// Fail unless the backends are shared with other processes
    ///
    /// One-shot commands exit right away, so whatever they write to the
    /// in-process backend is gone with them.
    pub fn require_shared_backend(&self, command: &str) -> Result<()> {
        if self.coordination.backend == Backend::Memory {
            anyhow::bail!(
                "'{command}' needs a shared backend; set coordination.backend = \"redis\" \
                 or CRAWLMESH_BACKEND=redis"
            );
        }
        Ok(())
    }
}

//! Node and membership event types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

// ============================================================================
// Capabilities
// ============================================================================

/// Plain HTTP fetching
pub const CAP_HTTP_SCRAPING: &str = "http_scraping";

/// Headless browser rendering
pub const CAP_BROWSER_SCRAPING: &str = "browser_scraping";

/// Model-based extraction
pub const CAP_AI_EXTRACTION: &str = "ai_extraction";

// ============================================================================
// Node Status
// ============================================================================

/// Lifecycle status of a registered node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Accepting work
    #[default]
    Active,

    /// Leaving or left the cluster
    Inactive,

    /// Finishing current work, not accepting new jobs
    Draining,

    /// Lost its lease or was declared dead
    Failed,
}

impl NodeStatus {
    /// Whether the scheduler may assign new jobs to the node
    pub fn is_schedulable(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Whether disappearing in this status counts as an orderly departure
    pub fn is_departing(&self) -> bool {
        matches!(self, Self::Inactive | Self::Draining)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Draining => "draining",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "draining" => Ok(Self::Draining),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown node status: {other}")),
        }
    }
}

// ============================================================================
// Load
// ============================================================================

/// Load snapshot reported by a node
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeLoad {
    /// CPU utilisation in [0, 1]
    pub cpu: f64,
    /// Memory utilisation in [0, 1]
    pub memory: f64,
    pub active_jobs: u32,
    pub queue_size: u32,
}

impl NodeLoad {
    pub fn new(cpu: f64, memory: f64, active_jobs: u32) -> Self {
        Self {
            cpu,
            memory,
            active_jobs,
            queue_size: 0,
        }
    }

    /// Clamp utilisation into [0, 1]; NaN counts as fully loaded
    pub fn clamped(self) -> Self {
        let unit = |v: f64| if v.is_nan() { 1.0 } else { v.clamp(0.0, 1.0) };
        Self {
            cpu: unit(self.cpu),
            memory: unit(self.memory),
            ..self
        }
    }
}

// ============================================================================
// Node
// ============================================================================

/// A worker node as stored in the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub load: NodeLoad,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub last_seen: DateTime<Utc>,
}

impl Node {
    /// Create an active node with no capabilities and zero load
    pub fn new(id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port,
            status: NodeStatus::Active,
            capabilities: BTreeSet::new(),
            load: NodeLoad::default(),
            metadata: HashMap::new(),
            last_seen: Utc::now(),
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_load(mut self, load: NodeLoad) -> Self {
        self.load = load;
        self
    }

    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Capability superset check, O(|requirements|)
    pub fn has_capabilities(&self, requirements: &[String]) -> bool {
        requirements.iter().all(|req| self.capabilities.contains(req))
    }

    /// Get the full address
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

// ============================================================================
// Events
// ============================================================================

/// Kind of membership change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeEventKind {
    #[serde(rename = "node_joined")]
    Joined,
    #[serde(rename = "node_left")]
    Left,
    #[serde(rename = "node_updated")]
    Updated,
    #[serde(rename = "node_failed")]
    Failed,
}

impl NodeEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Joined => "joined",
            Self::Left => "left",
            Self::Updated => "updated",
            Self::Failed => "failed",
        }
    }

    /// Whether the node is gone and its work must be recovered
    pub fn is_departure(&self) -> bool {
        matches!(self, Self::Left | Self::Failed)
    }
}

/// Membership change with the node snapshot it refers to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEvent {
    #[serde(rename = "type")]
    pub kind: NodeEventKind,
    pub node: Node,
    pub timestamp: DateTime<Utc>,
}

impl NodeEvent {
    pub fn new(kind: NodeEventKind, node: Node) -> Self {
        Self {
            kind,
            node,
            timestamp: Utc::now(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_status_schedulable() {
        assert!(NodeStatus::Active.is_schedulable());
        assert!(!NodeStatus::Draining.is_schedulable());
        assert!(!NodeStatus::Failed.is_schedulable());
        assert!(NodeStatus::Draining.is_departing());
        assert!(!NodeStatus::Active.is_departing());
    }

    #[test]
    fn test_node_status_parse() {
        assert_eq!("Draining".parse::<NodeStatus>(), Ok(NodeStatus::Draining));
        assert!("gone".parse::<NodeStatus>().is_err());
    }

    #[test]
    fn test_capability_superset() {
        let node = Node::new("n1", "10.0.0.1", 8080)
            .with_capabilities([CAP_HTTP_SCRAPING, CAP_AI_EXTRACTION]);

        assert!(node.has_capabilities(&[]));
        assert!(node.has_capabilities(&[CAP_HTTP_SCRAPING.to_string()]));
        assert!(!node.has_capabilities(&[
            CAP_HTTP_SCRAPING.to_string(),
            CAP_BROWSER_SCRAPING.to_string()
        ]));
    }

    #[test]
    fn test_load_clamped() {
        let load = NodeLoad::new(1.7, -0.2, 3).clamped();
        assert_eq!(load.cpu, 1.0);
        assert_eq!(load.memory, 0.0);
        assert_eq!(load.active_jobs, 3);

        let load = NodeLoad::new(f64::NAN, 0.5, 0).clamped();
        assert_eq!(load.cpu, 1.0);
    }

    #[test]
    fn test_node_wire_format() {
        let node = Node::new("n1", "10.0.0.1", 8080).with_capabilities([CAP_HTTP_SCRAPING]);
        let json = serde_json::to_value(&node).unwrap();

        assert_eq!(json["status"], "active");
        assert_eq!(json["capabilities"][0], "http_scraping");
        assert_eq!(json["load"]["active_jobs"], 0);
        assert!(json["last_seen"].is_string());
    }

    #[test]
    fn test_event_kind_wire_names() {
        let json = serde_json::to_string(&NodeEventKind::Failed).unwrap();
        assert_eq!(json, "\"node_failed\"");
        assert!(NodeEventKind::Left.is_departure());
        assert!(!NodeEventKind::Updated.is_departure());
    }
}

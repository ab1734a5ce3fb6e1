//! Job wire type

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{QueueError, QueueResult};

/// Highest priority tier
pub const MAX_PRIORITY: u8 = 10;

/// Default redelivery budget of a job
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// A unit of scraping work
///
/// The JSON form is stable across versions:
/// `{ id, type, priority, requirements, payload, created_at, scheduled_at,
/// assigned_to, retry, max_retries }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,

    #[serde(rename = "type")]
    pub job_type: String,

    /// Tier in `0..=10`, higher runs first
    pub priority: u8,

    /// Capabilities a node must advertise to run the job
    #[serde(default)]
    pub requirements: Vec<String>,

    /// Opaque to the scheduler
    #[serde(default)]
    pub payload: Value,

    pub created_at: DateTime<Utc>,

    /// Time of the most recent (re)enqueue
    pub scheduled_at: DateTime<Utc>,

    /// Node the job was last assigned to; cleared on failure-triggered requeue
    #[serde(default)]
    pub assigned_to: Option<String>,

    #[serde(default)]
    pub retry: u32,

    pub max_retries: u32,
}

impl Job {
    /// Create an unassigned job with a fresh id
    pub fn new(job_type: impl Into<String>, priority: u8) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_type: job_type.into(),
            priority,
            requirements: Vec::new(),
            payload: Value::Null,
            created_at: now,
            scheduled_at: now,
            assigned_to: None,
            retry: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_requirements<I, S>(mut self, requirements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requirements = requirements.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Whether another delivery attempt is allowed after a failure
    pub fn can_retry(&self) -> bool {
        self.retry < self.max_retries
    }

    pub fn is_assigned(&self) -> bool {
        self.assigned_to.is_some()
    }

    /// Reject jobs that cannot be routed to a tier
    pub fn validate(&self) -> QueueResult<()> {
        if self.priority > MAX_PRIORITY {
            return Err(QueueError::InvalidPriority(self.priority));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> QueueResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| QueueError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> QueueResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| QueueError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_wire_format() {
        let job = Job::new("scrape", 5)
            .with_id("job-1")
            .with_requirements(["http_scraping"])
            .with_payload(json!({"url": "https://example.com"}));

        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["id"], "job-1");
        assert_eq!(value["type"], "scrape");
        assert_eq!(value["priority"], 5);
        assert_eq!(value["requirements"], json!(["http_scraping"]));
        assert_eq!(value["assigned_to"], Value::Null);
        assert_eq!(value["retry"], 0);
        assert_eq!(value["max_retries"], 3);
        assert!(value["created_at"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_decode_minimal() {
        let raw = br#"{
            "id": "j", "type": "scrape", "priority": 2,
            "created_at": "2024-05-01T10:00:00Z",
            "scheduled_at": "2024-05-01T10:00:00Z",
            "max_retries": 1
        }"#;
        let job = Job::from_bytes(raw).unwrap();
        assert!(job.requirements.is_empty());
        assert!(!job.is_assigned());
        assert!(job.can_retry());
    }

    #[test]
    fn test_can_retry_budget() {
        let mut job = Job::new("scrape", 1).with_max_retries(2);
        job.retry = 2;
        assert!(!job.can_retry());
    }

    #[test]
    fn test_invalid_priority() {
        let job = Job::new("scrape", 11);
        assert_eq!(job.validate(), Err(QueueError::InvalidPriority(11)));
    }

    proptest! {
        #[test]
        fn prop_priority_in_range_is_valid(priority in 0u8..=MAX_PRIORITY) {
            prop_assert!(Job::new("scrape", priority).validate().is_ok());
        }

        #[test]
        fn prop_priority_out_of_range_is_rejected(priority in (MAX_PRIORITY + 1)..=u8::MAX) {
            prop_assert!(Job::new("scrape", priority).validate().is_err());
        }
    }
}

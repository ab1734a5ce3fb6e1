//! Error types for the cluster module

use thiserror::Error;

use crate::coordination::StoreError;

/// Result type for cluster operations
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Registry, election and scheduling errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClusterError {
    /// Backing store unreachable after the local retry budget
    #[error("Coordination store unavailable during '{operation}': {reason}")]
    CoordinationUnavailable { operation: String, reason: String },

    /// A lease this process relied on no longer exists
    #[error("Lease expired: {lease}")]
    LeaseExpired { lease: String },

    /// No live node satisfies the job's requirements right now
    #[error("No suitable node for job {job_id} (requirements: [{}])", .requirements.join(", "))]
    NoSuitableNode {
        job_id: String,
        requirements: Vec<String>,
    },

    /// A newer leader already recorded this job's assignment
    #[error("Assignment of job {job_id} held by {held_by} with newer fencing token {fencing_token}")]
    AssignmentConflict {
        job_id: String,
        held_by: String,
        fencing_token: u64,
    },

    /// Operation requires leadership
    #[error("Node {node_id} is not the leader")]
    NotLeader { node_id: String },

    /// Node missing from the registry
    #[error("Node not found: {node_id}")]
    NodeNotFound { node_id: String },

    /// Registration rejected
    #[error("Invalid node '{node_id}': {reason}")]
    InvalidNode { node_id: String, reason: String },

    /// Stored value could not be decoded or encoded
    #[error("Corrupt entry at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl ClusterError {
    /// Map a store failure observed during `operation`
    pub fn from_store(operation: impl Into<String>, err: StoreError) -> Self {
        match err {
            StoreError::LeaseExpired(lease) => Self::LeaseExpired {
                lease: lease.to_string(),
            },
            StoreError::Unavailable(reason) | StoreError::Backend(reason) => {
                Self::CoordinationUnavailable {
                    operation: operation.into(),
                    reason,
                }
            }
        }
    }

    pub fn no_suitable_node(job_id: impl Into<String>, requirements: &[String]) -> Self {
        Self::NoSuitableNode {
            job_id: job_id.into(),
            requirements: requirements.to_vec(),
        }
    }

    pub fn corrupt(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::Corrupt {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if the error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::CoordinationUnavailable { .. }
                | Self::LeaseExpired { .. }
                | Self::NoSuitableNode { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::LeaseId;

    #[test]
    fn test_from_store_mapping() {
        let err = ClusterError::from_store("list", StoreError::Unavailable("refused".into()));
        assert!(matches!(
            err,
            ClusterError::CoordinationUnavailable { ref operation, .. } if operation == "list"
        ));

        let err = ClusterError::from_store("put", StoreError::LeaseExpired(LeaseId(4)));
        assert_eq!(
            err,
            ClusterError::LeaseExpired {
                lease: "lease-4".to_string()
            }
        );
    }

    #[test]
    fn test_no_suitable_node_message() {
        let err = ClusterError::no_suitable_node("job-1", &["browser_scraping".to_string()]);
        assert!(err.to_string().contains("browser_scraping"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_conflict_not_recoverable() {
        let err = ClusterError::AssignmentConflict {
            job_id: "j".into(),
            held_by: "n2".into(),
            fencing_token: 7,
        };
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains('7'));
    }
}

pub mod cfg;

use chrono::{DateTime, Utc};
use ethers::types::U256;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Stopped
        )
    }

    /// Allowed moves: Queued -> Running | Stopped, Running -> any terminal state.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Queued, JobStatus::Running) => true,
            (JobStatus::Queued, JobStatus::Stopped) => true,
            (JobStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: JobStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    #[serde(rename = "jobID")]
    pub id: String,
    pub status: JobStatus,
    pub start: u64,
    pub end: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub blocks_fetched: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub history: Vec<StatusChange>,
}

impl Job {
    pub fn new(id: String, start: u64, end: u64) -> Self {
        let now = Utc::now();
        Job {
            id,
            status: JobStatus::Queued,
            start,
            end,
            created_at: now,
            updated_at: now,
            completed_at: None,
            blocks_fetched: 0,
            error: None,
            history: vec![StatusChange {
                status: JobStatus::Queued,
                at: now,
            }],
        }
    }

    pub fn block_count(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// One fetched block, one CSV row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub number: u64,
    // unix seconds
    pub timestamp: u64,
    pub gas_used: U256,
    // zero before London
    pub base_fee_per_gas: U256,
    pub transaction_count: usize,
    // sum of (gas_price - base_fee) * gas over the block's transactions, in wei
    pub tips: U256,
}

/// A contiguous, ascending run of records handed to the result writer.
pub struct BlockChunk {
    pub blocks: Vec<BlockRecord>,
}

/// Complete output of one job, ordered by block number.
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    pub blocks: Vec<BlockRecord>,
}

#[cfg(test)]
mod test {
    use crate::types::{Job, JobStatus};

    #[test]
    fn transitions_only_move_forward() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Queued.can_transition_to(Stopped));
        assert!(!Queued.can_transition_to(Completed));
        assert!(!Queued.can_transition_to(Failed));
        for next in [Completed, Failed, Stopped] {
            assert!(Running.can_transition_to(next));
        }
        assert!(!Running.can_transition_to(Queued));
        assert!(!Running.can_transition_to(Running));
        for done in [Completed, Failed, Stopped] {
            for next in [Queued, Running, Completed, Failed, Stopped] {
                assert!(!done.can_transition_to(next), "{done} -> {next}");
            }
        }
    }

    #[test]
    fn job_json_shape() {
        let job = Job::new("id-1".to_string(), 100, 104);
        assert_eq!(job.block_count(), 5);
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["jobID"], "id-1");
        assert_eq!(json["status"], "queued");
        assert_eq!(json["blocksFetched"], 0);
        assert!(json["completedAt"].is_null());
        assert!(json.get("error").is_none());
        assert_eq!(json["history"][0]["status"], "queued");
    }
}

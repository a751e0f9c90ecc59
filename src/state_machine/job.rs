use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::state::JobState;
use crate::error::FailureKind;
use crate::model::{FinalRecommendation, RepositoryRef};

/// Why a job ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub reason: String,
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)
    }
}

/// One repository's trip through the analysis pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: Uuid,
    pub repo: RepositoryRef,
    pub state: JobState,
    pub state_history: Vec<JobState>,
    pub failure: Option<JobFailure>,
    /// Set on Done, or on Skipped when the cache remembers the last result.
    pub recommendation: Option<FinalRecommendation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AnalysisJob {
    pub fn new(repo: RepositoryRef) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            repo,
            state: JobState::Pending,
            state_history: Vec::new(),
            failure: None,
            recommendation: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Record of a job in a terminal state, kept in the run summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub repo: String,
    pub state: JobState,
    pub state_transitions: Vec<JobState>,
    pub recommendation: Option<FinalRecommendation>,
    pub failure: Option<JobFailure>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl JobReport {
    pub fn from_job(job: &AnalysisJob) -> Self {
        let mut transitions = job.state_history.clone();
        transitions.push(job.state);

        Self {
            job_id: job.id,
            repo: job.repo.id.to_string(),
            state: job.state,
            state_transitions: transitions,
            recommendation: job.recommendation.clone(),
            failure: job.failure.clone(),
            started_at: job.created_at,
            completed_at: job.updated_at,
            duration_ms: (job.updated_at - job.created_at).num_milliseconds(),
        }
    }
}

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::job::{AnalysisJob, JobFailure};
use crate::error::{FailureKind, OrchestratorError};

/// Lifecycle of one analysis job.
///
/// PENDING → CACHE_CHECK → SKIPPED
///                       → FETCHING → ANALYZING → RECONCILING → DONE
///
/// FETCHING, ANALYZING and RECONCILING may fail; any non-terminal state may
/// be failed by cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    CacheCheck,
    Fetching,
    Analyzing,
    Reconciling,
    Done,
    Skipped,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Skipped | JobState::Failed)
    }

    /// Normal forward edges. Cancellation edges are handled by
    /// [`StateMachine::cancel`].
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, CacheCheck)
                | (CacheCheck, Skipped)
                | (CacheCheck, Fetching)
                | (Fetching, Analyzing)
                | (Fetching, Failed)
                | (Analyzing, Reconciling)
                | (Analyzing, Failed)
                | (Reconciling, Done)
                | (Reconciling, Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "PENDING"),
            JobState::CacheCheck => write!(f, "CACHE_CHECK"),
            JobState::Fetching => write!(f, "FETCHING"),
            JobState::Analyzing => write!(f, "ANALYZING"),
            JobState::Reconciling => write!(f, "RECONCILING"),
            JobState::Done => write!(f, "DONE"),
            JobState::Skipped => write!(f, "SKIPPED"),
            JobState::Failed => write!(f, "FAILED"),
        }
    }
}

/// A state change applied to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: JobState,
    pub to: JobState,
}

/// Applies validated transitions to an [`AnalysisJob`].
pub struct StateMachine;

impl StateMachine {
    /// Move `job` to `to`, rejecting edges the lifecycle does not allow.
    pub fn advance(job: &mut AnalysisJob, to: JobState) -> Result<Transition, OrchestratorError> {
        if !job.state.can_transition_to(to) {
            return Err(OrchestratorError::InvalidTransition(format!(
                "{}: {} -> {}",
                job.repo.id, job.state, to
            )));
        }
        Ok(Self::apply(job, to))
    }

    /// Fail `job` from one of the states allowed to fail.
    pub fn fail(
        job: &mut AnalysisJob,
        kind: FailureKind,
        reason: impl Into<String>,
    ) -> Result<Transition, OrchestratorError> {
        let transition = Self::advance(job, JobState::Failed)?;
        job.failure = Some(JobFailure {
            kind,
            reason: reason.into(),
        });
        Ok(transition)
    }

    /// Fail a non-terminal job as cancelled. Terminal jobs are left alone.
    pub fn cancel(job: &mut AnalysisJob, reason: impl Into<String>) -> Option<Transition> {
        if job.state.is_terminal() {
            return None;
        }
        let transition = Self::apply(job, JobState::Failed);
        job.failure = Some(JobFailure {
            kind: FailureKind::Cancelled,
            reason: reason.into(),
        });
        Some(transition)
    }

    fn apply(job: &mut AnalysisJob, to: JobState) -> Transition {
        let from = job.state;
        job.state_history.push(from);
        job.state = to;
        job.updated_at = Utc::now();
        Transition { from, to }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RepoId, RepositoryRef};

    fn make_job() -> AnalysisJob {
        AnalysisJob::new(RepositoryRef::new(RepoId::new("octo", "widgets"), Utc::now()))
    }

    #[test]
    fn happy_path_walks_all_states() {
        let mut job = make_job();
        assert_eq!(job.state, JobState::Pending);

        for next in [
            JobState::CacheCheck,
            JobState::Fetching,
            JobState::Analyzing,
            JobState::Reconciling,
            JobState::Done,
        ] {
            let t = StateMachine::advance(&mut job, next).unwrap();
            assert_eq!(t.to, next);
            assert_eq!(job.state, next);
        }
        assert!(job.state.is_terminal());
        assert_eq!(
            job.state_history,
            vec![
                JobState::Pending,
                JobState::CacheCheck,
                JobState::Fetching,
                JobState::Analyzing,
                JobState::Reconciling,
            ]
        );
    }

    #[test]
    fn cache_hit_skips() {
        let mut job = make_job();
        StateMachine::advance(&mut job, JobState::CacheCheck).unwrap();
        StateMachine::advance(&mut job, JobState::Skipped).unwrap();
        assert!(job.state.is_terminal());
    }

    #[test]
    fn illegal_edges_are_rejected() {
        let mut job = make_job();
        assert!(StateMachine::advance(&mut job, JobState::Analyzing).is_err());
        assert!(StateMachine::advance(&mut job, JobState::Failed).is_err());
        assert_eq!(job.state, JobState::Pending);
        assert!(job.state_history.is_empty());

        StateMachine::advance(&mut job, JobState::CacheCheck).unwrap();
        StateMachine::advance(&mut job, JobState::Skipped).unwrap();
        assert!(StateMachine::advance(&mut job, JobState::Fetching).is_err());
    }

    #[test]
    fn fetch_failure_records_reason() {
        let mut job = make_job();
        StateMachine::advance(&mut job, JobState::CacheCheck).unwrap();
        StateMachine::advance(&mut job, JobState::Fetching).unwrap();
        StateMachine::fail(&mut job, FailureKind::Transient, "503 three times").unwrap();
        assert_eq!(job.state, JobState::Failed);
        let failure = job.failure.as_ref().unwrap();
        assert_eq!(failure.kind, FailureKind::Transient);
        assert_eq!(failure.reason, "503 three times");
    }

    #[test]
    fn cancel_only_touches_non_terminal_jobs() {
        let mut pending = make_job();
        let t = StateMachine::cancel(&mut pending, "interrupted").unwrap();
        assert_eq!(t, Transition { from: JobState::Pending, to: JobState::Failed });
        assert_eq!(pending.failure.as_ref().unwrap().kind, FailureKind::Cancelled);

        let mut skipped = make_job();
        StateMachine::advance(&mut skipped, JobState::CacheCheck).unwrap();
        StateMachine::advance(&mut skipped, JobState::Skipped).unwrap();
        assert!(StateMachine::cancel(&mut skipped, "interrupted").is_none());
        assert!(skipped.failure.is_none());
    }

    #[test]
    fn state_display() {
        assert_eq!(JobState::CacheCheck.to_string(), "CACHE_CHECK");
        assert_eq!(JobState::Reconciling.to_string(), "RECONCILING");
        assert_eq!(JobState::Failed.to_string(), "FAILED");
    }
}

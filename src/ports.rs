//! Collaborator interfaces consumed by the orchestrator.
//!
//! Concrete adapters (GitHub, Anthropic, JSON report files) hold their clients
//! by composition and implement these traits.

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use crate::error::ServiceError;
use crate::judgment::AnalysisJudgment;
use crate::model::{FinalRecommendation, RepoId, RepositoryData, RepositoryRef};
use crate::state_machine::JobState;

#[async_trait]
pub trait SourceControlPort: Send + Sync {
    /// Repositories owned by `owner`, most recently updated first.
    async fn list_repositories(&self, owner: &str, limit: usize) -> Result<Vec<RepositoryRef>, ServiceError>;

    /// Languages, recent commits, contributors and README for one repository.
    async fn fetch_repository_data(&self, repo: &RepositoryRef) -> Result<RepositoryData, ServiceError>;
}

#[async_trait]
pub trait AnalyzerPort: Send + Sync {
    async fn analyze(&self, repo: &RepositoryRef, data: &RepositoryData) -> Result<AnalysisJudgment, ServiceError>;
}

/// Receives one event per job state transition.
///
/// Called from worker tasks; implementations must return quickly.
pub trait ProgressReporter: Send + Sync {
    fn on_transition(&self, job_id: Uuid, repo: &RepoId, from: JobState, to: JobState);
}

#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Called exactly once per job that reaches Done. `judgment` has already
    /// been sanitized.
    async fn persist(
        &self,
        repo: &RepositoryRef,
        recommendation: &FinalRecommendation,
        judgment: &AnalysisJudgment,
        data: &RepositoryData,
    ) -> Result<()>;
}

/// Reporter that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn on_transition(&self, _job_id: Uuid, _repo: &RepoId, _from: JobState, _to: JobState) {}
}

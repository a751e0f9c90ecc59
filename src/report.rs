//! Report sinks and a tracing-backed progress reporter.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::judgment::{AnalysisJudgment, Recommendation};
use crate::model::{FinalRecommendation, RepoId, RepositoryData, RepositoryRef};
use crate::ports::{ProgressReporter, ReportSink};
use crate::state_machine::JobState;

/// Per-repository report document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryReport {
    pub repository: RepositoryRef,
    pub recommendation: FinalRecommendation,
    pub analysis: AnalysisJudgment,
    /// High-priority subset of `analysis.recommendations`.
    #[serde(default)]
    pub priorities: Vec<Recommendation>,
    pub data: RepositoryData,
    pub generated_at: DateTime<Utc>,
}

/// Writes `<dir>/<owner>__<name>.json` for every completed job.
#[derive(Debug, Clone)]
pub struct JsonReportSink {
    dir: PathBuf,
}

impl JsonReportSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, repo: &RepoId) -> PathBuf {
        self.dir.join(format!("{}__{}.json", repo.owner, repo.name))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl ReportSink for JsonReportSink {
    async fn persist(
        &self,
        repo: &RepositoryRef,
        recommendation: &FinalRecommendation,
        judgment: &AnalysisJudgment,
        data: &RepositoryData,
    ) -> Result<()> {
        let report = RepositoryReport {
            repository: repo.clone(),
            recommendation: recommendation.clone(),
            analysis: judgment.clone(),
            priorities: judgment.high_priority().cloned().collect(),
            data: data.clone(),
            generated_at: Utc::now(),
        };
        let path = self.path_for(&repo.id);
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        tokio::fs::write(&path, serde_json::to_vec_pretty(&report)?)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        debug!(repo = %repo.id, path = %path.display(), "report written");
        Ok(())
    }
}

/// Reads every report in `dir`, ordered by repository. Files that do not
/// parse as a report are skipped with a warning. A missing directory holds no
/// reports.
pub fn load_reports(dir: &Path) -> Result<Vec<RepositoryReport>> {
    let mut reports = Vec::new();
    for path in report_files(dir)? {
        let parsed = std::fs::read(&path)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| Ok(serde_json::from_slice::<RepositoryReport>(&bytes)?));
        match parsed {
            Ok(report) => reports.push(report),
            Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable report"),
        }
    }
    reports.sort_by(|a, b| a.repository.id.cmp(&b.repository.id));
    Ok(reports)
}

/// Deletes every `*.json` report in `dir`, returning how many were removed.
pub fn remove_reports(dir: &Path) -> Result<usize> {
    let files = report_files(dir)?;
    for path in &files {
        std::fs::remove_file(path).with_context(|| format!("failed to remove {}", path.display()))?;
    }
    Ok(files.len())
}

fn report_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    Ok(files)
}

/// Logs every transition; terminal ones at info, the rest at debug.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn on_transition(&self, job_id: Uuid, repo: &RepoId, from: JobState, to: JobState) {
        if to.is_terminal() {
            info!(%job_id, %repo, %from, %to, "job finished");
        } else {
            debug!(%job_id, %repo, %from, %to, "job transition");
        }
    }
}

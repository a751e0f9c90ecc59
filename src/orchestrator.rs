//! Worker pool that drives every repository's [`AnalysisJob`] to a terminal
//! state.
//!
//! Jobs live in an arena indexed by position; workers pull indices from a
//! shared queue and own one job at a time. Until the first job has talked to
//! the network the pool runs a single worker, so bad credentials abort the run
//! before it fans out.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::AnalysisCache;
use crate::error::{FailureKind, OrchestratorError, ServiceError};
use crate::judgment::AnalysisJudgment;
use crate::model::{Action, FinalRecommendation, RepoId, RepositoryData, RepositoryRef};
use crate::ports::{AnalyzerPort, NoopReporter, ProgressReporter, ReportSink, SourceControlPort};
use crate::rate_limit::{RateLimiter, ServiceId};
use crate::recommender::ActionRecommender;
use crate::retry::{RetryError, RetryExecutor, RetryPolicy};
use crate::state_machine::{AnalysisJob, JobReport, JobState, StateMachine};

/// Run-level knobs. Built from [`Config`](crate::config::Config) by the binary.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_workers: usize,
    pub force_reanalysis: bool,
    /// Longest a worker waits for a rate-limit token.
    pub acquire_timeout: Duration,
    /// Bound on a single adapter call, independent of retries.
    pub call_timeout: Duration,
    /// How long in-flight jobs may keep running after cancellation.
    pub grace_period: Duration,
    pub source_control_retry: RetryPolicy,
    pub analysis_retry: RetryPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_workers: 5,
            force_reanalysis: false,
            acquire_timeout: Duration::from_secs(120),
            call_timeout: Duration::from_secs(60),
            grace_period: Duration::from_secs(10),
            source_control_retry: RetryPolicy::default(),
            analysis_retry: RetryPolicy::default(),
        }
    }
}

/// A job that ended in `Failed`.
#[derive(Debug, Clone, Serialize)]
pub struct FailedRepo {
    pub repo: RepoId,
    pub kind: FailureKind,
    pub reason: String,
}

/// Outcome of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub completed: usize,
    pub skipped: usize,
    pub failures: Vec<FailedRepo>,
    /// Repositories dropped because their identity appeared earlier.
    pub duplicates: usize,
    pub jobs: Vec<JobReport>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    pub fn total(&self) -> usize {
        self.jobs.len()
    }

    /// Final action per job that has one (Done, or Skipped with a cached
    /// recommendation).
    pub fn by_action(&self) -> BTreeMap<Action, usize> {
        let mut counts = BTreeMap::new();
        for rec in self.jobs.iter().filter_map(|j| j.recommendation.as_ref()) {
            *counts.entry(rec.action).or_insert(0) += 1;
        }
        counts
    }

    pub fn recommendation_for(&self, repo: &RepoId) -> Option<&FinalRecommendation> {
        let key = repo.to_string();
        self.jobs
            .iter()
            .find(|j| j.repo == key)
            .and_then(|j| j.recommendation.as_ref())
    }
}

pub struct Orchestrator {
    shared: Arc<Shared>,
}

struct Shared {
    config: OrchestratorConfig,
    source: Arc<dyn SourceControlPort>,
    analyzer: Arc<dyn AnalyzerPort>,
    sink: Arc<dyn ReportSink>,
    reporter: Arc<dyn ProgressReporter>,
    limiter: Arc<RateLimiter>,
    cache: AnalysisCache,
    recommender: ActionRecommender,
    source_retry: RetryExecutor,
    analysis_retry: RetryExecutor,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        source: Arc<dyn SourceControlPort>,
        analyzer: Arc<dyn AnalyzerPort>,
        sink: Arc<dyn ReportSink>,
        limiter: Arc<RateLimiter>,
        cache: AnalysisCache,
    ) -> Self {
        let source_retry =
            RetryExecutor::new(ServiceId::SourceControl).with_limiter(Arc::clone(&limiter));
        let analysis_retry = RetryExecutor::new(ServiceId::Analysis).with_limiter(Arc::clone(&limiter));
        Self {
            shared: Arc::new(Shared {
                config,
                source,
                analyzer,
                sink,
                reporter: Arc::new(NoopReporter),
                limiter,
                cache,
                recommender: ActionRecommender::default(),
                source_retry,
                analysis_retry,
            }),
        }
    }

    /// Must be called before the first run.
    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.reporter = reporter;
        }
        self
    }

    /// Must be called before the first run.
    pub fn with_recommender(mut self, recommender: ActionRecommender) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.recommender = recommender;
        }
        self
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.shared.limiter
    }

    /// List `owner`'s repositories, optionally narrowed to a single name.
    pub async fn enumerate(
        &self,
        owner: &str,
        limit: usize,
        only: Option<&str>,
    ) -> Result<Vec<RepositoryRef>, OrchestratorError> {
        let shared = &self.shared;
        let repos = shared
            .source_retry
            .run(&shared.config.source_control_retry, |attempt| async move {
                debug!(owner, attempt, "listing repositories");
                shared.acquire(ServiceId::SourceControl).await?;
                shared
                    .bounded(shared.source.list_repositories(owner, limit))
                    .await
            })
            .await?;
        info!(owner, count = repos.len(), "repositories enumerated");

        let Some(name) = only else {
            return Ok(repos);
        };
        let matching: Vec<_> = repos.into_iter().filter(|r| r.id.name == name).collect();
        if matching.is_empty() {
            return Err(OrchestratorError::RepositoryNotFound {
                owner: owner.to_string(),
                name: name.to_string(),
            });
        }
        Ok(matching)
    }

    /// Drive one job per distinct repository to a terminal state.
    ///
    /// Returns `Err` only for run-level failures: an authentication failure on
    /// the first networked job, or a broken worker. Per-job failures are
    /// listed in the summary.
    pub async fn run(
        &self,
        repos: Vec<RepositoryRef>,
        cancel: CancellationToken,
    ) -> Result<RunSummary, OrchestratorError> {
        let started = Instant::now();
        let (arena, duplicates) = JobArena::new(repos);
        let arena = Arc::new(arena);
        let workers = self.shared.config.max_workers.max(1);
        info!(
            jobs = arena.len(),
            duplicates,
            workers,
            force = self.shared.config.force_reanalysis,
            "starting analysis run"
        );

        let mut probe = JoinSet::new();
        probe.spawn(worker_loop(
            Arc::clone(&self.shared),
            Arc::clone(&arena),
            cancel.clone(),
            true,
        ));
        if let Some(auth) = self.join(probe, &cancel).await? {
            error!(repo = %auth.repo, error = %auth.message, "authentication failed, aborting run");
            arena.cancel_remaining(self.shared.reporter.as_ref(), "run aborted: authentication failed");
            return Err(OrchestratorError::Authentication {
                repo: auth.repo.to_string(),
                message: auth.message,
            });
        }

        let mut pool = JoinSet::new();
        for _ in 0..workers {
            pool.spawn(worker_loop(
                Arc::clone(&self.shared),
                Arc::clone(&arena),
                cancel.clone(),
                false,
            ));
        }
        self.join(pool, &cancel).await?;

        let cancelled = arena.cancel_remaining(self.shared.reporter.as_ref(), "run cancelled");
        if cancelled > 0 {
            warn!(cancelled, "jobs cancelled before completion");
        }

        let summary = arena.summary(duplicates, started.elapsed());
        info!(
            completed = summary.completed,
            skipped = summary.skipped,
            failed = summary.failed(),
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "analysis run finished"
        );
        Ok(summary)
    }

    /// Wait for every worker. Once `cancel` fires, workers get
    /// `grace_period` to finish their current job before being aborted.
    async fn join(
        &self,
        mut workers: JoinSet<Result<Option<AuthFailure>, OrchestratorError>>,
        cancel: &CancellationToken,
    ) -> Result<Option<AuthFailure>, OrchestratorError> {
        let grace = self.shared.config.grace_period;
        let deadline = async {
            cancel.cancelled().await;
            sleep(grace).await;
        };
        tokio::pin!(deadline);

        let mut auth = None;
        loop {
            tokio::select! {
                joined = workers.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(found))) => auth = auth.or(found),
                    Some(Ok(Err(err))) => {
                        workers.abort_all();
                        return Err(err);
                    }
                    Some(Err(err)) if err.is_cancelled() => {}
                    Some(Err(err)) => {
                        workers.abort_all();
                        return Err(err.into());
                    }
                },
                _ = &mut deadline => {
                    warn!(grace_ms = grace.as_millis() as u64, "grace period elapsed, aborting in-flight jobs");
                    workers.abort_all();
                    while workers.join_next().await.is_some() {}
                    break;
                }
            }
        }
        Ok(auth)
    }
}

struct AuthFailure {
    repo: RepoId,
    message: String,
}

enum JobEnd {
    Skipped,
    Done,
    Failed(Option<AuthFailure>),
}

/// Pull jobs until the queue is empty or the run is cancelled. A probing
/// worker stops after the first job that reached the network.
async fn worker_loop(
    shared: Arc<Shared>,
    arena: Arc<JobArena>,
    cancel: CancellationToken,
    probe: bool,
) -> Result<Option<AuthFailure>, OrchestratorError> {
    while !cancel.is_cancelled() {
        let Some(idx) = arena.next_job() else {
            break;
        };
        match shared.process(&arena, idx).await? {
            JobEnd::Skipped => {}
            JobEnd::Failed(Some(auth)) if probe => return Ok(Some(auth)),
            JobEnd::Done | JobEnd::Failed(_) if probe => return Ok(None),
            JobEnd::Done | JobEnd::Failed(_) => {}
        }
    }
    Ok(None)
}

impl Shared {
    async fn process(&self, arena: &JobArena, idx: usize) -> Result<JobEnd, OrchestratorError> {
        let repo = arena.repo(idx);
        self.transition(arena, idx, JobState::CacheCheck)?;

        if let Some(entry) = self.cache.fresh_entry(&repo, self.config.force_reanalysis) {
            arena.jobs()[idx].recommendation = Some(entry.recommendation);
            self.transition(arena, idx, JobState::Skipped)?;
            debug!(repo = %repo.id, "unchanged since last analysis, skipping");
            return Ok(JobEnd::Skipped);
        }

        self.transition(arena, idx, JobState::Fetching)?;
        let data = match self.fetch(&repo).await {
            Ok(data) => data,
            Err(err) => return self.fail_retry(arena, idx, err),
        };

        self.transition(arena, idx, JobState::Analyzing)?;
        let judgment = match self.analyze(&repo, &data).await {
            Ok(judgment) => judgment,
            Err(err) => return self.fail_retry(arena, idx, err),
        };

        self.transition(arena, idx, JobState::Reconciling)?;
        let recommendation = self.recommender.reconcile(&repo, &judgment);
        if let Err(err) = self.sink.persist(&repo, &recommendation, &judgment, &data).await {
            let reason = format!("report sink: {err:#}");
            self.fail(arena, idx, FailureKind::Permanent, reason)?;
            return Ok(JobEnd::Failed(None));
        }
        arena.jobs()[idx].recommendation = Some(recommendation.clone());
        self.transition(arena, idx, JobState::Done)?;

        if let Err(err) = self.cache.record(&repo, &recommendation, Utc::now()) {
            warn!(repo = %repo.id, error = %err, "failed to record analysis in cache");
        }
        info!(
            repo = %repo.id,
            action = %recommendation.action,
            source = ?recommendation.source,
            "analysis complete"
        );
        Ok(JobEnd::Done)
    }

    async fn fetch(&self, repo: &RepositoryRef) -> Result<RepositoryData, RetryError> {
        self.source_retry
            .run(&self.config.source_control_retry, |attempt| async move {
                debug!(repo = %repo.id, attempt, "fetching repository data");
                self.acquire(ServiceId::SourceControl).await?;
                self.bounded(self.source.fetch_repository_data(repo)).await
            })
            .await
    }

    async fn analyze(
        &self,
        repo: &RepositoryRef,
        data: &RepositoryData,
    ) -> Result<AnalysisJudgment, RetryError> {
        self.analysis_retry
            .run(&self.config.analysis_retry, |attempt| async move {
                debug!(repo = %repo.id, attempt, "requesting analysis");
                self.acquire(ServiceId::Analysis).await?;
                self.bounded(self.analyzer.analyze(repo, data))
                    .await?
                    .sanitize()
            })
            .await
    }

    async fn acquire(&self, service: ServiceId) -> Result<(), ServiceError> {
        self.limiter
            .acquire(service, self.config.acquire_timeout)
            .await?;
        Ok(())
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, ServiceError>>,
    ) -> Result<T, ServiceError> {
        match timeout(self.config.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Transient(format!(
                "call timed out after {}s",
                self.config.call_timeout.as_secs()
            ))),
        }
    }

    fn transition(&self, arena: &JobArena, idx: usize, to: JobState) -> Result<(), OrchestratorError> {
        let (id, repo, t) = {
            let mut jobs = arena.jobs();
            let job = &mut jobs[idx];
            let t = StateMachine::advance(job, to)?;
            (job.id, job.repo.id.clone(), t)
        };
        self.reporter.on_transition(id, &repo, t.from, t.to);
        Ok(())
    }

    fn fail(
        &self,
        arena: &JobArena,
        idx: usize,
        kind: FailureKind,
        reason: String,
    ) -> Result<(), OrchestratorError> {
        let (id, repo, t) = {
            let mut jobs = arena.jobs();
            let job = &mut jobs[idx];
            let t = StateMachine::fail(job, kind, reason.clone())?;
            (job.id, job.repo.id.clone(), t)
        };
        warn!(repo = %repo, %kind, reason = %reason, "job failed");
        self.reporter.on_transition(id, &repo, t.from, t.to);
        Ok(())
    }

    fn fail_retry(
        &self,
        arena: &JobArena,
        idx: usize,
        err: RetryError,
    ) -> Result<JobEnd, OrchestratorError> {
        let kind = FailureKind::from(&err.last);
        let reason = if err.attempts > 1 {
            format!("{} (after {} attempts)", err.last, err.attempts)
        } else {
            err.last.to_string()
        };
        self.fail(arena, idx, kind, reason)?;

        let auth = err.last.is_unauthorized().then(|| AuthFailure {
            repo: arena.repo(idx).id,
            message: err.last.to_string(),
        });
        Ok(JobEnd::Failed(auth))
    }
}

/// Jobs for one run, deduplicated by repository identity.
struct JobArena {
    jobs: Mutex<Vec<AnalysisJob>>,
    index: HashMap<RepoId, usize>,
    queue: Mutex<VecDeque<usize>>,
}

impl JobArena {
    /// The first occurrence of a repository wins; later ones are counted.
    fn new(repos: Vec<RepositoryRef>) -> (Self, usize) {
        let mut jobs = Vec::with_capacity(repos.len());
        let mut index = HashMap::with_capacity(repos.len());
        let mut duplicates = 0;
        for repo in repos {
            if index.contains_key(&repo.id) {
                warn!(repo = %repo.id, "duplicate repository dropped");
                duplicates += 1;
                continue;
            }
            index.insert(repo.id.clone(), jobs.len());
            jobs.push(AnalysisJob::new(repo));
        }
        let queue = (0..jobs.len()).collect();
        let arena = Self {
            jobs: Mutex::new(jobs),
            index,
            queue: Mutex::new(queue),
        };
        (arena, duplicates)
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn jobs(&self) -> MutexGuard<'_, Vec<AnalysisJob>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_job(&self) -> Option<usize> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
    }

    fn repo(&self, idx: usize) -> RepositoryRef {
        self.jobs()[idx].repo.clone()
    }

    /// Fail every non-terminal job as cancelled, dispatched or not.
    fn cancel_remaining(&self, reporter: &dyn ProgressReporter, reason: &str) -> usize {
        let events: Vec<_> = {
            let mut jobs = self.jobs();
            jobs.iter_mut()
                .filter_map(|job| {
                    StateMachine::cancel(job, reason).map(|t| (job.id, job.repo.id.clone(), t))
                })
                .collect()
        };
        for (id, repo, t) in &events {
            reporter.on_transition(*id, repo, t.from, t.to);
        }
        events.len()
    }

    fn summary(&self, duplicates: usize, elapsed: Duration) -> RunSummary {
        let jobs = self.jobs();
        let mut summary = RunSummary {
            completed: 0,
            skipped: 0,
            failures: Vec::new(),
            duplicates,
            jobs: jobs.iter().map(JobReport::from_job).collect(),
            elapsed,
        };
        for job in jobs.iter() {
            match job.state {
                JobState::Done => summary.completed += 1,
                JobState::Skipped => summary.skipped += 1,
                JobState::Failed => {
                    if let Some(failure) = &job.failure {
                        summary.failures.push(FailedRepo {
                            repo: job.repo.id.clone(),
                            kind: failure.kind,
                            reason: failure.reason.clone(),
                        });
                    }
                }
                _ => {}
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheEntry, CacheStore, MemoryCacheStore};
    use crate::judgment::Recommendation;
    use crate::model::RecommendationSource;
    use crate::rate_limit::BucketConfig;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration};
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use tokio::sync::Semaphore;
    use uuid::Uuid;

    // --- Fakes ---

    #[derive(Default)]
    struct FakeSource {
        listing: Vec<RepositoryRef>,
        failures: HashMap<String, ServiceError>,
        gate: Option<Arc<Semaphore>>,
        fetches: Mutex<HashMap<String, u32>>,
    }

    impl FakeSource {
        fn fetches_for(&self, name: &str) -> u32 {
            self.fetches.lock().unwrap().get(name).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl SourceControlPort for FakeSource {
        async fn list_repositories(
            &self,
            _owner: &str,
            limit: usize,
        ) -> Result<Vec<RepositoryRef>, ServiceError> {
            Ok(self.listing.iter().take(limit).cloned().collect())
        }

        async fn fetch_repository_data(
            &self,
            repo: &RepositoryRef,
        ) -> Result<RepositoryData, ServiceError> {
            *self
                .fetches
                .lock()
                .unwrap()
                .entry(repo.id.name.clone())
                .or_insert(0) += 1;
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            match self.failures.get(&repo.id.name) {
                Some(err) => Err(err.clone()),
                None => Ok(RepositoryData {
                    readme_excerpt: format!("# {}", repo.id.name),
                    ..Default::default()
                }),
            }
        }
    }

    struct FakeAnalyzer {
        judgment: AnalysisJudgment,
        calls: AtomicU32,
    }

    impl FakeAnalyzer {
        fn suggesting(action: &str) -> Self {
            Self {
                judgment: AnalysisJudgment {
                    summary: "A small utility.".into(),
                    strengths: vec!["focused".into(), "<strength>".into()],
                    recommendations: vec![Recommendation {
                        recommendation: "Add tests".into(),
                        reason: "none exist".into(),
                        priority: "High".into(),
                    }],
                    estimated_value: "Medium".into(),
                    activity_assessment: "Low".into(),
                    recommended_action: action.into(),
                    action_reasoning: "still useful".into(),
                    ..Default::default()
                },
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl AnalyzerPort for FakeAnalyzer {
        async fn analyze(
            &self,
            _repo: &RepositoryRef,
            _data: &RepositoryData,
        ) -> Result<AnalysisJudgment, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.judgment.clone())
        }
    }

    #[derive(Default)]
    struct MemorySink {
        persisted: Mutex<Vec<RepoId>>,
        judgments: Mutex<Vec<AnalysisJudgment>>,
        fail: bool,
    }

    #[async_trait]
    impl ReportSink for MemorySink {
        async fn persist(
            &self,
            repo: &RepositoryRef,
            _recommendation: &FinalRecommendation,
            judgment: &AnalysisJudgment,
            _data: &RepositoryData,
        ) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("disk full");
            }
            self.persisted.lock().unwrap().push(repo.id.clone());
            self.judgments.lock().unwrap().push(judgment.clone());
            Ok(())
        }
    }

    /// Counts transitions and tracks how many jobs sit in Fetching or
    /// Analyzing at once.
    #[derive(Default)]
    struct CountingReporter {
        events: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ProgressReporter for CountingReporter {
        fn on_transition(&self, _job_id: Uuid, _repo: &RepoId, from: JobState, to: JobState) {
            self.events.fetch_add(1, Ordering::SeqCst);
            let busy = |s: JobState| matches!(s, JobState::Fetching | JobState::Analyzing);
            match (busy(from), busy(to)) {
                (false, true) => {
                    let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    self.max_in_flight.fetch_max(now, Ordering::SeqCst);
                }
                (true, false) => {
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                }
                _ => {}
            }
        }
    }

    // --- Helpers ---

    fn repo(name: &str, updated_at: DateTime<Utc>) -> RepositoryRef {
        RepositoryRef::new(RepoId::new("octo", name), updated_at)
    }

    fn days_ago(days: i64) -> DateTime<Utc> {
        Utc::now() - ChronoDuration::days(days)
    }

    fn fast_config(workers: usize) -> OrchestratorConfig {
        let retry = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            jitter: 0.0,
            ..Default::default()
        };
        OrchestratorConfig {
            max_workers: workers,
            grace_period: Duration::from_secs(1),
            source_control_retry: retry.clone(),
            analysis_retry: retry,
            ..Default::default()
        }
    }

    fn generous_limiter() -> Arc<RateLimiter> {
        let bucket = BucketConfig {
            capacity: 100,
            per_minute: 6000,
        };
        Arc::new(RateLimiter::for_services(bucket, bucket))
    }

    struct Harness {
        source: Arc<FakeSource>,
        analyzer: Arc<FakeAnalyzer>,
        sink: Arc<MemorySink>,
        reporter: Arc<CountingReporter>,
        cache: AnalysisCache,
    }

    impl Harness {
        fn new(source: FakeSource) -> Self {
            Self {
                source: Arc::new(source),
                analyzer: Arc::new(FakeAnalyzer::suggesting("KEEP")),
                sink: Arc::new(MemorySink::default()),
                reporter: Arc::new(CountingReporter::default()),
                cache: AnalysisCache::in_memory(),
            }
        }

        fn orchestrator(&self, config: OrchestratorConfig) -> Orchestrator {
            Orchestrator::new(
                config,
                self.source.clone(),
                self.analyzer.clone(),
                self.sink.clone(),
                generous_limiter(),
                self.cache.clone(),
            )
            .with_reporter(self.reporter.clone())
        }
    }

    fn cached(action: Action) -> FinalRecommendation {
        FinalRecommendation {
            action,
            reasoning: "from a previous run".into(),
            source: RecommendationSource::External,
        }
    }

    // --- Tests ---

    #[tokio::test(start_paused = true)]
    async fn skips_unchanged_and_analyzes_changed() {
        let harness = Harness::new(FakeSource::default());
        let t = days_ago(10);
        let alpha = repo("alpha", t - ChronoDuration::days(1));
        let beta = repo("beta", t + ChronoDuration::days(1));
        harness.cache.record(&alpha, &cached(Action::Pin), t).unwrap();
        harness.cache.record(&beta, &cached(Action::Pin), t).unwrap();

        let summary = harness
            .orchestrator(fast_config(2))
            .run(vec![alpha.clone(), beta.clone()], CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed(), 0);
        assert_eq!(harness.source.fetches_for("alpha"), 0);
        assert_eq!(harness.source.fetches_for("beta"), 1);
        assert_eq!(harness.analyzer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*harness.sink.persisted.lock().unwrap(), vec![beta.id.clone()]);
        {
            let judgments = harness.sink.judgments.lock().unwrap();
            assert_eq!(judgments.len(), 1);
            assert_eq!(judgments[0].strengths, vec!["focused".to_string()]);
            assert_eq!(judgments[0].high_priority().count(), 1);
        }

        // Skipped jobs carry the cached recommendation.
        assert_eq!(summary.recommendation_for(&alpha.id), Some(&cached(Action::Pin)));

        let entry = harness.cache.lookup(&beta).unwrap();
        assert!(entry.last_analyzed_at > t);
        assert_eq!(entry.recommendation.action, Action::Keep);
        assert_eq!(summary.recommendation_for(&beta.id), Some(&entry.recommendation));
    }

    #[tokio::test(start_paused = true)]
    async fn force_reanalyzes_everything() {
        let harness = Harness::new(FakeSource::default());
        let alpha = repo("alpha", days_ago(30));
        harness.cache.record(&alpha, &cached(Action::Pin), Utc::now()).unwrap();

        let mut config = fast_config(1);
        config.force_reanalysis = true;
        let summary = harness
            .orchestrator(config)
            .run(vec![alpha], CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.completed, 1);
        assert_eq!(harness.source.fetches_for("alpha"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_run_is_idempotent() {
        let harness = Harness::new(FakeSource::default());
        let repos = vec![
            repo("alpha", days_ago(3)),
            repo("beta", days_ago(2)),
            repo("gamma", days_ago(1)),
        ];
        let orch = harness.orchestrator(fast_config(2));

        let first = orch.run(repos.clone(), CancellationToken::new()).await.unwrap();
        assert_eq!(first.completed, 3);

        let second = orch.run(repos.clone(), CancellationToken::new()).await.unwrap();
        assert_eq!(second.completed, 0);
        assert_eq!(second.skipped, 3);
        assert_eq!(harness.analyzer.calls.load(Ordering::SeqCst), 3);
        for r in &repos {
            assert_eq!(harness.source.fetches_for(&r.id.name), 1);
            assert_eq!(first.recommendation_for(&r.id), second.recommendation_for(&r.id));
        }
        assert_eq!(first.by_action(), second.by_action());
    }

    #[tokio::test(start_paused = true)]
    async fn worker_pool_bounds_concurrency() {
        let gate = Arc::new(Semaphore::new(0));
        let harness = Harness::new(FakeSource {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let repos: Vec<_> = (0..6).map(|i| repo(&format!("r{i}"), days_ago(1))).collect();
        let orch = harness.orchestrator(fast_config(2));

        let run = tokio::spawn(async move { orch.run(repos, CancellationToken::new()).await });

        for _ in 0..6 {
            sleep(Duration::from_millis(50)).await;
            assert!(harness.reporter.in_flight.load(Ordering::SeqCst) <= 2);
            gate.add_permits(1);
        }

        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.completed, 6);
        assert_eq!(harness.reporter.max_in_flight.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn one_event_per_transition() {
        let harness = Harness::new(FakeSource::default());
        let t = days_ago(5);
        let alpha = repo("alpha", t - ChronoDuration::days(1));
        harness.cache.record(&alpha, &cached(Action::Keep), t).unwrap();

        let summary = harness
            .orchestrator(fast_config(3))
            .run(vec![alpha, repo("beta", days_ago(1))], CancellationToken::new())
            .await
            .unwrap();

        // Skipped: Pending→CacheCheck→Skipped. Done: five transitions.
        assert_eq!(harness.reporter.events.load(Ordering::SeqCst), 2 + 5);
        for job in &summary.jobs {
            assert!(job.state.is_terminal());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_jobs_do_not_abort_the_run() {
        let mut failures = HashMap::new();
        failures.insert("flaky".to_string(), ServiceError::Transient("502 bad gateway".into()));
        failures.insert("gone".to_string(), ServiceError::Permanent("status 404: not found".into()));
        failures.insert("locked".to_string(), ServiceError::Unauthorized("no access".into()));
        let harness = Harness::new(FakeSource {
            failures,
            ..Default::default()
        });
        let repos = vec![
            repo("ok", days_ago(1)),
            repo("flaky", days_ago(1)),
            repo("gone", days_ago(1)),
            repo("locked", days_ago(1)),
        ];

        let summary = harness
            .orchestrator(fast_config(2))
            .run(repos, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed(), 3);
        assert_eq!(harness.source.fetches_for("flaky"), 3);
        assert_eq!(harness.source.fetches_for("gone"), 1);
        assert_eq!(harness.source.fetches_for("locked"), 1);

        let kind_of = |name: &str| {
            summary
                .failures
                .iter()
                .find(|f| f.repo.name == name)
                .map(|f| f.kind)
        };
        assert_eq!(kind_of("flaky"), Some(FailureKind::Transient));
        assert_eq!(kind_of("gone"), Some(FailureKind::Permanent));
        assert_eq!(kind_of("locked"), Some(FailureKind::Permanent));
        assert!(harness.cache.lookup(&repo("flaky", days_ago(1))).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_first_job_aborts_the_run() {
        let mut failures = HashMap::new();
        failures.insert("first".to_string(), ServiceError::Unauthorized("bad token".into()));
        let harness = Harness::new(FakeSource {
            failures,
            ..Default::default()
        });
        let repos = vec![repo("first", days_ago(1)), repo("second", days_ago(1))];

        let err = harness
            .orchestrator(fast_config(4))
            .run(repos, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::Authentication { ref repo, .. } if repo == "octo/first"));
        assert_eq!(harness.source.fetches_for("second"), 0);
        assert!(harness.sink.persisted.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn skipped_jobs_do_not_count_as_first_networked_job() {
        let mut failures = HashMap::new();
        failures.insert("fresh".to_string(), ServiceError::Unauthorized("bad token".into()));
        let harness = Harness::new(FakeSource {
            failures,
            ..Default::default()
        });
        let t = days_ago(5);
        let cached_repo = repo("cached", t - ChronoDuration::days(1));
        harness.cache.record(&cached_repo, &cached(Action::Keep), t).unwrap();

        let err = harness
            .orchestrator(fast_config(2))
            .run(vec![cached_repo, repo("fresh", days_ago(1))], CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Authentication { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_judgment_fails_without_retry() {
        let harness = Harness {
            analyzer: Arc::new(FakeAnalyzer {
                judgment: AnalysisJudgment::default(),
                calls: AtomicU32::new(0),
            }),
            ..Harness::new(FakeSource::default())
        };

        let summary = harness
            .orchestrator(fast_config(1))
            .run(vec![repo("empty", days_ago(1))], CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].kind, FailureKind::JudgmentValidation);
        assert_eq!(harness.analyzer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sink_failure_fails_job_and_skips_cache() {
        let harness = Harness {
            sink: Arc::new(MemorySink {
                fail: true,
                ..Default::default()
            }),
            ..Harness::new(FakeSource::default())
        };
        let target = repo("alpha", days_ago(1));

        let summary = harness
            .orchestrator(fast_config(1))
            .run(vec![target.clone()], CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.completed, 0);
        assert_eq!(summary.failures[0].kind, FailureKind::Permanent);
        assert!(summary.failures[0].reason.contains("disk full"));
        assert!(harness.cache.lookup(&target).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_repositories_produce_one_job() {
        let harness = Harness::new(FakeSource::default());
        let alpha = repo("alpha", days_ago(1));

        let summary = harness
            .orchestrator(fast_config(3))
            .run(vec![alpha.clone(), alpha.clone(), alpha], CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.total(), 1);
        assert_eq!(summary.duplicates, 2);
        assert_eq!(harness.source.fetches_for("alpha"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_fails_in_flight_and_pending_jobs() {
        let gate = Arc::new(Semaphore::new(0));
        let harness = Harness::new(FakeSource {
            gate: Some(gate),
            ..Default::default()
        });
        let repos: Vec<_> = (0..4).map(|i| repo(&format!("r{i}"), days_ago(1))).collect();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let summary = harness
            .orchestrator(fast_config(2))
            .run(repos, cancel)
            .await
            .unwrap();

        assert_eq!(summary.completed, 0);
        assert_eq!(summary.failed(), 4);
        assert!(summary.failures.iter().all(|f| f.kind == FailureKind::Cancelled));
        assert!(summary.jobs.iter().all(|j| j.state == JobState::Failed));
        // Only the probing job ever reached the source.
        assert_eq!(harness.source.fetches_for("r0"), 1);
        assert!(harness.cache.entries().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn job_finishing_within_grace_stays_done() {
        // One permit lets the first job through; the pool then blocks.
        let gate = Arc::new(Semaphore::new(1));
        let harness = Harness::new(FakeSource {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let repos: Vec<_> = (0..5).map(|i| repo(&format!("r{i}"), days_ago(1))).collect();
        let cancel = CancellationToken::new();

        let orchestrator = harness.orchestrator(fast_config(2));
        let run = tokio::spawn({
            let cancel = cancel.clone();
            async move { orchestrator.run(repos, cancel).await }
        });

        sleep(Duration::from_millis(100)).await;
        assert_eq!(harness.source.fetches_for("r0"), 1);
        assert_eq!(harness.source.fetches_for("r1"), 1);
        assert_eq!(harness.source.fetches_for("r2"), 1);
        assert_eq!(harness.source.fetches_for("r3"), 0);

        cancel.cancel();
        sleep(Duration::from_millis(300)).await;
        gate.add_permits(1);

        let summary = run.await.unwrap().unwrap();

        assert_eq!(summary.completed, 2);
        assert_eq!(summary.failed(), 3);
        assert!(summary.failures.iter().all(|f| f.kind == FailureKind::Cancelled));
        assert_eq!(harness.source.fetches_for("r3"), 0);
        assert_eq!(harness.source.fetches_for("r4"), 0);

        let mut done: Vec<_> = summary
            .jobs
            .iter()
            .filter(|j| j.state == JobState::Done)
            .map(|j| j.repo.clone())
            .collect();
        done.sort();
        assert_eq!(done[0], "octo/r0");
        assert!(done[1] == "octo/r1" || done[1] == "octo/r2");

        let mut cached: Vec<_> = harness
            .cache
            .entries()
            .unwrap()
            .into_iter()
            .map(|e| e.repo.to_string())
            .collect();
        cached.sort();
        assert_eq!(cached, done);

        let failed: Vec<_> = summary.failures.iter().map(|f| f.repo.name.as_str()).collect();
        assert!(failed.contains(&"r3"));
        assert!(failed.contains(&"r4"));
    }

    /// Memory store that counts reads.
    #[derive(Default)]
    struct CountingStore {
        inner: MemoryCacheStore,
        gets: AtomicUsize,
    }

    impl CacheStore for CountingStore {
        fn get(&self, repo: &RepoId) -> anyhow::Result<Option<CacheEntry>> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get(repo)
        }
        fn put(&self, entry: CacheEntry) -> anyhow::Result<()> {
            self.inner.put(entry)
        }
        fn entries(&self) -> anyhow::Result<Vec<CacheEntry>> {
            self.inner.entries()
        }
        fn clear(&self) -> anyhow::Result<usize> {
            self.inner.clear()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cache_is_read_once_per_skipped_job() {
        let store = Arc::new(CountingStore::default());
        let harness = Harness {
            cache: AnalysisCache::new(store.clone()),
            ..Harness::new(FakeSource::default())
        };
        let alpha = repo("alpha", days_ago(5));
        harness.cache.record(&alpha, &cached(Action::Archive), days_ago(1)).unwrap();

        let summary = harness
            .orchestrator(fast_config(1))
            .run(vec![alpha.clone()], CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.skipped, 1);
        assert_eq!(store.gets.load(Ordering::SeqCst), 1);
        assert_eq!(summary.recommendation_for(&alpha.id), Some(&cached(Action::Archive)));
    }

    #[tokio::test(start_paused = true)]
    async fn enumerate_filters_single_repository() {
        let harness = Harness::new(FakeSource {
            listing: vec![repo("alpha", days_ago(1)), repo("beta", days_ago(2))],
            ..Default::default()
        });
        let orch = harness.orchestrator(fast_config(1));

        let all = orch.enumerate("octo", 10, None).await.unwrap();
        assert_eq!(all.len(), 2);

        let one = orch.enumerate("octo", 10, Some("beta")).await.unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].id.name, "beta");

        let err = orch.enumerate("octo", 10, Some("missing")).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::RepositoryNotFound { .. }));
    }
}

//! Reconciles the deterministic disposition rules with the external judgment.
//!
//! Rules are evaluated in order and the first match wins. The external
//! suggestion is only used when no rule fires, and its reasoning is appended
//! to a rule's reasoning for context without ever changing the action.

use chrono::{DateTime, Duration, Utc};

use crate::judgment::{ActivityLevel, AnalysisJudgment, ValueLevel};
use crate::model::{Action, FinalRecommendation, RecommendationSource, RepositoryRef};

pub const DEFAULT_LOOKBACK_DAYS: i64 = 730;
/// Longest accepted inactivity window, about a century.
pub const MAX_LOOKBACK_DAYS: i64 = 36_500;

const DELETE_REASON: &str = "archived, unstarred, inactive.";
const ARCHIVE_REASON: &str = "already archived, retains some signal.";
const PIN_REASON: &str = "high value, high activity.";
const KEEP_REASON: &str = "no actionable signal; defaulting to retain.";

#[derive(Debug, Clone)]
pub struct ActionRecommender {
    lookback: Duration,
}

impl Default for ActionRecommender {
    fn default() -> Self {
        Self::new(DEFAULT_LOOKBACK_DAYS)
    }
}

impl ActionRecommender {
    /// `lookback_days` is clamped to `[0, MAX_LOOKBACK_DAYS]`.
    pub fn new(lookback_days: i64) -> Self {
        Self {
            lookback: Duration::days(lookback_days.clamp(0, MAX_LOOKBACK_DAYS)),
        }
    }

    pub fn reconcile(&self, repo: &RepositoryRef, judgment: &AnalysisJudgment) -> FinalRecommendation {
        self.reconcile_at(repo, judgment, Utc::now())
    }

    /// [`reconcile`](Self::reconcile) against an explicit clock.
    pub fn reconcile_at(
        &self,
        repo: &RepositoryRef,
        judgment: &AnalysisJudgment,
        now: DateTime<Utc>,
    ) -> FinalRecommendation {
        let suggested = judgment.recommended_action.parse::<Action>().ok();

        let rule = if repo.is_archived && repo.stars == 0 && self.is_inactive(repo, now) {
            Some((Action::Delete, DELETE_REASON))
        } else if repo.is_archived {
            Some((Action::Archive, ARCHIVE_REASON))
        } else if judgment.value() == ValueLevel::High && judgment.activity() == ActivityLevel::High {
            Some((Action::Pin, PIN_REASON))
        } else {
            None
        };

        if let Some((action, reason)) = rule {
            let source = match suggested {
                Some(s) if s != action => RecommendationSource::Reconciled,
                _ => RecommendationSource::Deterministic,
            };
            return FinalRecommendation {
                action,
                reasoning: with_context(reason, &judgment.action_reasoning),
                source,
            };
        }

        match suggested {
            Some(action) => {
                let reasoning = if judgment.action_reasoning.trim().is_empty() {
                    format!("external analysis suggested {action}.")
                } else {
                    judgment.action_reasoning.trim().to_string()
                };
                FinalRecommendation {
                    action,
                    reasoning,
                    source: RecommendationSource::External,
                }
            }
            None => FinalRecommendation {
                action: Action::Keep,
                reasoning: with_context(KEEP_REASON, &judgment.action_reasoning),
                source: RecommendationSource::Deterministic,
            },
        }
    }

    /// No push inside the lookback window. A repository with no recorded
    /// push counts as inactive.
    fn is_inactive(&self, repo: &RepositoryRef, now: DateTime<Utc>) -> bool {
        match repo.pushed_at {
            Some(pushed) => now - pushed > self.lookback,
            None => true,
        }
    }
}

fn with_context(reason: &str, external: &str) -> String {
    let external = external.trim();
    if external.is_empty() {
        reason.to_string()
    } else {
        format!("{reason} External assessment: {external}")
    }
}

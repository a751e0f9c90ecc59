//! Repository snapshots, fetched repository data and the final recommendation.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity of a repository on the version-control host.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoId {
    pub owner: String,
    pub name: String,
}

impl RepoId {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Immutable snapshot of a repository taken at enumeration time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryRef {
    pub id: RepoId,
    pub description: Option<String>,
    pub url: Option<String>,
    /// Last content modification.
    pub updated_at: DateTime<Utc>,
    /// Last push. `None` when the host never saw one.
    pub pushed_at: Option<DateTime<Utc>>,
    pub is_archived: bool,
    pub is_fork: bool,
    pub stars: u32,
    pub forks: u32,
}

impl RepositoryRef {
    /// Minimal snapshot, mostly useful for tests and single-repo lookups.
    pub fn new(id: RepoId, updated_at: DateTime<Utc>) -> Self {
        Self {
            id,
            description: None,
            url: None,
            updated_at,
            pushed_at: Some(updated_at),
            is_archived: false,
            is_fork: false,
            stars: 0,
            forks: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageShare {
    pub language: String,
    /// 0-100 inclusive.
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub sha: String,
    pub message: String,
    pub author: String,
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contributor {
    pub login: String,
    pub contributions: u32,
}

/// Payload produced by the fetch step and consumed once by the analysis step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepositoryData {
    pub languages: Vec<LanguageShare>,
    pub recent_commits: Vec<Commit>,
    pub contributors: Vec<Contributor>,
    pub readme_excerpt: String,
    pub open_issues: u32,
}

impl RepositoryData {
    /// Date of the newest commit in the fetched window.
    pub fn latest_commit_at(&self) -> Option<DateTime<Utc>> {
        self.recent_commits.iter().filter_map(|c| c.date).max()
    }
}

/// Disposition recommended for a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Delete,
    Archive,
    Extract,
    Keep,
    Pin,
}

impl Action {
    pub const ALL: [Action; 5] = [
        Action::Delete,
        Action::Archive,
        Action::Extract,
        Action::Keep,
        Action::Pin,
    ];
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Delete => write!(f, "DELETE"),
            Action::Archive => write!(f, "ARCHIVE"),
            Action::Extract => write!(f, "EXTRACT"),
            Action::Keep => write!(f, "KEEP"),
            Action::Pin => write!(f, "PIN"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("not a recognised action: {0:?}")]
pub struct UnknownAction(pub String);

impl FromStr for Action {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DELETE" => Ok(Action::Delete),
            "ARCHIVE" => Ok(Action::Archive),
            "EXTRACT" => Ok(Action::Extract),
            "KEEP" => Ok(Action::Keep),
            "PIN" => Ok(Action::Pin),
            _ => Err(UnknownAction(s.to_string())),
        }
    }
}

/// Who decided the final action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecommendationSource {
    /// A deterministic rule fired (or nothing actionable came back).
    Deterministic,
    /// The external suggestion was used verbatim.
    External,
    /// A deterministic rule overrode a different external suggestion.
    Reconciled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalRecommendation {
    pub action: Action,
    pub reasoning: String,
    pub source: RecommendationSource,
}

//! Wire types for the subset of the GitHub REST API used here.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::model::{Commit, Contributor, RepoId, RepositoryRef};

#[derive(Debug, Clone, Deserialize)]
pub struct GhOwner {
    pub login: String,
}

/// Entry of `GET /users/{owner}/repos` and body of `GET /repos/{owner}/{repo}`.
#[derive(Debug, Clone, Deserialize)]
pub struct GhRepository {
    pub name: String,
    pub owner: GhOwner,
    pub description: Option<String>,
    pub html_url: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub pushed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub fork: bool,
    #[serde(default)]
    pub stargazers_count: u32,
    #[serde(default)]
    pub forks_count: u32,
    /// Includes open pull requests.
    #[serde(default)]
    pub open_issues_count: u32,
}

impl From<GhRepository> for RepositoryRef {
    fn from(gh: GhRepository) -> Self {
        RepositoryRef {
            id: RepoId::new(gh.owner.login, gh.name),
            description: gh.description.filter(|d| !d.trim().is_empty()),
            url: gh.html_url,
            updated_at: gh.updated_at,
            pushed_at: gh.pushed_at,
            is_archived: gh.archived,
            is_fork: gh.fork,
            stars: gh.stargazers_count,
            forks: gh.forks_count,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhCommitAuthor {
    pub name: Option<String>,
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GhCommitDetail {
    pub message: String,
    pub author: Option<GhCommitAuthor>,
}

/// Entry of `GET /repos/{owner}/{repo}/commits`.
#[derive(Debug, Clone, Deserialize)]
pub struct GhCommit {
    pub sha: String,
    pub commit: GhCommitDetail,
}

impl From<GhCommit> for Commit {
    fn from(gh: GhCommit) -> Self {
        let (author, date) = match gh.commit.author {
            Some(a) => (a.name.unwrap_or_default(), a.date),
            None => (String::new(), None),
        };
        Commit {
            sha: gh.sha,
            // First line only; bodies can be arbitrarily long.
            message: gh.commit.message.lines().next().unwrap_or_default().to_string(),
            author,
            date,
        }
    }
}

/// Entry of `GET /repos/{owner}/{repo}/contributors`.
#[derive(Debug, Clone, Deserialize)]
pub struct GhContributor {
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub contributions: u32,
}

impl From<GhContributor> for Contributor {
    fn from(gh: GhContributor) -> Self {
        Contributor {
            login: gh.login,
            contributions: gh.contributions,
        }
    }
}

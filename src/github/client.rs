use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, USER_AGENT};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::types::{GhCommit, GhContributor, GhRepository};
use crate::error::ServiceError;
use crate::model::{LanguageShare, RepositoryData, RepositoryRef};
use crate::ports::SourceControlPort;
use crate::rate_limit::MAX_SUPPRESSION;

const API_URL: &str = "https://api.github.com";
const API_VERSION: &str = "2022-11-28";
const MAX_PAGE_SIZE: usize = 100;
const README_LIMIT: usize = 5000;
const RECENT_COMMITS: usize = 10;
const TOP_CONTRIBUTORS: usize = 10;

/// REST client for the GitHub API.
pub struct GithubClient {
    token: Option<String>,
    client: Client,
    base_url: String,
}

impl GithubClient {
    pub fn new(token: Option<String>, timeout: Duration) -> Result<Self, ServiceError> {
        Self::with_base_url(token, API_URL.to_string(), timeout)
    }

    /// Create a client pointing at a custom base URL (useful for testing).
    pub fn with_base_url(
        token: Option<String>,
        base_url: String,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            token: token.filter(|t| !t.trim().is_empty()),
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn request(&self, path: &str) -> RequestBuilder {
        self.request_accepting(path, "application/vnd.github+json")
    }

    fn request_accepting(&self, path: &str, accept: &str) -> RequestBuilder {
        let mut req = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .header(ACCEPT, accept)
            .header(USER_AGENT, concat!("repo-triage/", env!("CARGO_PKG_VERSION")))
            .header("X-GitHub-Api-Version", API_VERSION);
        if let Some(token) = &self.token {
            req = req.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        req
    }

    /// Send and classify non-success statuses.
    async fn send(&self, req: RequestBuilder) -> Result<Response, ServiceError> {
        let response = req.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = rate_limit_delay(status, response.headers());
        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        if let Some(delay) = retry_after {
            return Err(ServiceError::RateLimited {
                message: format!("GitHub API rate limit ({status}): {message}"),
                retry_after: Some(delay),
            });
        }
        Err(ServiceError::from_status(status.as_u16(), message, None))
    }

    async fn get_json<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ServiceError> {
        Ok(self.send(req).await?.json::<T>().await?)
    }

    /// Like [`get_json`](Self::get_json), but a missing or empty resource
    /// (404, 204, 409 on an empty repository) yields `None`.
    async fn get_optional<T: DeserializeOwned>(
        &self,
        req: RequestBuilder,
    ) -> Result<Option<T>, ServiceError> {
        match self.send(req).await {
            Ok(response) if response.status() == StatusCode::NO_CONTENT => Ok(None),
            Ok(response) => Ok(Some(response.json::<T>().await?)),
            Err(ServiceError::Permanent(msg))
                if msg.starts_with("status 404") || msg.starts_with("status 409") =>
            {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn languages(&self, repo: &RepositoryRef) -> Result<Vec<LanguageShare>, ServiceError> {
        let path = format!("/repos/{}/{}/languages", repo.id.owner, repo.id.name);
        let bytes: HashMap<String, u64> = self
            .get_optional(self.request(&path))
            .await?
            .unwrap_or_default();
        Ok(language_shares(bytes))
    }

    async fn readme(&self, repo: &RepositoryRef) -> Result<String, ServiceError> {
        let path = format!("/repos/{}/{}/readme", repo.id.owner, repo.id.name);
        let req = self.request_accepting(&path, "application/vnd.github.raw");
        let text = match self.send(req).await {
            Ok(response) => response.text().await?,
            Err(ServiceError::Permanent(msg)) if msg.starts_with("status 404") => String::new(),
            Err(err) => return Err(err),
        };
        Ok(text.chars().take(README_LIMIT).collect())
    }

    async fn recent_commits(&self, repo: &RepositoryRef) -> Result<Vec<GhCommit>, ServiceError> {
        let path = format!("/repos/{}/{}/commits", repo.id.owner, repo.id.name);
        let req = self
            .request(&path)
            .query(&[("per_page", RECENT_COMMITS)]);
        Ok(self.get_optional(req).await?.unwrap_or_default())
    }

    async fn contributors(&self, repo: &RepositoryRef) -> Result<Vec<GhContributor>, ServiceError> {
        let path = format!("/repos/{}/{}/contributors", repo.id.owner, repo.id.name);
        let req = self
            .request(&path)
            .query(&[("per_page", TOP_CONTRIBUTORS)]);
        Ok(self.get_optional(req).await?.unwrap_or_default())
    }

    async fn open_issues(&self, repo: &RepositoryRef) -> Result<u32, ServiceError> {
        let path = format!("/repos/{}/{}", repo.id.owner, repo.id.name);
        let details: GhRepository = self.get_json(self.request(&path)).await?;
        Ok(details.open_issues_count)
    }
}

#[async_trait]
impl SourceControlPort for GithubClient {
    async fn list_repositories(
        &self,
        owner: &str,
        limit: usize,
    ) -> Result<Vec<RepositoryRef>, ServiceError> {
        let path = format!("/users/{owner}/repos");
        let mut collected: Vec<RepositoryRef> = Vec::new();
        let mut page = 1usize;
        // GitHub pages by offset, so the page size must not change mid-walk.
        let per_page = MAX_PAGE_SIZE.min(limit);

        while collected.len() < limit {
            let req = self.request(&path).query(&[
                ("per_page", per_page.to_string()),
                ("page", page.to_string()),
                ("type", "owner".to_string()),
                ("sort", "updated".to_string()),
            ]);
            let batch: Vec<GhRepository> = self.get_json(req).await?;
            let fetched = batch.len();
            debug!(owner, page, fetched, "fetched repository page");

            collected.extend(batch.into_iter().filter(|r| !r.fork).map(RepositoryRef::from));
            if fetched < per_page {
                break;
            }
            page += 1;
        }

        collected.truncate(limit);
        Ok(collected)
    }

    async fn fetch_repository_data(
        &self,
        repo: &RepositoryRef,
    ) -> Result<RepositoryData, ServiceError> {
        let (languages, commits, contributors, readme, open_issues) = tokio::try_join!(
            self.languages(repo),
            self.recent_commits(repo),
            self.contributors(repo),
            self.readme(repo),
            self.open_issues(repo),
        )?;

        Ok(RepositoryData {
            languages,
            recent_commits: commits.into_iter().map(Into::into).collect(),
            contributors: contributors.into_iter().map(Into::into).collect(),
            readme_excerpt: readme,
            open_issues,
        })
    }
}

/// Suggested delay for 429s and for 403s caused by an exhausted quota.
fn rate_limit_delay(status: StatusCode, headers: &HeaderMap) -> Option<Duration> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
    };
    let retry_after = header("retry-after")
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);

    let quota_exhausted = header("x-ratelimit-remaining") == Some("0");
    let until_reset = header("x-ratelimit-reset")
        .and_then(|v| v.parse::<i64>().ok())
        .map(|reset| Duration::from_secs(reset.saturating_sub(Utc::now().timestamp()).max(1) as u64));

    let delay = match status {
        StatusCode::TOO_MANY_REQUESTS => retry_after.or(until_reset).or(Some(Duration::from_secs(60))),
        StatusCode::FORBIDDEN if retry_after.is_some() || quota_exhausted => {
            retry_after.or(until_reset).or(Some(Duration::from_secs(60)))
        }
        _ => None,
    };
    delay.map(|d| d.min(MAX_SUPPRESSION))
}

/// Byte counts to percentages, largest first.
fn language_shares(bytes: HashMap<String, u64>) -> Vec<LanguageShare> {
    let total: u64 = bytes.values().sum();
    if total == 0 {
        return Vec::new();
    }
    let mut shares: Vec<LanguageShare> = bytes
        .into_iter()
        .map(|(language, count)| LanguageShare {
            language,
            percentage: (count as f64 / total as f64 * 1000.0).round() / 10.0,
        })
        .collect();
    shares.sort_by(|a, b| {
        b.percentage
            .total_cmp(&a.percentage)
            .then_with(|| a.language.cmp(&b.language))
    });
    shares
}

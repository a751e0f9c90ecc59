//! [`AnalyzerPort`] backed by the Messages API.

use async_trait::async_trait;
use tracing::debug;

use super::client::MessageSender;
use super::types::MessagesRequest;
use crate::error::ServiceError;
use crate::judgment::AnalysisJudgment;
use crate::model::{RepositoryData, RepositoryRef};
use crate::ports::AnalyzerPort;

pub const DEFAULT_MODEL: &str = "claude-3-7-sonnet-latest";
const MAX_TOKENS: u32 = 4096;

const SYSTEM_PROMPT: &str = "You assess GitHub repositories and decide their future.\n\
     Respond with ONLY a JSON object, no other text, with these top-level keys:\n\
     - \"summary\": string, the repository's purpose and function\n\
     - \"strengths\": array of strings\n\
     - \"weaknesses\": array of strings\n\
     - \"recommendations\": array of {\"recommendation\", \"reason\", \"priority\"} objects, priority is High, Medium or Low\n\
     - \"activity_assessment\": High, Medium, Low or Inactive\n\
     - \"estimated_value\": High, Medium or Low\n\
     - \"tags\": array of strings\n\
     - \"recommended_action\": one of DELETE, ARCHIVE, EXTRACT, KEEP, PIN\n\
     - \"action_reasoning\": string\n\
     Replace every placeholder with real content.";

pub struct ClaudeAnalyzer<S: MessageSender> {
    sender: S,
    model: String,
}

impl<S: MessageSender> ClaudeAnalyzer<S> {
    pub fn new(sender: S, model: impl Into<String>) -> Self {
        Self {
            sender,
            model: model.into(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl<S: MessageSender> AnalyzerPort for ClaudeAnalyzer<S> {
    async fn analyze(
        &self,
        repo: &RepositoryRef,
        data: &RepositoryData,
    ) -> Result<AnalysisJudgment, ServiceError> {
        let mut req = MessagesRequest::single_turn(&self.model, MAX_TOKENS, build_prompt(repo, data));
        req.system = Some(SYSTEM_PROMPT.to_string());
        req.temperature = Some(0.0);

        let response = self.sender.send_message(&req).await?;
        debug!(
            repo = %repo.id,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "analysis response received"
        );
        parse_judgment(&response.text())
    }
}

fn build_prompt(repo: &RepositoryRef, data: &RepositoryData) -> String {
    let languages = if data.languages.is_empty() {
        "No language information available".to_string()
    } else {
        data.languages
            .iter()
            .map(|l| format!("{} ({:.1}%)", l.language, l.percentage))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let activity = match data.latest_commit_at() {
        Some(at) => format!(
            "{} recent commits, latest on {}",
            data.recent_commits.len(),
            at.format("%Y-%m-%d")
        ),
        None => "No recent commits".to_string(),
    };
    let contributors = if data.contributors.is_empty() {
        "No contributor data available".to_string()
    } else {
        data.contributors
            .iter()
            .take(5)
            .map(|c| format!("{} ({} contributions)", c.login, c.contributions))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let readme = if data.readme_excerpt.trim().is_empty() {
        "No README content available"
    } else {
        data.readme_excerpt.as_str()
    };

    format!(
        "You are analyzing the GitHub repository \"{name}\" to decide its future.\n\
         \n\
         Repository Information:\n\
         - Name: {id}\n\
         - Description: {description}\n\
         - URL: {url}\n\
         - Last Updated: {updated}\n\
         - Archived on GitHub: {archived}\n\
         - Fork: {fork}\n\
         - Stars: {stars}\n\
         - Forks: {forks}\n\
         - Programming Languages: {languages}\n\
         \n\
         Activity Information:\n\
         - Open Issues: {issues}\n\
         - Recent Activity: {activity}\n\
         - Contributors: {contributors}\n\
         \n\
         README Content:\n\
         ```markdown\n{readme}\n```",
        name = repo.id.name,
        id = repo.id,
        description = repo.description.as_deref().unwrap_or("No description available"),
        url = repo.url.as_deref().unwrap_or("No URL available"),
        updated = repo.updated_at.format("%Y-%m-%d"),
        archived = repo.is_archived,
        fork = repo.is_fork,
        stars = repo.stars,
        forks = repo.forks,
        issues = data.open_issues,
    )
}

/// Parse the first `{` .. last `}` span of the model output.
fn parse_judgment(text: &str) -> Result<AnalysisJudgment, ServiceError> {
    let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) else {
        return Err(ServiceError::InvalidJudgment(
            "response contains no JSON object".into(),
        ));
    };
    if end < start {
        return Err(ServiceError::InvalidJudgment(
            "response contains no JSON object".into(),
        ));
    }
    serde_json::from_str(&text[start..=end])
        .map_err(|e| ServiceError::InvalidJudgment(format!("malformed judgment: {e}")))
}

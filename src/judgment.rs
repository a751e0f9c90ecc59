//! Structured judgment returned by the analysis service.
//!
//! The service is a black box, so every field of [`AnalysisJudgment`] is
//! optional on the wire. [`AnalysisJudgment::sanitize`] strips template
//! placeholders the model sometimes echoes back and fills defaults before the
//! judgment reaches the recommender.

use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

const DEFAULT_SUMMARY: &str = "No summary provided.";
const DEFAULT_LEVEL: &str = "Medium";

/// A single improvement item suggested by the analysis service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Recommendation {
    pub recommendation: String,
    pub reason: String,
    pub priority: String,
}

/// Untrusted judgment as produced by the analysis service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisJudgment {
    pub summary: String,
    pub strengths: Vec<String>,
    pub weaknesses: Vec<String>,
    pub recommendations: Vec<Recommendation>,
    pub activity_assessment: String,
    pub estimated_value: String,
    pub tags: Vec<String>,
    pub recommended_action: String,
    pub action_reasoning: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// Unknown values default to `Medium`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "high" => Priority::High,
            "low" => Priority::Low,
            _ => Priority::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueLevel {
    High,
    Medium,
    Low,
}

impl ValueLevel {
    /// Exact (case-insensitive) match, anything else is `Medium`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "high" => ValueLevel::High,
            "low" => ValueLevel::Low,
            _ => ValueLevel::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityLevel {
    High,
    Medium,
    Low,
    Inactive,
}

impl ActivityLevel {
    /// Activity assessments are free text ("Low - last commit 2019"), so this
    /// matches on keywords. Inactivity wins over any level word.
    pub fn parse(value: &str) -> Self {
        let lower = value.to_lowercase();
        if lower.contains("inactive") || lower.contains("none") {
            ActivityLevel::Inactive
        } else if lower.contains("high") {
            ActivityLevel::High
        } else if lower.contains("low") {
            ActivityLevel::Low
        } else {
            ActivityLevel::Medium
        }
    }
}

/// True for values the model left as template scaffolding.
fn is_placeholder(value: &str) -> bool {
    let v = value.trim();
    if v.is_empty() {
        return true;
    }
    if (v.starts_with('{') && v.ends_with('}')) || (v.starts_with('<') && v.ends_with('>')) {
        return true;
    }
    matches!(v.to_ascii_lowercase().as_str(), "n/a" | "tbd" | "null" | "...")
}

fn clean_list(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .filter(|s| !is_placeholder(s))
        .map(|s| s.trim().to_string())
        .collect()
}

impl AnalysisJudgment {
    /// Strip placeholders and fill defaults.
    ///
    /// Fails with [`ServiceError::InvalidJudgment`] when nothing substantive
    /// is left: no summary, no strengths, no weaknesses and no
    /// recommendations.
    pub fn sanitize(self) -> Result<Self, ServiceError> {
        let strengths = clean_list(self.strengths);
        let weaknesses = clean_list(self.weaknesses);
        let tags = clean_list(self.tags);
        let recommendations: Vec<Recommendation> = self
            .recommendations
            .into_iter()
            .filter(|r| !is_placeholder(&r.recommendation))
            .map(|r| Recommendation {
                recommendation: r.recommendation.trim().to_string(),
                reason: if is_placeholder(&r.reason) {
                    String::new()
                } else {
                    r.reason.trim().to_string()
                },
                priority: format!("{:?}", Priority::parse(&r.priority)),
            })
            .collect();

        let summary_missing = is_placeholder(&self.summary);
        if summary_missing
            && strengths.is_empty()
            && weaknesses.is_empty()
            && recommendations.is_empty()
        {
            return Err(ServiceError::InvalidJudgment(
                "judgment has no summary, strengths, weaknesses or recommendations".into(),
            ));
        }

        let or_default = |value: String, default: &str| {
            if is_placeholder(&value) {
                default.to_string()
            } else {
                value.trim().to_string()
            }
        };

        Ok(Self {
            summary: or_default(self.summary, DEFAULT_SUMMARY),
            strengths,
            weaknesses,
            recommendations,
            activity_assessment: or_default(self.activity_assessment, DEFAULT_LEVEL),
            estimated_value: or_default(self.estimated_value, DEFAULT_LEVEL),
            tags,
            recommended_action: or_default(self.recommended_action, ""),
            action_reasoning: or_default(self.action_reasoning, ""),
        })
    }

    pub fn value(&self) -> ValueLevel {
        ValueLevel::parse(&self.estimated_value)
    }

    pub fn activity(&self) -> ActivityLevel {
        ActivityLevel::parse(&self.activity_assessment)
    }

    /// Recommendations the service flagged as high priority.
    pub fn high_priority(&self) -> impl Iterator<Item = &Recommendation> {
        self.recommendations
            .iter()
            .filter(|r| Priority::parse(&r.priority) == Priority::High)
    }
}

//! Configuração do repo-triage carregada a partir de `repo-triage.toml`.
//!
//! A struct [`Config`] contém todos os parâmetros configuráveis. Valores não
//! presentes no arquivo usam defaults sensíveis; variáveis de ambiente têm
//! precedência sobre o arquivo, e flags da CLI sobre ambas.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::orchestrator::OrchestratorConfig;
use crate::rate_limit::{BucketConfig, RateLimiter};
use crate::recommender::{ActionRecommender, DEFAULT_LOOKBACK_DAYS, MAX_LOOKBACK_DAYS};
use crate::retry::RetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "repo-triage.toml";
/// Upper bound for every `*_secs` timeout setting: one day.
pub const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Retry settings for one upstream service.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter: self.jitter,
            ..Default::default()
        }
    }
}

/// Configuração de nível superior.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Token da API do GitHub. Opcional, mas sem ele o limite é de 60 req/h.
    #[serde(default)]
    pub github_token: String,

    /// Chave da API Anthropic.
    #[serde(default)]
    pub anthropic_api_key: String,

    /// Dono cujos repositórios serão analisados.
    #[serde(default)]
    pub github_username: String,

    #[serde(default = "default_llm_model")]
    pub llm_model: String,

    /// Diretório onde os relatórios JSON são gravados.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Índice JSON com a última análise de cada repositório.
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,

    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Requisições por minuto ao GitHub.
    #[serde(default = "default_github_rate_limit")]
    pub github_rate_limit: u32,

    /// Requisições por minuto ao serviço de análise.
    #[serde(default = "default_llm_rate_limit")]
    pub llm_rate_limit: u32,

    /// Capacidade de cada token bucket.
    #[serde(default = "default_burst")]
    pub burst: u32,

    #[serde(default)]
    pub force_reanalysis: bool,

    #[serde(default)]
    pub github_retry: RetrySettings,

    #[serde(default)]
    pub llm_retry: RetrySettings,

    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,

    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    /// Janela de inatividade usada pela regra de DELETE.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,

    #[serde(default = "default_max_repos")]
    pub max_repos: usize,
}

fn default_llm_model() -> String {
    crate::anthropic::DEFAULT_MODEL.to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("reports")
}

fn default_cache_path() -> PathBuf {
    PathBuf::from(".repo-triage/analysis-cache.json")
}

fn default_max_workers() -> usize {
    5
}

fn default_github_rate_limit() -> u32 {
    30
}

fn default_llm_rate_limit() -> u32 {
    10
}

fn default_burst() -> u32 {
    1
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_jitter() -> f64 {
    0.25
}

fn default_acquire_timeout_secs() -> u64 {
    120
}

fn default_call_timeout_secs() -> u64 {
    60
}

fn default_grace_period_secs() -> u64 {
    10
}

fn default_lookback_days() -> i64 {
    DEFAULT_LOOKBACK_DAYS
}

fn default_max_repos() -> usize {
    100
}

impl Default for Config {
    fn default() -> Self {
        Self {
            github_token: String::new(),
            anthropic_api_key: String::new(),
            github_username: String::new(),
            llm_model: default_llm_model(),
            output_dir: default_output_dir(),
            cache_path: default_cache_path(),
            max_workers: default_max_workers(),
            github_rate_limit: default_github_rate_limit(),
            llm_rate_limit: default_llm_rate_limit(),
            burst: default_burst(),
            force_reanalysis: false,
            github_retry: RetrySettings::default(),
            llm_retry: RetrySettings::default(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            grace_period_secs: default_grace_period_secs(),
            lookback_days: default_lookback_days(),
            max_repos: default_max_repos(),
        }
    }
}

impl Config {
    /// Carrega `path` e aplica as variáveis de ambiente.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<Config>(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Sobrescreve campos a partir de variáveis de ambiente não vazias.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(token) = var("GITHUB_TOKEN") {
            self.github_token = token;
        }
        if let Some(key) = var("ANTHROPIC_API_KEY") {
            self.anthropic_api_key = key;
        }
        if let Some(user) = var("GITHUB_USERNAME") {
            self.github_username = user;
        }
        if let Some(v) = var("MAX_WORKERS") {
            self.max_workers = v.trim().parse().context("MAX_WORKERS must be an integer")?;
        }
        if let Some(v) = var("GITHUB_RATE_LIMIT") {
            self.github_rate_limit = v
                .trim()
                .parse()
                .context("GITHUB_RATE_LIMIT must be an integer")?;
        }
        if let Some(v) = var("LLM_RATE_LIMIT") {
            self.llm_rate_limit = v.trim().parse().context("LLM_RATE_LIMIT must be an integer")?;
        }
        if let Some(v) = var("FORCE_REANALYSIS") {
            self.force_reanalysis = matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            bail!("max_workers must be at least 1");
        }
        if self.github_rate_limit == 0 || self.llm_rate_limit == 0 {
            bail!("rate limits must be at least 1 request per minute");
        }
        if self.burst == 0 {
            bail!("burst must be at least 1");
        }
        for (name, retry) in [("github_retry", &self.github_retry), ("llm_retry", &self.llm_retry)] {
            if !(0.0..=1.0).contains(&retry.jitter) {
                bail!("{name}.jitter must be within [0, 1], got {}", retry.jitter);
            }
            if retry.max_attempts == 0 {
                bail!("{name}.max_attempts must be at least 1");
            }
        }
        if !(1..=MAX_LOOKBACK_DAYS).contains(&self.lookback_days) {
            bail!("lookback_days must be within [1, {MAX_LOOKBACK_DAYS}], got {}", self.lookback_days);
        }
        for (name, secs) in [
            ("acquire_timeout_secs", self.acquire_timeout_secs),
            ("call_timeout_secs", self.call_timeout_secs),
            ("grace_period_secs", self.grace_period_secs),
        ] {
            if secs > MAX_TIMEOUT_SECS {
                bail!("{name} must be at most {MAX_TIMEOUT_SECS} seconds, got {secs}");
            }
        }
        Ok(())
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_workers: self.max_workers,
            force_reanalysis: self.force_reanalysis,
            acquire_timeout: Duration::from_secs(self.acquire_timeout_secs),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            grace_period: Duration::from_secs(self.grace_period_secs),
            source_control_retry: self.github_retry.policy(),
            analysis_retry: self.llm_retry.policy(),
        }
    }

    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::for_services(
            BucketConfig {
                capacity: self.burst,
                per_minute: self.github_rate_limit,
            },
            BucketConfig {
                capacity: self.burst,
                per_minute: self.llm_rate_limit,
            },
        )
    }

    pub fn recommender(&self) -> ActionRecommender {
        ActionRecommender::new(self.lookback_days)
    }
}

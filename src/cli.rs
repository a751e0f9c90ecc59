//! Interface de linha de comando do repo-triage baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (analyze, cache)
//! e flags globais (--config, --verbose).

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::config::{Config, DEFAULT_CONFIG_FILE};
use crate::model::Action;

/// Analyzes a GitHub account's repositories and recommends what to do with each.
#[derive(Debug, Parser)]
#[command(name = "repo-triage", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Analisa os repositórios e grava um relatório por repositório.
    Analyze(AnalyzeArgs),

    /// Inspeciona o cache de análises.
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },

    /// Lista as ações recomendadas nos relatórios salvos.
    Actions {
        #[command(subcommand)]
        command: ActionsCommand,
    },

    /// Remove os relatórios e o cache, forçando uma análise completa.
    Reset,
}

#[derive(Debug, Args)]
pub struct AnalyzeArgs {
    /// Reanalisa mesmo repositórios inalterados desde a última análise.
    #[arg(long)]
    pub force: bool,

    /// Analisa apenas o repositório com este nome.
    #[arg(long)]
    pub repo: Option<String>,

    /// Owner to analyze; overrides `github_username`.
    #[arg(long)]
    pub owner: Option<String>,

    /// Número máximo de repositórios a listar.
    #[arg(long)]
    pub max_repos: Option<usize>,

    /// Número de workers concorrentes.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Diretório dos relatórios.
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
}

impl AnalyzeArgs {
    /// CLI flags take precedence over file and environment.
    pub fn apply(&self, config: &mut Config) {
        if self.force {
            config.force_reanalysis = true;
        }
        if let Some(owner) = &self.owner {
            config.github_username = owner.clone();
        }
        if let Some(n) = self.max_repos {
            config.max_repos = n;
        }
        if let Some(n) = self.workers {
            config.max_workers = n;
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    /// Lista as entradas do cache.
    Show,
    /// Apaga o índice do cache.
    Clear,
}

#[derive(Debug, Subcommand)]
pub enum ActionsCommand {
    /// Every recommendation, grouped by action.
    List(ActionsArgs),
    /// What would be deleted or archived. Never touches GitHub.
    DryRun(ActionsArgs),
}

#[derive(Debug, Args)]
pub struct ActionsArgs {
    /// Only this action (delete, archive, extract, keep, pin).
    #[arg(long = "type", short = 't')]
    pub action: Option<Action>,

    /// Diretório dos relatórios.
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
}

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use repo_triage::anthropic::{AnthropicClient, ClaudeAnalyzer};
use repo_triage::cache::{AnalysisCache, JsonIndexStore};
use repo_triage::cli::{ActionsArgs, ActionsCommand, AnalyzeArgs, CacheCommand, Cli, Command};
use repo_triage::config::Config;
use repo_triage::github::GithubClient;
use repo_triage::orchestrator::Orchestrator;
use repo_triage::rate_limit::ServiceId;
use repo_triage::report::{self, JsonReportSink, TracingReporter};
use repo_triage::ui::{self, TerminalReporter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = Config::load(&cli.config)?;

    match cli.command {
        Command::Analyze(args) => {
            args.apply(&mut config);
            config.validate()?;
            analyze(&config, &args).await
        }
        Command::Cache {
            command: CacheCommand::Show,
        } => {
            let entries = open_cache(&config)?.entries()?;
            ui::print_cache(&entries);
            Ok(())
        }
        Command::Cache {
            command: CacheCommand::Clear,
        } => {
            let removed = open_cache(&config)?.clear()?;
            info!(removed, path = %config.cache_path.display(), "cache cleared");
            println!("Removed {removed} cache entries.");
            Ok(())
        }
        Command::Actions { command } => {
            let (args, dry_run) = match &command {
                ActionsCommand::List(args) => (args, false),
                ActionsCommand::DryRun(args) => (args, true),
            };
            list_actions(&config, args, dry_run)
        }
        Command::Reset => {
            let reports = report::remove_reports(&config.output_dir)?;
            let entries = open_cache(&config)?.clear()?;
            info!(reports, entries, "analysis state reset");
            println!("Removed {reports} reports and {entries} cache entries.");
            Ok(())
        }
    }
}

fn open_cache(config: &Config) -> Result<AnalysisCache> {
    let store = JsonIndexStore::open(&config.cache_path)?;
    Ok(AnalysisCache::new(Arc::new(store)))
}

fn list_actions(config: &Config, args: &ActionsArgs, dry_run: bool) -> Result<()> {
    let dir = args.output_dir.as_deref().unwrap_or(&config.output_dir);
    let reports = report::load_reports(dir)?;
    if reports.is_empty() {
        bail!("no reports found in {}; run `repo-triage analyze` first", dir.display());
    }
    ui::print_actions(&reports, args.action, dry_run);
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn analyze(config: &Config, args: &AnalyzeArgs) -> Result<()> {
    if config.github_username.is_empty() {
        bail!("no GitHub owner configured: set github_username, GITHUB_USERNAME or --owner");
    }
    if config.anthropic_api_key.is_empty() {
        bail!("ANTHROPIC_API_KEY is not set");
    }
    if config.github_token.is_empty() {
        warn!("GITHUB_TOKEN is not set; unauthenticated requests are heavily rate limited");
    }

    let call_timeout = Duration::from_secs(config.call_timeout_secs);
    let github = GithubClient::new(Some(config.github_token.clone()), call_timeout)
        .context("failed to build GitHub client")?;
    let anthropic = AnthropicClient::new(config.anthropic_api_key.clone(), call_timeout)
        .context("failed to build Anthropic client")?;
    let analyzer = ClaudeAnalyzer::new(anthropic, config.llm_model.clone());
    info!(model = analyzer.model(), "analysis model");
    let cache = open_cache(config)?;
    let sink = JsonReportSink::new(&config.output_dir);

    let orchestrator = Orchestrator::new(
        config.orchestrator(),
        Arc::new(github),
        Arc::new(analyzer),
        Arc::new(sink),
        Arc::new(config.rate_limiter()),
        cache,
    )
    .with_recommender(config.recommender());

    let repos = orchestrator
        .enumerate(&config.github_username, config.max_repos, args.repo.as_deref())
        .await?;
    let distinct = repos.iter().map(|r| &r.id).collect::<HashSet<_>>().len();
    info!(owner = %config.github_username, repos = distinct, "analyzing repositories");

    // Without a terminal the progress bar is noise; log transitions instead.
    let bar = console::Term::stdout()
        .is_term()
        .then(|| Arc::new(TerminalReporter::start(distinct)));
    let orchestrator = match &bar {
        Some(bar) => orchestrator.with_reporter(bar.clone()),
        None => orchestrator.with_reporter(Arc::new(TracingReporter)),
    };

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight jobs");
            on_interrupt.cancel();
        }
    });

    let result = orchestrator.run(repos, cancel).await;
    if let Some(bar) = &bar {
        bar.finish();
    }
    let summary = result?;

    let stats: Vec<_> = [ServiceId::SourceControl, ServiceId::Analysis]
        .into_iter()
        .filter_map(|service| orchestrator.limiter().stats(service).map(|s| (service, s)))
        .collect();
    ui::print_summary(&summary, &stats);
    println!("\nReports written to {}", config.output_dir.display());
    Ok(())
}

//! Interface de terminal do repo-triage: barra de progresso e saída colorida.
//!
//! Usa `indicatif` para a barra de progresso e `console` para cores. O
//! [`TerminalReporter`] recebe as transições dos jobs vindas dos workers.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use uuid::Uuid;

use crate::cache::CacheEntry;
use crate::model::{Action, RepoId};
use crate::orchestrator::RunSummary;
use crate::report::RepositoryReport;
use crate::ports::ProgressReporter;
use crate::rate_limit::{LimiterStats, ServiceId};
use crate::state_machine::JobState;

/// Barra de progresso que avança a cada job terminado.
pub struct TerminalReporter {
    pb: ProgressBar,
    red: Style,
    dim: Style,
}

impl TerminalReporter {
    pub fn start(total: usize) -> Self {
        let pb = ProgressBar::new(total as u64);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{elapsed_precise}] {bar:30.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
        pb.set_style(style);
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            red: Style::new().red().bold(),
            dim: Style::new().dim(),
        }
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

impl ProgressReporter for TerminalReporter {
    fn on_transition(&self, _job_id: Uuid, repo: &RepoId, _from: JobState, to: JobState) {
        match to {
            JobState::Done | JobState::Skipped => self.pb.inc(1),
            JobState::Failed => {
                self.pb.inc(1);
                self.pb
                    .println(format!("  {} {repo}", self.red.apply_to("✗")));
            }
            JobState::Fetching | JobState::Analyzing => {
                self.pb.set_message(format!("{} {repo}", self.dim.apply_to(to)));
            }
            _ => {}
        }
    }
}

fn action_style(action: Action) -> Style {
    match action {
        Action::Delete => Style::new().red().bold(),
        Action::Archive => Style::new().yellow(),
        Action::Extract => Style::new().magenta(),
        Action::Keep => Style::new().green(),
        Action::Pin => Style::new().cyan().bold(),
    }
}

/// Imprime o resumo final da execução.
pub fn print_summary(summary: &RunSummary, limiter: &[(ServiceId, LimiterStats)]) {
    let green = Style::new().green().bold();
    let red = Style::new().red().bold();
    let yellow = Style::new().yellow();
    let bold = Style::new().bold();

    println!();
    println!("{}", bold.apply_to("─── Summary ───"));
    println!(
        "  {} completed   {} skipped   {} failed   ({:.1}s)",
        green.apply_to(summary.completed),
        yellow.apply_to(summary.skipped),
        red.apply_to(summary.failed()),
        summary.elapsed.as_secs_f64()
    );
    if summary.duplicates > 0 {
        println!("  {} duplicate repositories ignored", summary.duplicates);
    }

    let by_action = summary.by_action();
    if !by_action.is_empty() {
        println!();
        println!("{}", bold.apply_to("Recommendations"));
        for (action, count) in &by_action {
            println!("  {:<8} {count}", action_style(*action).apply_to(action));
        }
    }

    if !summary.failures.is_empty() {
        println!();
        println!("{}", bold.apply_to("Failures"));
        for failure in &summary.failures {
            println!(
                "  {} {} [{}] {}",
                red.apply_to("✗"),
                failure.repo,
                failure.kind,
                failure.reason
            );
        }
    }

    if !limiter.is_empty() {
        println!();
        println!("{}", bold.apply_to("Rate limiting"));
        for (service, stats) in limiter {
            println!(
                "  {service:<15} {} granted, {} waited ({:.1}s total), {} timeouts",
                stats.granted,
                stats.waited,
                stats.total_wait.as_secs_f64(),
                stats.timeouts
            );
        }
    }
}

/// Imprime as entradas do cache, mais recentes primeiro.
pub fn print_cache(entries: &[CacheEntry]) {
    if entries.is_empty() {
        println!("Cache is empty.");
        return;
    }
    let mut sorted: Vec<_> = entries.iter().collect();
    sorted.sort_by(|a, b| b.last_analyzed_at.cmp(&a.last_analyzed_at));
    for entry in sorted {
        println!(
            "{}  {:<8} {}",
            entry.last_analyzed_at.format("%Y-%m-%d %H:%M"),
            action_style(entry.recommendation.action).apply_to(entry.recommendation.action),
            entry.repo
        );
    }
}

/// Lista as recomendações salvas nos relatórios, agrupadas por ação.
///
/// Em modo `dry_run` apenas as ações que alteram o repositório (DELETE e
/// ARCHIVE) são listadas, com o que seria feito.
pub fn print_actions(reports: &[RepositoryReport], only: Option<Action>, dry_run: bool) {
    let dim = Style::new().dim();
    let wanted = |action: Action| match only {
        Some(only) => action == only,
        None => !dry_run || matches!(action, Action::Delete | Action::Archive),
    };

    let mut printed = 0;
    for action in Action::ALL.into_iter().filter(|a| wanted(*a)) {
        let group: Vec<_> = reports
            .iter()
            .filter(|r| r.recommendation.action == action)
            .collect();
        if group.is_empty() {
            continue;
        }
        println!();
        let heading = if dry_run {
            format!("Would {} ({})", action.to_string().to_lowercase(), group.len())
        } else {
            format!("{action} ({})", group.len())
        };
        println!("{}", action_style(action).bold().apply_to(heading));
        for report in group {
            println!(
                "  {:<40} {}",
                report.repository.id,
                dim.apply_to(&report.recommendation.reasoning)
            );
            printed += 1;
        }
    }

    if printed == 0 {
        println!("No matching recommendations.");
    } else if dry_run {
        println!();
        println!("{}", dim.apply_to("Dry run: no repository was changed."));
    }
}

//! Command handlers behind the CLI.
//!
//! Every handler here blocks: SSH sessions, git subprocesses and the file
//! watcher all run on the calling thread. [`crate::run`] moves them onto
//! tokio's blocking pool.

pub mod setup;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use colored::Colorize;
use crossbeam_channel::Receiver;

use crate::config::{CONFIG_FILE, Config};
use crate::git::LocalRepo;
use crate::remote::ssh::SshConnector;
use crate::status::{DiffBase, StatusComparator, StatusReport};
use crate::sync::{PullOptions, SyncPlan, SyncSession, SyncWorkflow};
use crate::ui::{self, ConsoleReporter, format_bytes};
use crate::watch::ChangeWatcher;

/// Where a command runs and which config it reads.
#[derive(Debug, Clone)]
pub struct Context {
    pub repo_root: PathBuf,
    pub config_path: PathBuf,
}

impl Context {
    /// Use the current directory as the repository root.
    pub fn from_env(config: Option<PathBuf>) -> Result<Self> {
        let repo_root = std::env::current_dir().context("Cannot read current directory")?;
        Ok(Self::new(repo_root, config))
    }

    pub fn new(repo_root: PathBuf, config: Option<PathBuf>) -> Self {
        let config_path = config.unwrap_or_else(|| repo_root.join(CONFIG_FILE));
        Self {
            repo_root,
            config_path,
        }
    }

    pub fn load_config(&self) -> Result<Config> {
        Ok(Config::load(&self.config_path)?)
    }

    fn connector(&self, config: &Config) -> SshConnector {
        SshConnector::new(config.endpoint())
    }

    fn workflow(&self, config: &Config) -> SyncWorkflow<SshConnector> {
        SyncWorkflow::new(
            self.connector(config),
            SyncPlan::from_config(config, &self.repo_root),
            Arc::new(ConsoleReporter::new()),
        )
    }

    fn comparator(&self, config: &Config) -> StatusComparator<SshConnector> {
        let plan = SyncPlan::from_config(config, &self.repo_root);
        StatusComparator::new(
            self.connector(config),
            LocalRepo::new(&self.repo_root),
            plan.remote_repo_path(),
            plan.branch,
        )
    }
}

// =============================================================================
// Sync
// =============================================================================

pub fn push(ctx: &Context) -> Result<ExitCode> {
    let config = ctx.load_config()?;
    ui::print_banner(&format!("Pushing {} to {}", config.project.name, config.server.host));
    let session = ctx.workflow(&config).push();
    Ok(finish(&session, "Push"))
}

pub fn pull(ctx: &Context, forward_upstream: bool) -> Result<ExitCode> {
    let config = ctx.load_config()?;
    ui::print_banner(&format!("Pulling {} from {}", config.project.name, config.server.host));
    let session = ctx.workflow(&config).pull(&PullOptions { forward_upstream });
    let code = finish(&session, "Pull");
    if session.succeeded() {
        let repo = LocalRepo::new(&ctx.repo_root);
        for line in pull_summary(&repo, &config.project.branch, forward_upstream) {
            println!("{line}");
        }
    }
    Ok(code)
}

/// How many commits to list after a pull.
const RECENT_COMMITS: usize = 5;

/// Latest commits after a merge, plus a reminder to forward them to origin
/// when the pull did not already do so.
fn pull_summary(repo: &LocalRepo, branch: &str, forward_upstream: bool) -> Vec<String> {
    let mut lines = Vec::new();
    match repo.recent_commits(RECENT_COMMITS) {
        Ok(commits) if !commits.is_empty() => {
            lines.push(String::new());
            lines.push("Recent commits:".bold().to_string());
            lines.extend(commits.iter().map(|c| format!("  {c}")));
        }
        Ok(_) => {}
        Err(e) => tracing::debug!(error = %e, "could not list recent commits"),
    }
    if !forward_upstream {
        lines.push(String::new());
        lines.push(format!(
            "{} Don't forget to push to origin: {}",
            "→".cyan(),
            format!("git push origin {branch}").bold()
        ));
    }
    lines
}

pub fn backup(ctx: &Context) -> Result<ExitCode> {
    let config = ctx.load_config()?;
    ui::print_banner(&format!("Backing up {} from {}", config.project.name, config.server.host));
    let session = ctx.workflow(&config).backup();
    if session.succeeded()
        && let Some(artifact) = &session.artifact
    {
        println!("  {} {}", "Saved to".dimmed(), artifact.local_path.display());
    }
    Ok(finish(&session, "Backup"))
}

/// Summarize a finished session. Failures were already reported as they
/// happened, so only the exit code is left to decide.
fn finish(session: &SyncSession, label: &str) -> ExitCode {
    if !session.succeeded() {
        return ExitCode::FAILURE;
    }
    let mut line = format!("{label} complete in {:.1}s", session.duration.as_secs_f64());
    if let Some(size) = session.artifact.as_ref().and_then(|a| a.size) {
        line.push_str(&format!(" ({})", format_bytes(size)));
    }
    if !session.warnings.is_empty() {
        line.push_str(&format!(", {} warning(s)", session.warnings.len()));
    }
    println!();
    println!("{} {}", "✓".green().bold(), line.bold());
    ExitCode::SUCCESS
}

// =============================================================================
// Status & Diff
// =============================================================================

pub fn status(ctx: &Context, json: bool) -> Result<ExitCode> {
    let config = ctx.load_config()?;
    let report = ctx.comparator(&config).compare()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_status(&config, &report);
    }
    Ok(ExitCode::SUCCESS)
}

fn print_status(config: &Config, report: &StatusReport) {
    let unknown = || "unknown".dimmed().to_string();

    ui::print_banner(&format!("Status of {}", config.project.name));
    println!("{}", "Local".bold());
    println!(
        "  Branch:       {}",
        report.local.branch.clone().unwrap_or_else(unknown)
    );
    println!(
        "  Last commit:  {}",
        report.local.last_commit.clone().unwrap_or_else(unknown)
    );
    if report.local.dirty_files == 0 {
        println!("  Working tree: {}", "clean".green());
    } else {
        println!(
            "  Working tree: {}",
            format!("{} uncommitted change(s)", report.local.dirty_files).yellow()
        );
    }
    if let Some(n) = report.local.unpushed_commits {
        println!("  Not on origin: {n}");
    }

    println!();
    println!("{} {}", "Server".bold(), config.endpoint().to_string().dimmed());
    match (&report.remote, &report.remote_error) {
        (Some(remote), _) if remote.exists == Some(false) => {
            println!("  {}", "No repository yet".yellow());
        }
        (Some(remote), _) => {
            println!("  Branch:       {}", remote.branch.clone().unwrap_or_else(unknown));
            println!(
                "  Last commit:  {}",
                remote.last_commit.clone().unwrap_or_else(unknown)
            );
            match remote.clean {
                Some(true) => println!("  Working tree: {}", "clean".green()),
                Some(false) => println!(
                    "  Working tree: {}",
                    format!("{} uncommitted change(s)", remote.dirty_files.unwrap_or(0)).yellow()
                ),
                None => println!("  Working tree: {}", unknown()),
            }
        }
        (None, Some(err)) => println!("  {} {}", "Unreachable:".red(), err),
        (None, None) => println!("  {}", unknown()),
    }

    if !report.recommendations.is_empty() {
        println!();
        println!("{}", "Next".bold());
        for rec in &report.recommendations {
            println!("  {} {}", "→".cyan(), rec);
        }
    }
}

pub fn diff(ctx: &Context) -> Result<ExitCode> {
    let config = ctx.load_config()?;
    let report = ctx.comparator(&config).diff()?;

    ui::print_banner(&format!("Changes not yet on {}", config.server.host));
    if let DiffBase::Upstream { reason, .. } = &report.base {
        println!("{} {}", "⚠".yellow(), format!("Server unreachable: {reason}").yellow());
    }
    println!("  {} {}", "Compared with".dimmed(), report.base);

    if report.base_missing_locally {
        println!();
        println!(
            "{} The base commit is not in your repository; run 'gitsync pull' first",
            "⚠".yellow()
        );
        return Ok(ExitCode::SUCCESS);
    }
    if report.commits.is_empty() {
        println!();
        println!("{} Nothing to push", "✓".green());
        return Ok(ExitCode::SUCCESS);
    }

    println!();
    println!("{}", format!("{} commit(s)", report.commits.len()).bold());
    for commit in &report.commits {
        println!("  {commit}");
    }
    if !report.stat.trim().is_empty() {
        println!();
        println!("{}", report.stat);
    }
    Ok(ExitCode::SUCCESS)
}

// =============================================================================
// Watch
// =============================================================================

/// Push after every quiesced burst of edits until `shutdown` fires.
pub fn watch(ctx: &Context, shutdown: Receiver<()>) -> Result<ExitCode> {
    let config = ctx.load_config()?;
    let workflow = ctx.workflow(&config);
    let repo_root = workflow.plan().repo_root.clone();
    let watcher = ChangeWatcher::new(&repo_root, &workflow.plan().bundle_dir);

    ui::print_banner(&format!("Watching {}", repo_root.display()));
    println!("  {}", "Committed changes are pushed after edits settle. Ctrl-C stops.".dimmed());

    watcher.watch(
        move |path: PathBuf| {
            println!();
            println!(
                "{} {}",
                "Change detected:".cyan(),
                display_relative(&path, &repo_root)
            );
            let session = workflow.push();
            finish(&session, "Push");
            println!("  {}", "Still watching...".dimmed());
        },
        shutdown,
    )?;
    println!("{} Stopped watching", "✓".green());
    Ok(ExitCode::SUCCESS)
}

fn display_relative(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .display()
        .to_string()
}

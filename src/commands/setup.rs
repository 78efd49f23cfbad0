//! Setup and housekeeping commands: init, doctor, config, history, completions.

use std::fs;
use std::io;
use std::process::ExitCode;

use anyhow::{Context as _, Result, bail};
use clap::CommandFactory;
use clap_complete::Shell;
use colored::Colorize;

use super::Context;
use crate::bundle;
use crate::cli::{Cli, InitArgs};
use crate::config::{CONFIG_FILE, update_gitignore};
use crate::git::LocalRepo;
use crate::remote::ssh::SshConnector;
use crate::remote::{Connector, RemoteError, RemoteSession, with_session};
use crate::sync::scripts;
use crate::ui::interactive::{self, InitAnswers, InitDefaults, InitWizard};
use crate::ui::{self, format_bytes};

// =============================================================================
// Init
// =============================================================================

pub fn init(ctx: &Context, args: InitArgs) -> Result<ExitCode> {
    let interactive = !args.no_input;
    if ctx.config_path.exists() && !args.force {
        let overwrite = interactive
            && interactive::confirm_action(
                &format!("{} already exists. Overwrite it?", ctx.config_path.display()),
                false,
            )?;
        if !overwrite {
            bail!(
                "{} already exists; pass --force to replace it",
                ctx.config_path.display()
            );
        }
    }

    let answers = InitAnswers {
        project: args.name,
        host: args.host,
        user: args.user,
        port: args.port,
        remote_path: args.remote_path,
        ssh_key_path: args.ssh_key,
        branch: args.branch,
    };
    let config = InitWizard::new(InitDefaults::detect(&ctx.repo_root)).run(answers, interactive)?;
    config.validate()?;

    println!();
    println!("{}", interactive::format_summary(&config));
    println!();
    if interactive && !interactive::confirm_action("Save this configuration?", true)? {
        println!("{}", "Nothing written".dimmed());
        return Ok(ExitCode::SUCCESS);
    }

    config.save(&ctx.config_path)?;
    println!("{} Wrote {}", "✓".green(), ctx.config_path.display());

    let bundle_dir = config.resolve_path(&ctx.repo_root, &config.bundle.directory);
    fs::create_dir_all(&bundle_dir)
        .with_context(|| format!("Failed to create {}", bundle_dir.display()))?;

    match update_gitignore(&ctx.repo_root, &config.bundle.directory) {
        Ok(added) if !added.is_empty() => {
            println!("{} Added {} to .gitignore", "✓".green(), added.join(", "));
        }
        Ok(_) => {}
        Err(e) => println!("{} Could not update .gitignore: {e}", "⚠".yellow()),
    }

    if !LocalRepo::new(&ctx.repo_root).is_repository() {
        println!(
            "{} {} is not a git repository yet; run 'git init' before syncing",
            "⚠".yellow(),
            ctx.repo_root.display()
        );
    }

    println!();
    println!("{}", "Next steps".bold());
    println!("  gitsync doctor   check the connection");
    println!("  gitsync push     send this repository to the server");
    Ok(ExitCode::SUCCESS)
}

// =============================================================================
// Doctor
// =============================================================================

/// Outcome of one diagnostic: detail on success, reason on failure.
#[derive(Debug)]
struct Check {
    label: &'static str,
    outcome: Result<String, String>,
}

impl Check {
    fn new(label: &'static str, outcome: Result<String, String>) -> Self {
        Self { label, outcome }
    }

    fn print(&self) {
        match &self.outcome {
            Ok(detail) => println!("{} {:<18} {}", "✓".green(), self.label, detail.dimmed()),
            Err(reason) => println!("{} {:<18} {}", "✗".red(), self.label, reason.red()),
        }
    }
}

pub fn doctor(ctx: &Context) -> Result<ExitCode> {
    ui::print_banner("GitSync doctor");

    let mut checks = vec![local_git_check()];
    checks.push(Check::new(
        "repository",
        if LocalRepo::new(&ctx.repo_root).is_repository() {
            Ok(ctx.repo_root.display().to_string())
        } else {
            Err(format!("{} is not a git repository", ctx.repo_root.display()))
        },
    ));

    match ctx.load_config() {
        Ok(config) => {
            checks.push(Check::new("config", Ok(ctx.config_path.display().to_string())));
            let connector = SshConnector::new(config.endpoint());
            checks.extend(remote_checks(&connector, &config.server.remote_path));
        }
        Err(e) => checks.push(Check::new(CONFIG_FILE, Err(e.to_string()))),
    }

    for check in &checks {
        check.print();
    }
    let failed = checks.iter().filter(|c| c.outcome.is_err()).count();
    println!();
    if failed == 0 {
        println!("{} Ready to sync", "✓".green().bold());
        Ok(ExitCode::SUCCESS)
    } else {
        println!("{} {failed} check(s) failed", "✗".red().bold());
        Ok(ExitCode::FAILURE)
    }
}

fn local_git_check() -> Check {
    let outcome = which::which("git")
        .map_err(|_| "git not found on PATH".to_string())
        .and_then(|_| LocalRepo::git_version().map_err(|e| e.to_string()));
    Check::new("local git", outcome)
}

/// Connect once and check git and the project directory on the server.
fn remote_checks<C: Connector>(connector: &C, remote_root: &str) -> Vec<Check> {
    let mut checks = Vec::new();
    let reached = with_session(connector, |session| {
        checks.push(Check::new("ssh", Ok(connector.describe())));
        checks.push(Check::new(
            "server git",
            session
                .execute("git --version")
                .map(|out| out.trim().to_string())
                .map_err(|e| e.to_string()),
        ));
        checks.push(Check::new(
            "remote directory",
            session
                .execute(&scripts::ensure_dir_script(remote_root))
                .map(|_| remote_root.to_string())
                .map_err(|e| e.to_string()),
        ));
        Ok::<_, RemoteError>(())
    });
    if let Err(e) = reached {
        let reason = match e.hint() {
            Some(hint) => format!("{e}. {hint}"),
            None => e.to_string(),
        };
        checks.push(Check::new("ssh", Err(reason)));
    }
    checks
}

// =============================================================================
// Config, History, Completions
// =============================================================================

pub fn show_config(ctx: &Context) -> Result<ExitCode> {
    let config = ctx.load_config()?;
    println!("{}", format!("# {}", ctx.config_path.display()).dimmed());
    print!("{}", toml::to_string_pretty(&config)?);
    println!();
    println!("{}", "# resolved".dimmed());
    println!(
        "{}",
        format!(
            "# bundles: {}",
            config
                .resolve_path(&ctx.repo_root, &config.bundle.directory)
                .display()
        )
        .dimmed()
    );
    println!(
        "{}",
        format!(
            "# backups: {}",
            config
                .resolve_path(&ctx.repo_root, &config.bundle.backup_directory)
                .display()
        )
        .dimmed()
    );
    Ok(ExitCode::SUCCESS)
}

pub fn history(ctx: &Context, json: bool) -> Result<ExitCode> {
    let config = ctx.load_config()?;
    let dir = config.resolve_path(&ctx.repo_root, &config.bundle.directory);
    let entries = bundle::list_history(&dir)
        .with_context(|| format!("Failed to read {}", dir.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(ExitCode::SUCCESS);
    }

    ui::print_banner(&format!("Bundles in {}", dir.display()));
    if entries.is_empty() {
        println!("{}", "No bundles yet".dimmed());
        return Ok(ExitCode::SUCCESS);
    }
    for entry in &entries {
        println!(
            "  {}  {:>10}  {}",
            entry.created.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
            format_bytes(entry.size),
            entry.name
        );
    }
    println!();
    println!(
        "{} bundle(s), keeping at most {}",
        entries.len(),
        config.bundle.max_history
    );
    Ok(ExitCode::SUCCESS)
}

pub fn completions(shell: Shell) -> Result<ExitCode> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "gitsync", &mut io::stdout());
    Ok(ExitCode::SUCCESS)
}

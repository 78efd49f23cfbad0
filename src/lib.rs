pub mod bundle;
pub mod cli;
pub mod commands;
pub mod config;
pub mod git;
pub mod remote;
pub mod status;
pub mod sync;
pub mod ui;
pub mod watch;

#[cfg(test)]
pub mod test_support;

use std::process::ExitCode;

use anyhow::{Context as _, Result};

use crate::cli::{Cli, Commands};
use crate::commands::{Context, setup};

/// Library entrypoint: dispatch a parsed command line.
pub async fn run(cli: Cli) -> Result<ExitCode> {
    if let Commands::Completions { shell } = cli.command {
        return setup::completions(shell);
    }

    let ctx = Context::from_env(cli.config)?;
    match cli.command {
        Commands::Init(args) => blocking(move || setup::init(&ctx, args)).await,
        Commands::Push => blocking(move || commands::push(&ctx)).await,
        Commands::Pull { push } => blocking(move || commands::pull(&ctx, push)).await,
        Commands::Backup => blocking(move || commands::backup(&ctx)).await,
        Commands::Status { json } => blocking(move || commands::status(&ctx, json)).await,
        Commands::Diff => blocking(move || commands::diff(&ctx)).await,
        Commands::History { json } => setup::history(&ctx, json),
        Commands::Watch => watch(ctx).await,
        Commands::Doctor => blocking(move || setup::doctor(&ctx)).await,
        Commands::Config => setup::show_config(&ctx),
        Commands::Completions { .. } => Ok(ExitCode::SUCCESS),
    }
}

async fn blocking<F>(f: F) -> Result<ExitCode>
where
    F: FnOnce() -> Result<ExitCode> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("command task panicked")?
}

/// Run the watcher on the blocking pool until it fails or Ctrl-C arrives.
async fn watch(ctx: Context) -> Result<ExitCode> {
    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
    let mut handle = tokio::task::spawn_blocking(move || commands::watch(&ctx, stop_rx));

    tokio::select! {
        result = &mut handle => result.context("watch task panicked")?,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::warn!(error = %e, "failed to listen for Ctrl-C");
            }
            let _ = stop_tx.send(());
            handle.await.context("watch task panicked")?
        }
    }
}

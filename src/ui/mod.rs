//! Terminal output for sync sessions.
//!
//! Workflows never print. They report through an injected [`Reporter`], so
//! the CLI can draw spinners and progress bars while tests just record what
//! happened.

pub mod interactive;

use std::time::Duration;

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;

use crate::remote::TransferDirection;

/// Sink for user-facing progress of a sync session.
pub trait Reporter: Send + Sync {
    /// A step has started and may take a while.
    fn step(&self, message: &str);

    /// The current step finished.
    fn success(&self, message: &str);

    fn failure(&self, message: &str);

    fn warning(&self, message: &str);

    fn info(&self, message: &str);

    fn transfer_started(&self, direction: TransferDirection, name: &str, total: Option<u64>);

    fn transfer_progress(&self, bytes: u64, total: Option<u64>);

    fn transfer_finished(&self, bytes: u64);
}

/// [`Reporter`] drawing to the terminal with indicatif and colored.
#[derive(Default)]
pub struct ConsoleReporter {
    active: Mutex<Option<ProgressBar>>,
}

impl ConsoleReporter {
    pub fn new() -> Self {
        Self::default()
    }

    fn clear_active(&self) {
        if let Some(bar) = self.active.lock().take() {
            bar.finish_and_clear();
        }
    }

    fn replace_active(&self, bar: ProgressBar) {
        if let Some(old) = self.active.lock().replace(bar) {
            old.finish_and_clear();
        }
    }

    /// Print a line without tearing an active spinner or bar.
    fn print_line(&self, line: String) {
        match self.active.lock().as_ref() {
            Some(bar) => bar.suspend(|| println!("{line}")),
            None => println!("{line}"),
        }
    }
}

impl Reporter for ConsoleReporter {
    fn step(&self, message: &str) {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        spinner.set_style(style);
        spinner.set_message(message.to_string());
        spinner.enable_steady_tick(Duration::from_millis(100));
        self.replace_active(spinner);
    }

    fn success(&self, message: &str) {
        self.clear_active();
        println!("{} {}", "✓".green(), message);
    }

    fn failure(&self, message: &str) {
        self.clear_active();
        eprintln!("{} {}", "✗".red(), message.red());
    }

    fn warning(&self, message: &str) {
        self.print_line(format!("{} {}", "⚠".yellow(), message.yellow()));
    }

    fn info(&self, message: &str) {
        self.print_line(format!("  {}", message.dimmed()));
    }

    fn transfer_started(&self, direction: TransferDirection, name: &str, total: Option<u64>) {
        let verb = match direction {
            TransferDirection::Upload => "Uploading",
            TransferDirection::Download => "Downloading",
        };
        let bar = match total {
            Some(len) => {
                let bar = ProgressBar::new(len);
                let style = ProgressStyle::with_template(
                    "{msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
                )
                .map(|s| s.progress_chars("█▓░"))
                .unwrap_or_else(|_| ProgressStyle::default_bar());
                bar.set_style(style);
                bar
            }
            None => {
                let bar = ProgressBar::new_spinner();
                let style = ProgressStyle::with_template("{spinner:.cyan} {msg} {bytes}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner());
                bar.set_style(style);
                bar.enable_steady_tick(Duration::from_millis(100));
                bar
            }
        };
        bar.set_message(format!("{verb} {name}"));
        self.replace_active(bar);
    }

    fn transfer_progress(&self, bytes: u64, total: Option<u64>) {
        if let Some(bar) = self.active.lock().as_ref() {
            if let Some(total) = total
                && bar.length() != Some(total)
            {
                bar.set_length(total);
            }
            bar.set_position(bytes);
        }
    }

    fn transfer_finished(&self, bytes: u64) {
        self.clear_active();
        println!("{} Transferred {}", "✓".green(), format_bytes(bytes));
    }
}

/// Bold section header for a command.
pub fn print_banner(title: &str) {
    println!();
    println!("{}", title.bold().cyan());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Human readable byte count.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

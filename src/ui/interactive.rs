//! Interactive terminal prompts for `gitsync init`.
//!
//! The wizard asks for the handful of settings a project needs and fills
//! every other field with its default. Values passed as flags skip their
//! prompt, so the same code serves scripted and interactive setups.
//!
//! # Example
//!
//! ```rust,ignore
//! use gitsynq::ui::interactive::{InitAnswers, InitDefaults, InitWizard};
//!
//! let answers = InitAnswers { host: Some("192.168.12.4".into()), ..Default::default() };
//! let config = InitWizard::new(InitDefaults::detect(&repo_root)).run(answers, true)?;
//! ```

use std::fmt;
use std::io::IsTerminal;
use std::path::Path;

use colored::Colorize;
use dialoguer::{Confirm, Input, theme::ColorfulTheme};

use crate::config::{Config, DEFAULT_BRANCH, DEFAULT_PORT};
use crate::git::LocalRepo;

// =============================================================================
// Types
// =============================================================================

/// Suggested values shown in the prompts.
#[derive(Debug, Clone)]
pub struct InitDefaults {
    pub project: String,
    pub user: String,
    pub branch: String,
    pub remote_path: String,
}

impl InitDefaults {
    /// Guess defaults from the repository and the environment.
    pub fn detect(repo_root: &Path) -> Self {
        let project = repo_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "project".into());
        let branch = LocalRepo::new(repo_root)
            .current_branch()
            .ok()
            .flatten()
            .unwrap_or_else(|| DEFAULT_BRANCH.into());
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_default();
        Self {
            project,
            user,
            branch,
            remote_path: "~/projects".into(),
        }
    }
}

/// Values already known from the command line. `None` means "ask".
#[derive(Debug, Clone, Default)]
pub struct InitAnswers {
    pub project: Option<String>,
    pub host: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub remote_path: Option<String>,
    pub ssh_key_path: Option<String>,
    pub branch: Option<String>,
}

impl InitAnswers {
    fn is_complete(&self) -> bool {
        self.host.is_some()
    }
}

// =============================================================================
// Wizard
// =============================================================================

pub struct InitWizard {
    defaults: InitDefaults,
    theme: ColorfulTheme,
}

impl InitWizard {
    pub fn new(defaults: InitDefaults) -> Self {
        Self {
            defaults,
            theme: ColorfulTheme::default(),
        }
    }

    /// Build a config, prompting for whatever `answers` leaves open.
    ///
    /// With `interactive` off, missing values take their defaults and a
    /// missing host is an error.
    pub fn run(&self, answers: InitAnswers, interactive: bool) -> Result<Config, InteractiveError> {
        if !interactive {
            return self.from_answers(answers);
        }
        if !std::io::stdin().is_terminal() {
            return if answers.is_complete() {
                self.from_answers(answers)
            } else {
                Err(InteractiveError::NotATerminal)
            };
        }

        println!();
        println!("{}", "Configure GitSync for this repository".bold().underline());
        println!("{}", "Press enter to accept the suggested value.".dimmed());
        println!();

        let project = self.ask("Project name", answers.project, Some(&self.defaults.project))?;
        let host = self.ask("Server host or IP", answers.host, None)?;
        let user = self.ask("SSH user", answers.user, Some(&self.defaults.user))?;
        let port = match answers.port {
            Some(port) => port,
            None => Input::<u16>::with_theme(&self.theme)
                .with_prompt("SSH port")
                .default(DEFAULT_PORT)
                .interact_text()
                .map_err(prompt_error)?,
        };
        let remote_path = self.ask(
            "Directory on the server",
            answers.remote_path,
            Some(&self.defaults.remote_path),
        )?;
        let ssh_key_path = match answers.ssh_key_path {
            Some(key) => Some(key),
            None => Some(
                Input::<String>::with_theme(&self.theme)
                    .with_prompt("SSH key path (blank for ~/.ssh defaults and agent)")
                    .allow_empty(true)
                    .interact_text()
                    .map_err(prompt_error)?,
            ),
        };
        let branch = self.ask("Branch to sync", answers.branch, Some(&self.defaults.branch))?;

        self.from_answers(InitAnswers {
            project: Some(project),
            host: Some(host),
            user: Some(user),
            port: Some(port),
            remote_path: Some(remote_path),
            ssh_key_path,
            branch: Some(branch),
        })
    }

    fn ask(
        &self,
        prompt: &str,
        given: Option<String>,
        default: Option<&str>,
    ) -> Result<String, InteractiveError> {
        if let Some(value) = given {
            return Ok(value);
        }
        let mut input = Input::<String>::with_theme(&self.theme).with_prompt(prompt);
        if let Some(default) = default.filter(|d| !d.is_empty()) {
            input = input.default(default.to_string());
        }
        input
            .validate_with(|value: &String| -> Result<(), &str> {
                if value.trim().is_empty() {
                    Err("a value is required")
                } else {
                    Ok(())
                }
            })
            .interact_text()
            .map(|v| v.trim().to_string())
            .map_err(prompt_error)
    }

    /// Assemble a config from answers and defaults without prompting.
    pub fn from_answers(&self, answers: InitAnswers) -> Result<Config, InteractiveError> {
        let host = answers
            .host
            .filter(|h| !h.trim().is_empty())
            .ok_or(InteractiveError::Missing("host"))?;
        let user = answers
            .user
            .unwrap_or_else(|| self.defaults.user.clone());
        if user.trim().is_empty() {
            return Err(InteractiveError::Missing("user"));
        }

        let mut config = Config::new(
            answers.project.unwrap_or_else(|| self.defaults.project.clone()),
            host,
            user,
            answers
                .remote_path
                .unwrap_or_else(|| self.defaults.remote_path.clone()),
        );
        config.server.port = answers.port.unwrap_or(DEFAULT_PORT);
        config.server.ssh_key_path = answers.ssh_key_path.filter(|k| !k.trim().is_empty());
        config.project.branch = answers
            .branch
            .unwrap_or_else(|| self.defaults.branch.clone());
        Ok(config)
    }
}

fn prompt_error(err: dialoguer::Error) -> InteractiveError {
    match err {
        dialoguer::Error::IO(e) if e.kind() == std::io::ErrorKind::Interrupted => {
            InteractiveError::Cancelled
        }
        other => InteractiveError::IoError(other.to_string()),
    }
}

/// Multi-line summary of a config, for review before saving.
pub fn format_summary(config: &Config) -> String {
    let mut lines = vec![
        format!("{} {}", "Project:".bold(), config.project.name),
        format!(
            "{} {}@{}:{}",
            "Server:".bold(),
            config.server.user,
            config.server.host,
            config.server.port
        ),
        format!("{} {}", "Remote path:".bold(), config.server.remote_path),
        format!("{} {}", "Branch:".bold(), config.project.branch),
        format!("{} {}", "Bundles:".bold(), config.bundle.directory),
    ];
    if let Some(key) = &config.server.ssh_key_path {
        lines.push(format!("{} {}", "SSH key:".bold(), key));
    }
    lines.join("\n")
}

// =============================================================================
// Confirmation Prompts
// =============================================================================

/// Ask for confirmation before overwriting something.
pub fn confirm_action(message: &str, default: bool) -> Result<bool, InteractiveError> {
    if !std::io::stdin().is_terminal() {
        return Ok(default);
    }
    Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(message)
        .default(default)
        .interact()
        .map_err(prompt_error)
}

// =============================================================================
// Errors
// =============================================================================

/// Errors from interactive prompts.
#[derive(Debug)]
pub enum InteractiveError {
    /// User cancelled the prompt
    Cancelled,
    /// Prompts need a terminal on stdin
    NotATerminal,
    /// A required value was neither given nor prompted for
    Missing(&'static str),
    /// IO error during prompt
    IoError(String),
}

impl fmt::Display for InteractiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InteractiveError::Cancelled => write!(f, "Operation cancelled by user"),
            InteractiveError::NotATerminal => {
                write!(f, "Not a terminal; pass --host and the other settings as flags")
            }
            InteractiveError::Missing(field) => write!(f, "Missing required value: {}", field),
            InteractiveError::IoError(msg) => write!(f, "IO error: {}", msg),
        }
    }
}

impl std::error::Error for InteractiveError {}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> InitDefaults {
        InitDefaults {
            project: "demo".into(),
            user: "prince".into(),
            branch: "main".into(),
            remote_path: "~/projects".into(),
        }
    }

    #[test]
    fn test_from_answers_uses_defaults() {
        let wizard = InitWizard::new(defaults());
        let config = wizard
            .from_answers(InitAnswers {
                host: Some("10.0.0.5".into()),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(config.project.name, "demo");
        assert_eq!(config.server.user, "prince");
        assert_eq!(config.server.port, 22);
        assert_eq!(config.server.remote_path, "~/projects");
        assert_eq!(config.server.ssh_key_path, None);
        assert_eq!(config.project.branch, "main");
    }

    #[test]
    fn test_from_answers_requires_host() {
        let wizard = InitWizard::new(defaults());
        let err = wizard.from_answers(InitAnswers::default()).unwrap_err();
        assert!(matches!(err, InteractiveError::Missing("host")));
    }

    #[test]
    fn test_blank_key_means_none() {
        let wizard = InitWizard::new(defaults());
        let config = wizard
            .from_answers(InitAnswers {
                host: Some("h".into()),
                ssh_key_path: Some("  ".into()),
                port: Some(2222),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(config.server.ssh_key_path, None);
        assert_eq!(config.server.port, 2222);
    }

    #[test]
    fn test_non_interactive_run() {
        let wizard = InitWizard::new(defaults());
        let config = wizard
            .run(
                InitAnswers {
                    host: Some("h".into()),
                    user: Some("ci".into()),
                    ..Default::default()
                },
                false,
            )
            .unwrap();
        assert_eq!(config.server.user, "ci");
    }

    #[test]
    fn test_format_summary() {
        colored::control::set_override(false);
        let mut config = Config::new("demo", "10.0.0.5", "prince", "~/projects");
        config.server.ssh_key_path = Some("~/.ssh/k".into());

        let summary = format_summary(&config);

        assert!(summary.contains("Project: demo"));
        assert!(summary.contains("prince@10.0.0.5:22"));
        assert!(summary.contains("SSH key: ~/.ssh/k"));
    }

    #[test]
    fn test_detect_defaults_from_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("my-service");
        std::fs::create_dir(&root).unwrap();
        let detected = InitDefaults::detect(&root);
        assert_eq!(detected.project, "my-service");
        assert_eq!(detected.branch, "main");
    }

    #[test]
    fn test_interactive_error_display() {
        assert!(InteractiveError::Cancelled.to_string().contains("cancelled"));
        assert!(InteractiveError::Missing("host").to_string().contains("host"));
        assert!(InteractiveError::IoError("boom".into()).to_string().contains("boom"));
    }
}

use crate::config::{self, validate_install_dir, AgentConfig};
use crate::error::AgentError;
use crate::locator::{auto_detect, find_interpreter};
use dialoguer::console::{style, Term};
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Input};
use dirs::home_dir;
use std::env;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct SetupOptions {
    pub install_dir: Option<PathBuf>,
    pub companion_port: u16,
    pub agent_port: u16,
}

/// Strips shell-style quotes and expands a leading `~/`.
pub fn normalize_input_path(raw: &str) -> Result<PathBuf, AgentError> {
    let trimmed = raw.trim().trim_matches('"').trim_matches('\'').trim();
    let expanded = match trimmed.strip_prefix("~/") {
        Some(stripped) => match home_dir() {
            Some(home) => home.join(stripped),
            None => PathBuf::from(trimmed),
        },
        None => PathBuf::from(trimmed),
    };
    if expanded.is_absolute() || expanded.as_os_str().is_empty() {
        return Ok(expanded);
    }
    Ok(env::current_dir()?.join(expanded))
}

pub fn build_config(
    install_dir: &Path,
    companion_port: u16,
    agent_port: u16,
) -> Result<AgentConfig, AgentError> {
    let entry_script = validate_install_dir(install_dir).map_err(|reason| {
        AgentError::Config(format!(
            "{reason}: {} (select the folder containing 'server.py')",
            install_dir.display()
        ))
    })?;
    Ok(AgentConfig {
        install_dir: install_dir.to_path_buf(),
        interpreter: find_interpreter(install_dir),
        entry_script: entry_script.to_string(),
        companion_port,
        agent_port,
        setup_complete: true,
    })
}

fn prompt_install_dir() -> Result<PathBuf, AgentError> {
    if !io::stdin().is_terminal() {
        return Err(AgentError::Config(
            "interactive setup requires a TTY; re-run with `--install-dir <path>`".to_string(),
        ));
    }
    let theme = ColorfulTheme::default();
    if io::stdout().is_terminal() {
        let _ = Term::stdout().clear_screen();
    }
    println!("{}", style("T2AutoTron Local Agent - First Time Setup").bold().cyan());
    println!("This agent allows T2AutoTron to control Chatterbox TTS on your local computer.");
    println!(
        "{}",
        style("We need to know where Chatterbox is installed.").dim()
    );
    println!();
    println!("Looking for Chatterbox installation...");

    match auto_detect() {
        Some((path, _)) => {
            println!("{} {}", style("Found Chatterbox at:").green(), path.display());
            let accept = Confirm::with_theme(&theme)
                .with_prompt("Use this location?")
                .default(true)
                .interact()?;
            if accept {
                return Ok(path);
            }
        }
        None => println!("{}", style("Could not auto-detect Chatterbox.").yellow()),
    }

    let raw: String = Input::with_theme(&theme)
        .with_prompt("Path to your Chatterbox folder (the one containing server.py)")
        .allow_empty(true)
        .interact_text()?;
    let path = normalize_input_path(&raw)?;
    if path.as_os_str().is_empty() {
        return Err(AgentError::Config("No folder selected".to_string()));
    }
    Ok(path)
}

fn print_summary(cfg: &AgentConfig, config_path: &Path) {
    println!();
    println!("{}", style("Setup Complete!").bold().green());
    println!("  Chatterbox: {}", cfg.install_dir.display());
    println!("  Script:     {}", cfg.entry_script);
    println!("  Python:     {}", cfg.interpreter.display());
    println!("  Config:     {}", config_path.display());
    println!(
        "{}",
        style("Next time the agent starts it will skip setup.").dim()
    );
}

/// First-run flow. Persistence failures only warn; the in-memory config is returned.
pub fn run_setup(config_path: &Path, options: &SetupOptions) -> Result<AgentConfig, AgentError> {
    let install_dir = match &options.install_dir {
        Some(dir) => normalize_input_path(&dir.to_string_lossy())?,
        None => prompt_install_dir()?,
    };
    let cfg = build_config(&install_dir, options.companion_port, options.agent_port)?;
    if let Err(err) = config::save(config_path, &cfg) {
        tracing::warn!(path = %config_path.display(), error = %err, "could not save config");
        eprintln!(
            "{} could not save config: {err}",
            style("warning:").yellow().bold()
        );
    }
    print_summary(&cfg, config_path);
    Ok(cfg)
}

use crate::error::AgentError;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "t2_agent_config.json";
pub const CONFIG_ENV: &str = "T2_AGENT_CONFIG";
pub const DEFAULT_AGENT_PORT: u16 = 5050;
pub const DEFAULT_COMPANION_PORT: u16 = 8100;

/// Scripts that identify a Chatterbox installation, in priority order.
pub const ENTRY_SCRIPTS: [&str; 3] = ["server.py", "run_api_server.py", "app.py"];

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    #[serde(rename = "chatterbox_dir")]
    pub install_dir: PathBuf,
    #[serde(rename = "chatterbox_python")]
    pub interpreter: PathBuf,
    #[serde(rename = "chatterbox_script")]
    pub entry_script: String,
    #[serde(rename = "chatterbox_port")]
    pub companion_port: u16,
    pub agent_port: u16,
    pub setup_complete: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            install_dir: PathBuf::new(),
            interpreter: PathBuf::new(),
            entry_script: ENTRY_SCRIPTS[0].to_string(),
            companion_port: DEFAULT_COMPANION_PORT,
            agent_port: DEFAULT_AGENT_PORT,
            setup_complete: false,
        }
    }
}

impl AgentConfig {
    pub fn script_path(&self) -> PathBuf {
        self.install_dir.join(&self.entry_script)
    }
}

#[derive(Debug)]
pub enum LoadOutcome {
    Found(AgentConfig),
    Missing,
    Invalid(String),
}

impl LoadOutcome {
    pub fn found(self) -> Option<AgentConfig> {
        match self {
            LoadOutcome::Found(cfg) => Some(cfg),
            LoadOutcome::Missing | LoadOutcome::Invalid(_) => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidInstall {
    #[error("Directory does not exist")]
    MissingDirectory,
    #[error("Could not find Chatterbox scripts in this folder")]
    NoEntryScript,
}

pub fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    if let Ok(exe) = env::current_exe() {
        if let Some(dir) = exe.parent() {
            return dir.join(CONFIG_FILE_NAME);
        }
    }
    PathBuf::from(CONFIG_FILE_NAME)
}

/// Parse failures are reported as `Invalid` and never propagated.
pub fn load(path: &Path) -> LoadOutcome {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return LoadOutcome::Missing,
        Err(err) => return LoadOutcome::Invalid(format!("failed to read {}: {err}", path.display())),
    };
    match serde_json::from_str::<AgentConfig>(&content) {
        Ok(cfg) => LoadOutcome::Found(cfg),
        Err(err) => LoadOutcome::Invalid(format!("failed to parse {}: {err}", path.display())),
    }
}

/// Loads the config only if setup finished and the saved install dir still validates.
pub fn load_valid(path: &Path) -> Option<AgentConfig> {
    let outcome = load(path);
    if let LoadOutcome::Invalid(reason) = &outcome {
        tracing::warn!(%reason, "ignoring unreadable config");
    }
    let cfg = outcome.found()?;
    if !cfg.setup_complete || cfg.install_dir.as_os_str().is_empty() {
        tracing::info!(path = %path.display(), "saved config has not completed setup");
        return None;
    }
    match validate_install_dir(&cfg.install_dir) {
        Ok(_) => Some(cfg),
        Err(reason) => {
            tracing::warn!(
                dir = %cfg.install_dir.display(),
                %reason,
                "saved Chatterbox folder is no longer valid"
            );
            None
        }
    }
}

pub fn save(path: &Path, cfg: &AgentConfig) -> Result<(), AgentError> {
    let mut content = serde_json::to_string_pretty(cfg)?;
    content.push('\n');
    write_atomic_text_file(path, &content)
}

pub fn remove(path: &Path) -> Result<bool, AgentError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(AgentError::Io(err)),
    }
}

pub fn validate_install_dir(dir: &Path) -> Result<&'static str, InvalidInstall> {
    if dir.as_os_str().is_empty() || !dir.is_dir() {
        return Err(InvalidInstall::MissingDirectory);
    }
    ENTRY_SCRIPTS
        .iter()
        .copied()
        .find(|script| dir.join(script).exists())
        .ok_or(InvalidInstall::NoEntryScript)
}

fn ensure_parent(path: &Path) -> Result<(), AgentError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn write_atomic_text_file(path: &Path, content: &str) -> Result<(), AgentError> {
    ensure_parent(path)?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| AgentError::Config(format!("invalid config path: {}", path.display())))?;
    let tmp_path = path.with_file_name(format!(".{file_name}.tmp-{}", std::process::id()));
    fs::write(&tmp_path, content)?;
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(AgentError::Io(err));
    }
    Ok(())
}

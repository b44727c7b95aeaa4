use crate::config::AgentConfig;
use crate::controller::{ExitWatch, LaunchSpec, ProcessController, Spawned};
use crate::locator::default_interpreter;
use crate::probe::{LivenessProbe, ProbeOutcome};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

pub const RECONFIGURE_HINT: &str =
    "Delete t2_agent_config.json or run with --reconfigure to reconfigure";
const INITIALIZING_NOTE: &str = "Process spawned; Chatterbox may still be initializing";

#[derive(Debug, Clone, Copy)]
pub struct Timings {
    pub start_grace: Duration,
    pub stop_settle: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            start_grace: Duration::from_secs(2),
            stop_settle: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagedProcess {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    exit: ExitWatch,
}

impl ManagedProcess {
    pub fn has_exited(&self) -> bool {
        self.exit.has_exited()
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StartResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub already_running: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StopResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CompanionStatus {
    pub running: bool,
    pub port: u16,
    pub process_managed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
}

/// Owns the single companion handle. The lock only covers the handle slot;
/// probes, spawns, kills and sleeps run unlocked.
pub struct LifecycleManager {
    config: AgentConfig,
    controller: Box<dyn ProcessController>,
    probe: Box<dyn LivenessProbe>,
    timings: Timings,
    managed: Mutex<Option<ManagedProcess>>,
}

impl LifecycleManager {
    pub fn new(
        config: AgentConfig,
        controller: Box<dyn ProcessController>,
        probe: Box<dyn LivenessProbe>,
        timings: Timings,
    ) -> Self {
        Self {
            config,
            controller,
            probe,
            timings,
            managed: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn slot(&self) -> MutexGuard<'_, Option<ManagedProcess>> {
        self.managed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The tracked companion, dropping the handle once its process has exited.
    pub fn managed(&self) -> Option<ManagedProcess> {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(ManagedProcess::has_exited) {
            if let Some(process) = slot.take() {
                tracing::info!(pid = process.pid, "managed Chatterbox exited; clearing handle");
            }
        }
        slot.clone()
    }

    pub fn probe(&self) -> ProbeOutcome {
        self.probe.probe(self.config.companion_port)
    }

    pub fn is_running(&self) -> bool {
        self.probe().is_running()
    }

    pub fn status(&self) -> CompanionStatus {
        let running = self.is_running();
        let managed = self.managed();
        CompanionStatus {
            running,
            port: self.config.companion_port,
            process_managed: managed.is_some(),
            pid: managed.as_ref().map(|process| process.pid),
            started_at: managed.map(|process| process.started_at.to_rfc3339()),
        }
    }

    fn interpreter(&self) -> PathBuf {
        if !self.config.interpreter.as_os_str().is_empty() && self.config.interpreter.exists() {
            return self.config.interpreter.clone();
        }
        let fallback = default_interpreter();
        tracing::debug!(
            configured = %self.config.interpreter.display(),
            fallback = %fallback.display(),
            "configured interpreter missing; using default"
        );
        fallback
    }

    fn launch_spec(&self) -> LaunchSpec {
        let mut env_overrides = BTreeMap::new();
        env_overrides.insert("PYTHONIOENCODING".to_string(), "utf-8".to_string());
        env_overrides.insert("PYTHONUNBUFFERED".to_string(), "1".to_string());
        LaunchSpec {
            program: self.interpreter(),
            args: vec![self.config.entry_script.clone()],
            cwd: self.config.install_dir.clone(),
            env_overrides,
        }
    }

    pub fn start(&self) -> StartResult {
        if self.is_running() {
            return StartResult {
                success: true,
                message: Some("Already running".to_string()),
                already_running: Some(true),
                ..StartResult::default()
            };
        }

        let script_path = self.config.script_path();
        if !script_path.exists() {
            tracing::warn!(script = %script_path.display(), "companion entry script missing");
            return StartResult {
                success: false,
                error: Some(format!("Script not found: {}", script_path.display())),
                hint: Some(RECONFIGURE_HINT.to_string()),
                ..StartResult::default()
            };
        }

        let spec = self.launch_spec();
        let Spawned { pid, exit } = match self.controller.spawn(&spec) {
            Ok(spawned) => spawned,
            Err(err) => {
                tracing::warn!(program = %spec.program.display(), error = %err, "failed to spawn companion");
                return StartResult {
                    success: false,
                    error: Some(format!("Failed to start Chatterbox: {err}")),
                    ..StartResult::default()
                };
            }
        };
        *self.slot() = Some(ManagedProcess {
            pid,
            started_at: Utc::now(),
            exit,
        });
        tracing::info!(pid, script = %script_path.display(), "started Chatterbox");

        thread::sleep(self.timings.start_grace);
        let note = if self.is_running() {
            None
        } else {
            Some(INITIALIZING_NOTE.to_string())
        };
        StartResult {
            success: true,
            message: Some("Chatterbox started".to_string()),
            pid: Some(pid),
            note,
            ..StartResult::default()
        }
    }

    pub fn stop(&self) -> StopResult {
        let port = self.config.companion_port;

        let taken = self.slot().take();
        if let Some(process) = taken {
            if process.has_exited() {
                tracing::info!(pid = process.pid, "managed Chatterbox already exited");
            } else {
                match self.controller.kill_tree(process.pid) {
                    Ok(()) => tracing::info!(pid = process.pid, "stopped managed Chatterbox"),
                    Err(err) => {
                        tracing::warn!(pid = process.pid, error = %err, "failed to kill managed Chatterbox")
                    }
                }
            }
        }

        // Whatever owns the port is authoritative, tracked or not.
        let own_pid = std::process::id();
        match self.controller.pids_on_port(port) {
            Ok(pids) => {
                for pid in pids.into_iter().filter(|pid| *pid != own_pid) {
                    match self.controller.kill(pid) {
                        Ok(()) => tracing::info!(pid, port, "killed process holding companion port"),
                        Err(err) => tracing::warn!(pid, port, error = %err, "port sweep kill failed"),
                    }
                }
            }
            Err(err) => tracing::warn!(port, error = %err, "port lookup failed"),
        }

        thread::sleep(self.timings.stop_settle);
        if self.is_running() {
            StopResult {
                success: false,
                error: Some("Failed to stop".to_string()),
                ..StopResult::default()
            }
        } else {
            StopResult {
                success: true,
                message: Some("Stopped".to_string()),
                ..StopResult::default()
            }
        }
    }
}

use crate::error::AgentError;
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

#[cfg(windows)]
const CREATE_NEW_CONSOLE: u32 = 0x0000_0010;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env_overrides: BTreeMap<String, String>,
}

/// Flips once the reaper has seen the child exit.
#[derive(Debug, Clone, Default)]
pub struct ExitWatch(Arc<AtomicBool>);

impl ExitWatch {
    pub fn has_exited(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn mark_exited(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct Spawned {
    pub pid: u32,
    pub exit: ExitWatch,
}

/// OS process primitives used by the lifecycle manager.
pub trait ProcessController: Send + Sync {
    /// Spawns the companion detached from the agent.
    fn spawn(&self, spec: &LaunchSpec) -> Result<Spawned, io::Error>;
    fn kill_tree(&self, pid: u32) -> Result<(), AgentError>;
    fn pids_on_port(&self, port: u16) -> Result<Vec<u32>, AgentError>;
    fn kill(&self, pid: u32) -> Result<(), AgentError>;
}

pub fn platform_controller() -> Box<dyn ProcessController> {
    if cfg!(windows) {
        Box::new(WindowsController)
    } else {
        Box::new(UnixController)
    }
}

fn base_command(spec: &LaunchSpec) -> Command {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args).current_dir(&spec.cwd);
    for (key, value) in &spec.env_overrides {
        cmd.env(key, value);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::null());
    cmd
}

/// Waits on the child in the background so an exited companion is reaped.
fn reap_in_background(mut child: Child) -> Spawned {
    let pid = child.id();
    let exit = ExitWatch::default();
    let watch = exit.clone();
    thread::spawn(move || match child.wait() {
        Ok(status) => {
            watch.mark_exited();
            tracing::info!(pid, %status, "companion process exited");
        }
        Err(err) => tracing::warn!(pid, error = %err, "failed to wait on companion process"),
    });
    Spawned { pid, exit }
}

fn run_quiet(program: &str, args: &[String]) -> Result<std::process::Output, AgentError> {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|err| AgentError::Process(format!("failed to run {program}: {err}")))
}

fn require_success(program: &str, output: &std::process::Output) -> Result<(), AgentError> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let mut message = format!("{program} failed with status {}", output.status);
    if !stderr.is_empty() {
        message = format!("{message}: {stderr}");
    }
    Err(AgentError::Process(message))
}

pub struct UnixController;

impl ProcessController for UnixController {
    fn spawn(&self, spec: &LaunchSpec) -> Result<Spawned, io::Error> {
        let mut cmd = base_command(spec);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let child = cmd.spawn()?;
        Ok(reap_in_background(child))
    }

    fn kill_tree(&self, pid: u32) -> Result<(), AgentError> {
        // The companion leads its own process group, so signal the group first.
        let group = run_quiet(
            "kill",
            &["-KILL".to_string(), "--".to_string(), format!("-{pid}")],
        )?;
        if group.status.success() {
            return Ok(());
        }
        self.kill(pid)
    }

    fn pids_on_port(&self, port: u16) -> Result<Vec<u32>, AgentError> {
        if which::which("lsof").is_ok() {
            let output = run_quiet(
                "lsof",
                &[
                    "-nP".to_string(),
                    "-t".to_string(),
                    format!("-iTCP:{port}"),
                    "-sTCP:LISTEN".to_string(),
                ],
            )?;
            // lsof exits 1 when nothing matches.
            return Ok(parse_lsof_pids(&String::from_utf8_lossy(&output.stdout)));
        }
        if which::which("fuser").is_ok() {
            let output = run_quiet(
                "fuser",
                &["-n".to_string(), "tcp".to_string(), port.to_string()],
            )?;
            return Ok(parse_fuser_pids(&String::from_utf8_lossy(&output.stdout)));
        }
        Err(AgentError::Process(
            "neither lsof nor fuser is available for port lookup".to_string(),
        ))
    }

    fn kill(&self, pid: u32) -> Result<(), AgentError> {
        let output = run_quiet("kill", &["-KILL".to_string(), pid.to_string()])?;
        require_success("kill", &output)
    }
}

pub struct WindowsController;

impl ProcessController for WindowsController {
    fn spawn(&self, spec: &LaunchSpec) -> Result<Spawned, io::Error> {
        let mut cmd = base_command(spec);
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            cmd.creation_flags(CREATE_NEW_CONSOLE);
            // A new console gets its own standard handles.
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::inherit());
        }
        let child = cmd.spawn()?;
        Ok(reap_in_background(child))
    }

    fn kill_tree(&self, pid: u32) -> Result<(), AgentError> {
        let output = run_quiet(
            "taskkill",
            &[
                "/F".to_string(),
                "/T".to_string(),
                "/PID".to_string(),
                pid.to_string(),
            ],
        )?;
        require_success("taskkill", &output)
    }

    fn pids_on_port(&self, port: u16) -> Result<Vec<u32>, AgentError> {
        let output = run_quiet("netstat", &["-ano".to_string()])?;
        require_success("netstat", &output)?;
        Ok(parse_netstat_listeners(
            &String::from_utf8_lossy(&output.stdout),
            port,
        ))
    }

    fn kill(&self, pid: u32) -> Result<(), AgentError> {
        let output = run_quiet(
            "taskkill",
            &["/F".to_string(), "/PID".to_string(), pid.to_string()],
        )?;
        require_success("taskkill", &output)
    }
}

fn push_unique(pids: &mut Vec<u32>, pid: u32) {
    if pid != 0 && !pids.contains(&pid) {
        pids.push(pid);
    }
}

pub fn parse_lsof_pids(text: &str) -> Vec<u32> {
    let mut pids = Vec::new();
    for line in text.lines() {
        if let Ok(pid) = line.trim().parse::<u32>() {
            push_unique(&mut pids, pid);
        }
    }
    pids
}

/// Parses `fuser -n tcp <port>` output such as `8100/tcp:   4242  4343`.
pub fn parse_fuser_pids(text: &str) -> Vec<u32> {
    let mut pids = Vec::new();
    for line in text.lines() {
        let rest = line.split_once(':').map(|(_, rest)| rest).unwrap_or(line);
        for token in rest.split_whitespace() {
            let digits = token.trim_end_matches(|ch: char| !ch.is_ascii_digit());
            if let Ok(pid) = digits.parse::<u32>() {
                push_unique(&mut pids, pid);
            }
        }
    }
    pids
}

/// Picks owning pids from `netstat -ano` rows listening on `port`.
pub fn parse_netstat_listeners(text: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{port}");
    let mut pids = Vec::new();
    for line in text.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 5 || !parts[0].eq_ignore_ascii_case("tcp") {
            continue;
        }
        if !parts[1].ends_with(&suffix) || !parts[3].eq_ignore_ascii_case("LISTENING") {
            continue;
        }
        if let Some(Ok(pid)) = parts.last().map(|raw| raw.parse::<u32>()) {
            push_unique(&mut pids, pid);
        }
    }
    pids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsof_output_yields_unique_pids() {
        assert_eq!(parse_lsof_pids("4242\n4343\n4242\n\n"), vec![4242, 4343]);
        assert!(parse_lsof_pids("").is_empty());
    }

    #[test]
    fn lsof_output_skips_garbage() {
        assert_eq!(parse_lsof_pids("lsof: warning\n77\n"), vec![77]);
    }

    #[test]
    fn fuser_output_parses_pids_after_colon() {
        assert_eq!(parse_fuser_pids("8100/tcp:             4242  4343"), vec![4242, 4343]);
        assert_eq!(parse_fuser_pids(" 4242e"), vec![4242]);
        assert!(parse_fuser_pids("").is_empty());
    }

    #[test]
    fn netstat_output_matches_exact_port_listeners() {
        let text = "\
Active Connections

  Proto  Local Address          Foreign Address        State           PID
  TCP    0.0.0.0:8100           0.0.0.0:0              LISTENING       4242
  TCP    0.0.0.0:81000          0.0.0.0:0              LISTENING       9999
  TCP    127.0.0.1:8100         127.0.0.1:50123        ESTABLISHED     4242
  TCP    [::]:8100              [::]:0                 LISTENING       4343
  TCP    127.0.0.1:5050         0.0.0.0:0              LISTENING       1111
  UDP    0.0.0.0:8100           *:*                                    5555
  TCP    0.0.0.0:8100           0.0.0.0:0              LISTENING       notapid
";
        assert_eq!(parse_netstat_listeners(text, 8100), vec![4242, 4343]);
        assert_eq!(parse_netstat_listeners(text, 5050), vec![1111]);
        assert!(parse_netstat_listeners(text, 9000).is_empty());
    }

    #[cfg(unix)]
    fn spawn_shell(script: &str) -> (UnixController, Spawned, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let spec = LaunchSpec {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: dir.path().to_path_buf(),
            env_overrides: BTreeMap::new(),
        };
        let controller = UnixController;
        let spawned = controller.spawn(&spec).expect("spawn sh");
        (controller, spawned, dir)
    }

    #[cfg(unix)]
    fn wait_for_exit(exit: &ExitWatch) -> bool {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while std::time::Instant::now() < deadline {
            if exit.has_exited() {
                return true;
            }
            thread::sleep(std::time::Duration::from_millis(50));
        }
        false
    }

    #[cfg(unix)]
    #[test]
    fn unix_spawn_marks_exit_when_child_finishes() {
        let (_controller, spawned, _dir) = spawn_shell("exit 0");
        assert!(spawned.pid > 0);
        assert!(wait_for_exit(&spawned.exit));
    }

    #[cfg(unix)]
    #[test]
    fn unix_kill_tree_ends_group_that_ignores_sigterm() {
        let (controller, spawned, _dir) =
            spawn_shell("trap '' TERM; while :; do sleep 1; done");
        thread::sleep(std::time::Duration::from_millis(200));
        assert!(!spawned.exit.has_exited());
        controller.kill_tree(spawned.pid).expect("kill tree");
        assert!(wait_for_exit(&spawned.exit));
    }

    #[cfg(unix)]
    #[test]
    fn unix_port_sweep_finds_and_kills_foreign_listener() {
        use std::net::{TcpListener, TcpStream};
        use std::os::unix::process::ExitStatusExt;
        use std::time::{Duration, Instant};

        if which::which("python3").is_err()
            || (which::which("lsof").is_err() && which::which("fuser").is_err())
        {
            eprintln!("skipping: python3 and lsof or fuser are required");
            return;
        }
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let mut child = Command::new("python3")
            .arg("-c")
            .arg(format!(
                "import socket, time\n\
                 s = socket.socket()\n\
                 s.setsockopt(socket.SOL_SOCKET, socket.SO_REUSEADDR, 1)\n\
                 s.bind(('127.0.0.1', {port}))\n\
                 s.listen(1)\n\
                 time.sleep(60)\n"
            ))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn listener");

        let deadline = Instant::now() + Duration::from_secs(10);
        while TcpStream::connect(("127.0.0.1", port)).is_err() {
            assert!(Instant::now() < deadline, "listener never bound");
            thread::sleep(Duration::from_millis(50));
        }

        let controller = UnixController;
        let pids = controller.pids_on_port(port).expect("port lookup");
        assert!(pids.contains(&child.id()), "{pids:?} lacks {}", child.id());

        controller.kill(child.id()).expect("kill listener");
        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(9));
        assert!(controller.pids_on_port(port).unwrap().is_empty());
    }
}

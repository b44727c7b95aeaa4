use crate::config::validate_install_dir;
use dirs::home_dir;
use std::env;
use std::path::{Path, PathBuf};

/// Ordered install locations to probe. The first valid one wins.
pub fn candidate_dirs(os: &str, home: Option<&Path>, username: &str) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if os == "windows" {
        for path in [
            r"C:\Chatterbox",
            r"C:\chatterbox",
            r"C:\chatterbox-master",
            r"C:\Chatterbox-TTS",
        ] {
            dirs.push(PathBuf::from(path));
        }
        if !username.is_empty() {
            let profile = PathBuf::from(r"C:\Users").join(username);
            dirs.push(profile.join("Chatterbox"));
            dirs.push(profile.join("chatterbox"));
            dirs.push(profile.join("Documents").join("Chatterbox"));
            dirs.push(profile.join("Desktop").join("Chatterbox"));
        }
        dirs.push(PathBuf::from(r"C:\AI\Chatterbox"));
        dirs.push(PathBuf::from(r"D:\Chatterbox"));
    }
    if let Some(home) = home {
        dirs.push(home.join("Chatterbox"));
        dirs.push(home.join("chatterbox"));
        dirs.push(home.join("chatterbox-master"));
    }
    dirs
}

pub fn auto_detect_in(candidates: &[PathBuf]) -> Option<(PathBuf, &'static str)> {
    candidates.iter().find_map(|dir| {
        validate_install_dir(dir)
            .ok()
            .map(|script| (dir.clone(), script))
    })
}

pub fn auto_detect() -> Option<(PathBuf, &'static str)> {
    let username = env::var("USERNAME")
        .or_else(|_| env::var("USER"))
        .unwrap_or_default();
    let home = home_dir();
    let candidates = candidate_dirs(env::consts::OS, home.as_deref(), &username);
    auto_detect_in(&candidates)
}

fn venv_interpreter_candidates(install_dir: &Path, os: &str) -> Vec<PathBuf> {
    let (bin_dir, exe) = if os == "windows" {
        ("Scripts", "python.exe")
    } else {
        ("bin", "python")
    };
    ["venv", ".venv", "env"]
        .iter()
        .map(|venv| install_dir.join(venv).join(bin_dir).join(exe))
        .collect()
}

/// Prefers a virtualenv inside the install dir; always yields a value.
pub fn find_interpreter(install_dir: &Path) -> PathBuf {
    venv_interpreter_candidates(install_dir, env::consts::OS)
        .into_iter()
        .find(|candidate| candidate.exists())
        .unwrap_or_else(default_interpreter)
}

pub fn default_interpreter() -> PathBuf {
    ["python3", "python"]
        .iter()
        .find_map(|name| which::which(name).ok())
        .unwrap_or_else(|| PathBuf::from("python3"))
}

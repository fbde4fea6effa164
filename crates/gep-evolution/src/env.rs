use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use rand::RngCore;
use serde_json::Value;

use crate::{sha256_hex, EnvFingerprint};

/// Inputs for fingerprint capture that the caller decides, not the process environment.
#[derive(Clone, Debug, Default)]
pub struct EnvProbe {
    pub device_id: Option<String>,
    pub state_dir: PathBuf,
    pub repo_root: PathBuf,
}

pub fn capture_env_fingerprint(probe: &EnvProbe) -> EnvFingerprint {
    let node_version = Command::new("node")
        .arg("--version")
        .output()
        .ok()
        .filter(|output| output.status.success())
        .map(|output| String::from_utf8_lossy(&output.stdout).trim().to_string())
        .filter(|version| !version.is_empty());
    let evolver_version = fs::read_to_string(probe.repo_root.join("package.json"))
        .ok()
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok())
        .and_then(|manifest| {
            manifest
                .get("version")
                .and_then(Value::as_str)
                .map(str::to_string)
        });
    let cwd = std::env::current_dir()
        .map(|dir| dir.display().to_string())
        .unwrap_or_default();

    EnvFingerprint {
        device_id: resolve_device_id(probe.device_id.as_deref(), &probe.state_dir),
        node_version,
        platform: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        os_release: read_trimmed("/proc/sys/kernel/osrelease").unwrap_or_default(),
        hostname: read_trimmed("/proc/sys/kernel/hostname")
            .or_else(|| read_trimmed("/etc/hostname"))
            .unwrap_or_else(|| "unknown".into()),
        evolver_version,
        cwd,
        container: detect_container(),
    }
}

/// First 16 hex chars of SHA-256 over the identity-relevant fingerprint fields.
pub fn env_fingerprint_key(env: &EnvFingerprint) -> String {
    let material = [
        env.device_id.as_str(),
        env.node_version.as_deref().unwrap_or(""),
        env.platform.as_str(),
        env.arch.as_str(),
        env.hostname.as_str(),
        env.evolver_version.as_deref().unwrap_or(""),
    ]
    .join("|");
    sha256_hex(&material)[..16].to_string()
}

pub fn is_same_env_class(left: &EnvFingerprint, right: &EnvFingerprint) -> bool {
    env_fingerprint_key(left) == env_fingerprint_key(right)
}

/// Explicit id, then the persisted id under `state_dir`, then the machine id,
/// then a fresh random id that is persisted for later runs.
pub fn resolve_device_id(explicit: Option<&str>, state_dir: &Path) -> String {
    if let Some(id) = explicit.map(str::trim).filter(|id| is_device_id(id)) {
        return id.to_string();
    }
    let persisted = state_dir.join("device_id");
    if let Some(id) = read_trimmed(&persisted).filter(|id| is_device_id(id)) {
        return id;
    }
    let id = match read_trimmed("/etc/machine-id").filter(|id| !id.is_empty()) {
        Some(machine_id) => sha256_hex(&machine_id)[..32].to_string(),
        None => {
            let mut bytes = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut bytes);
            hex::encode(bytes)
        }
    };
    if fs::create_dir_all(state_dir).is_ok() {
        if let Err(err) = fs::write(&persisted, format!("{id}\n")) {
            log::warn!(
                "device_id_persist_failed path={} error={}",
                persisted.display(),
                err
            );
        }
    }
    id
}

fn is_device_id(candidate: &str) -> bool {
    (16..=64).contains(&candidate.len()) && candidate.chars().all(|ch| ch.is_ascii_hexdigit())
}

fn detect_container() -> bool {
    if Path::new("/.dockerenv").exists() || Path::new("/run/.containerenv").exists() {
        return true;
    }
    fs::read_to_string("/proc/1/cgroup")
        .map(|cgroup| cgroup_indicates_container(&cgroup))
        .unwrap_or(false)
}

fn cgroup_indicates_container(cgroup: &str) -> bool {
    ["docker", "kubepods", "containerd", "cri-o", "lxc", "ecs"]
        .iter()
        .any(|marker| cgroup.contains(marker))
}

fn read_trimmed<P: AsRef<Path>>(path: P) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|raw| raw.trim().to_string())
}

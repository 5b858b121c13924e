//! Process control for the self-managed runtime
//! Spawning, locating by executable path, and targeted termination.
//! OS-specific commands live here so the provisioner stays platform-agnostic.

use std::collections::HashMap;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use parking_lot::Mutex;

use super::ProvisionError;

/// Spawn/locate/terminate seam used by the provisioner
pub trait ProcessControl: Send + Sync {
    /// Launch `executable` detached with extra environment; returns its pid
    fn spawn(
        &self,
        executable: &Path,
        args: &[&str],
        env: &[(String, String)],
    ) -> Result<u32, ProvisionError>;

    /// Pids of running processes whose executable is exactly `executable`
    fn find_by_executable(&self, executable: &Path) -> Result<Vec<u32>, ProvisionError>;

    fn terminate(&self, pid: u32) -> Result<(), ProvisionError>;
}

/// Real process control backed by the host OS.
/// Children spawned here are kept so they can be reaped once terminated.
#[derive(Debug, Default)]
pub struct SystemProcessControl {
    children: Mutex<HashMap<u32, Child>>,
}

impl SystemProcessControl {
    /// Wait on a terminated child off the caller's thread
    fn reap(&self, pid: u32) {
        if let Some(mut child) = self.children.lock().remove(&pid) {
            std::thread::spawn(move || {
                if let Err(e) = child.wait() {
                    tracing::debug!("Failed to reap runtime process {}: {}", pid, e);
                }
            });
        }
    }
}

impl ProcessControl for SystemProcessControl {
    fn spawn(
        &self,
        executable: &Path,
        args: &[&str],
        env: &[(String, String)],
    ) -> Result<u32, ProvisionError> {
        let child = Command::new(executable)
            .args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| ProvisionError::Spawn(format!("{}: {}", executable.display(), e)))?;
        let pid = child.id();
        self.children.lock().insert(pid, child);
        Ok(pid)
    }

    #[cfg(target_os = "linux")]
    fn find_by_executable(&self, executable: &Path) -> Result<Vec<u32>, ProvisionError> {
        let target = normalize(executable);
        let mut pids = Vec::new();
        for entry in std::fs::read_dir("/proc")? {
            let Ok(entry) = entry else { continue };
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            // Processes owned by other users are unreadable; skip them
            if let Ok(exe) = std::fs::read_link(entry.path().join("exe")) {
                if normalize(&exe) == target {
                    pids.push(pid);
                }
            }
        }
        pids.sort_unstable();
        Ok(pids)
    }

    #[cfg(all(unix, not(target_os = "linux")))]
    fn find_by_executable(&self, executable: &Path) -> Result<Vec<u32>, ProvisionError> {
        let output = Command::new("ps")
            .args(["-axo", "pid=,args="])
            .output()
            .map_err(|e| ProvisionError::Process(format!("ps failed: {}", e)))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_ps_output(&stdout, executable))
    }

    #[cfg(windows)]
    fn find_by_executable(&self, executable: &Path) -> Result<Vec<u32>, ProvisionError> {
        let output = Command::new("wmic")
            .args(["process", "get", "ProcessId,ExecutablePath", "/format:csv"])
            .output()
            .map_err(|e| ProvisionError::Process(format!("wmic failed: {}", e)))?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_wmic_csv(&stdout, executable))
    }

    #[cfg(unix)]
    fn terminate(&self, pid: u32) -> Result<(), ProvisionError> {
        let status = Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .status()
            .map_err(|e| ProvisionError::Process(format!("kill failed: {}", e)))?;
        if !status.success() {
            return Err(ProvisionError::Process(format!("kill -TERM {} exited with {}", pid, status)));
        }
        self.reap(pid);
        Ok(())
    }

    #[cfg(windows)]
    fn terminate(&self, pid: u32) -> Result<(), ProvisionError> {
        let status = Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .status()
            .map_err(|e| ProvisionError::Process(format!("taskkill failed: {}", e)))?;
        if !status.success() {
            return Err(ProvisionError::Process(format!("taskkill {} exited with {}", pid, status)));
        }
        self.reap(pid);
        Ok(())
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn normalize(path: &Path) -> std::path::PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Parse `ps -axo pid=,args=` output, matching the first argv entry exactly
#[cfg_attr(any(target_os = "linux", windows), allow(dead_code))]
pub(crate) fn parse_ps_output(output: &str, executable: &Path) -> Vec<u32> {
    let target = executable.to_string_lossy();
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (pid, args) = line.split_once(char::is_whitespace)?;
            let pid = pid.parse::<u32>().ok()?;
            let args = args.trim_start();
            // The path may contain spaces, so compare on the prefix boundary
            let matches = args == target
                || args
                    .strip_prefix(target.as_ref())
                    .map(|rest| rest.starts_with(' '))
                    .unwrap_or(false);
            matches.then_some(pid)
        })
        .collect()
}

/// Parse `wmic ... /format:csv` output (`Node,ExecutablePath,ProcessId`)
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn parse_wmic_csv(output: &str, executable: &Path) -> Vec<u32> {
    let target = executable.to_string_lossy().to_lowercase();
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let mut fields = line.rsplitn(2, ',');
            let pid = fields.next()?.trim().parse::<u32>().ok()?;
            let rest = fields.next()?;
            let (_, path) = rest.split_once(',')?;
            (path.trim().to_lowercase() == target).then_some(pid)
        })
        .collect()
}

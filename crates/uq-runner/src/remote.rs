use crate::hosts::{Host, HostsConfig};
use anyhow::{anyhow, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use tracing::debug;

/// Remote shell and remote copy towards the pool's hosts. Hosts flagged
/// `local` are reached through `sh -c` and a plain file copy.
#[derive(Debug, Clone)]
pub struct RemoteChannel {
    shell: Vec<String>,
    copy: Vec<String>,
}

impl RemoteChannel {
    pub fn new(config: &HostsConfig) -> Self {
        Self {
            shell: config.remote_shell.clone(),
            copy: config.remote_copy.clone(),
        }
    }

    fn shell_command(&self, host: &Host, script: &str) -> Command {
        if host.local {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(script);
            cmd
        } else {
            let mut cmd = Command::new(&self.shell[0]);
            cmd.args(&self.shell[1..]).arg(&host.name).arg(script);
            cmd
        }
    }

    /// Runs `script` on `host` and waits for it; returns its stdout.
    pub fn run_sync(&self, host: &Host, script: &str) -> Result<String> {
        debug!(host = %host.name, script, "remote call");
        let output = self
            .shell_command(host, script)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| anyhow!("failed to reach host {}: {}", host.name, e))?;
        if !output.status.success() {
            let stderr_tail = String::from_utf8_lossy(&output.stderr)
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no output on stderr")
                .to_string();
            return Err(anyhow!(
                "remote call on {} failed ({}): {}",
                host.name,
                output.status,
                stderr_tail
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Creates a fresh private directory below the host's scratch path.
    pub fn make_scratch_dir(&self, host: &Host) -> Result<PathBuf> {
        let scratch = shell_quote(&host.scratch.to_string_lossy());
        let script = format!(
            "mkdir -p {} && mktemp -d {}/uq_worker.XXXXXX",
            scratch, scratch
        );
        let stdout = self.run_sync(host, &script)?;
        let dir = stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| anyhow!("host {} returned no scratch directory", host.name))?;
        Ok(PathBuf::from(dir))
    }

    /// Starts `script` on `host` without waiting. Stdin is piped so the
    /// caller can hand the worker its payload.
    pub fn spawn(&self, host: &Host, script: &str) -> Result<Child> {
        debug!(host = %host.name, script, "spawn remote worker");
        self.shell_command(host, script)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| anyhow!("failed to spawn worker on {}: {}", host.name, e))
    }

    /// Copies `remote` on `host` to the local path `local`.
    pub fn fetch(&self, host: &Host, remote: &Path, local: &Path) -> Result<()> {
        if let Some(parent) = local.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        if host.local {
            if remote != local {
                fs::copy(remote, local).map_err(|e| {
                    anyhow!("failed to copy {} to {}: {}", remote.display(), local.display(), e)
                })?;
            }
            return Ok(());
        }
        let source = format!("{}:{}", host.name, remote.display());
        debug!(source = %source, dest = %local.display(), "remote copy");
        let status = Command::new(&self.copy[0])
            .args(&self.copy[1..])
            .arg(&source)
            .arg(local)
            .stdin(Stdio::null())
            .status()
            .map_err(|e| anyhow!("failed to start {}: {}", self.copy[0], e))?;
        if !status.success() {
            return Err(anyhow!("copy of {} failed ({})", source, status));
        }
        Ok(())
    }
}

pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

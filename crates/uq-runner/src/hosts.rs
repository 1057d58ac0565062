use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_BACKOFF_MS: u64 = 100;

fn default_backoff_ms() -> u64 {
    DEFAULT_BACKOFF_MS
}

fn default_shell() -> Vec<String> {
    vec!["ssh".to_string(), "-o".to_string(), "BatchMode=yes".to_string()]
}

fn default_copy() -> Vec<String> {
    vec!["scp".to_string(), "-q".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostEntry {
    pub slots: usize,
    #[serde(default)]
    pub free: Option<usize>,
    pub scratch: PathBuf,
    #[serde(default)]
    pub local: bool,
}

/// Static host table plus the programs used to reach the hosts.
#[derive(Debug, Clone, Deserialize)]
pub struct HostsConfig {
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_shell")]
    pub remote_shell: Vec<String>,
    #[serde(default = "default_copy")]
    pub remote_copy: Vec<String>,
    pub hosts: BTreeMap<String, HostEntry>,
}

impl HostsConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read hosts file {}: {}", path.display(), e))?;
        let config: HostsConfig = serde_yaml::from_str(&raw)
            .map_err(|e| anyhow!("invalid hosts file {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(anyhow!("hosts table is empty"));
        }
        if self.remote_shell.is_empty() || self.remote_copy.is_empty() {
            return Err(anyhow!("remote_shell and remote_copy must name a program"));
        }
        for (name, entry) in &self.hosts {
            if entry.slots == 0 {
                return Err(anyhow!("host {} has no slots", name));
            }
            if entry.free.is_some_and(|free| free > entry.slots) {
                return Err(anyhow!(
                    "host {} has more free slots than slots ({} > {})",
                    name,
                    entry.free.unwrap_or_default(),
                    entry.slots
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Host {
    pub name: String,
    pub total_slots: usize,
    pub free_slots: usize,
    pub scratch: PathBuf,
    pub local: bool,
}

/// Worker slots of a fixed set of hosts, owned by the orchestrating process.
#[derive(Debug)]
pub struct HostPool {
    hosts: BTreeMap<String, Host>,
    backoff: Duration,
    rng: StdRng,
}

impl HostPool {
    pub fn new(config: &HostsConfig) -> Self {
        Self::with_rng(config, StdRng::from_os_rng())
    }

    pub fn with_rng(config: &HostsConfig, rng: StdRng) -> Self {
        let hosts = config
            .hosts
            .iter()
            .map(|(name, entry)| {
                let host = Host {
                    name: name.clone(),
                    total_slots: entry.slots,
                    free_slots: entry.free.unwrap_or(entry.slots),
                    scratch: entry.scratch.clone(),
                    local: entry.local,
                };
                (name.clone(), host)
            })
            .collect();
        Self {
            hosts,
            backoff: Duration::from_millis(config.backoff_ms),
            rng,
        }
    }

    pub fn seeded(config: &HostsConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    pub fn host(&self, name: &str) -> Option<&Host> {
        self.hosts.get(name)
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    pub fn total_slots(&self) -> usize {
        self.hosts.values().map(|h| h.total_slots).sum()
    }

    pub fn free_slots(&self) -> usize {
        self.hosts.values().map(|h| h.free_slots).sum()
    }

    /// Picks a host with probability proportional to its free slots and
    /// takes one slot. Sleeps the backoff interval either way; `None` means
    /// every slot is taken and the caller has to retry.
    pub fn acquire(&mut self) -> Option<String> {
        let weighted: Vec<&str> = self
            .hosts
            .values()
            .flat_map(|h| std::iter::repeat(h.name.as_str()).take(h.free_slots))
            .collect();
        if weighted.is_empty() {
            thread::sleep(self.backoff);
            return None;
        }
        let name = weighted[self.rng.random_range(0..weighted.len())].to_string();
        if let Some(host) = self.hosts.get_mut(&name) {
            host.free_slots -= 1;
            debug!(host = %name, free = host.free_slots, "host slot acquired");
        }
        thread::sleep(self.backoff);
        Some(name)
    }

    pub fn release(&mut self, name: &str) {
        match self.hosts.get_mut(name) {
            Some(host) if host.free_slots < host.total_slots => {
                host.free_slots += 1;
                debug!(host = %name, free = host.free_slots, "host slot released");
            }
            Some(host) => {
                warn!(host = %name, slots = host.total_slots, "release on a host with no slot taken");
            }
            None => warn!(host = %name, "release on an unknown host"),
        }
    }
}

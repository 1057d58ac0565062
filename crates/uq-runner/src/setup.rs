use crate::stages::{StageCommands, TimeWindow};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

fn default_true() -> bool {
    true
}

/// Everything needed to build an identically configured pipeline, in the
/// orchestrator and in every worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Setup {
    pub cache_file: PathBuf,
    #[serde(default = "default_true")]
    pub verbose: bool,
    #[serde(default)]
    pub time: TimeWindow,
    pub stages: StageCommands,
    #[serde(default = "default_true")]
    pub save_after_each_run: bool,
    #[serde(default)]
    pub expected_samples: Option<usize>,
    #[serde(default)]
    pub worker_program: Option<String>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
}

impl Setup {
    /// Loads a YAML (or JSON) setup file. Relative paths are resolved against
    /// the directory holding the file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read setup {}: {}", path.display(), e))?;
        let mut setup: Setup = serde_yaml::from_str(&raw)
            .map_err(|e| anyhow!("invalid setup {}: {}", path.display(), e))?;
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
        setup.resolve_paths(&base);
        setup.validate()?;
        Ok(setup)
    }

    fn resolve_paths(&mut self, base: &Path) {
        if self.cache_file.is_relative() {
            self.cache_file = base.join(&self.cache_file);
        }
        let workdir = self.workdir.take().unwrap_or_else(|| base.to_path_buf());
        self.workdir = Some(if workdir.is_relative() {
            base.join(workdir)
        } else {
            workdir
        });
    }

    pub fn validate(&self) -> Result<()> {
        if self.stages.simulate.is_empty() {
            return Err(anyhow!("missing /stages/simulate"));
        }
        if self.cache_file.file_name().is_none() {
            return Err(anyhow!(
                "cache_file must name a file: {}",
                self.cache_file.display()
            ));
        }
        if let Some(dt) = self.time.dt {
            if dt <= 0.0 {
                return Err(anyhow!("time.dt must be positive, got {}", dt));
            }
        }
        Ok(())
    }

    /// sha256 over the canonical JSON form, `sha256:<hex>`.
    pub fn digest(&self) -> Result<String> {
        let bytes = serde_json::to_vec(self)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
    }
}

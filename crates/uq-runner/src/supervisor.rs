use crate::hosts::HostPool;
use crate::split::Chunk;
use anyhow::Result;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{Child, ExitStatus};
use tracing::{info, warn};

/// Where a worker writes its cache and where the orchestrator copies it to.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultFile {
    pub host: String,
    pub remote: PathBuf,
    pub local: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ChildRecord {
    pub start_index: u64,
    pub output: ResultFile,
    pub host: String,
    pub chunk: Chunk,
}

/// A spawned worker process together with what it was asked to do.
#[derive(Debug)]
pub struct WorkerHandle {
    child: Child,
    record: ChildRecord,
}

impl WorkerHandle {
    pub fn new(child: Child, record: ChildRecord) -> Self {
        Self { child, record }
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn record(&self) -> &ChildRecord {
        &self.record
    }

    pub fn try_join(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    pub fn join(&mut self) -> Result<ExitStatus> {
        Ok(self.child.wait()?)
    }
}

#[derive(Debug, Clone)]
pub enum ChildOutcome {
    Completed(ChildRecord),
    Crashed {
        pid: Option<u32>,
        status: String,
        record: ChildRecord,
    },
}

/// Tracks outstanding workers by pid. Reaping a worker frees its host slot;
/// completed workers queue their result file, crashed ones their chunk.
#[derive(Debug, Default)]
pub struct ChildSupervisor {
    children: BTreeMap<u32, WorkerHandle>,
    completed: Vec<ChildRecord>,
    crashed: Vec<ChildRecord>,
}

impl ChildSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, handle: WorkerHandle) {
        self.children.insert(handle.pid(), handle);
    }

    pub fn outstanding(&self) -> usize {
        self.children.len()
    }

    pub fn outstanding_on(&self, host: &str) -> usize {
        self.children
            .values()
            .filter(|h| h.record.host == host)
            .count()
    }

    /// Non-blocking pass over every tracked worker. Returns the outcomes of
    /// the workers that have exited.
    pub fn poll(&mut self, pool: &mut HostPool) -> Result<Vec<ChildOutcome>> {
        let mut finished = Vec::new();
        for (pid, handle) in self.children.iter_mut() {
            if let Some(status) = handle.try_join()? {
                finished.push((*pid, status));
            }
        }
        let mut outcomes = Vec::with_capacity(finished.len());
        for (pid, status) in finished {
            if let Some(handle) = self.children.remove(&pid) {
                outcomes.push(self.settle(pid, status, handle.record, pool));
            }
        }
        Ok(outcomes)
    }

    /// Blocks until every tracked worker has exited.
    pub fn drain(&mut self, pool: &mut HostPool) -> Result<Vec<ChildOutcome>> {
        let mut outcomes = Vec::new();
        loop {
            let Some(pid) = self.children.keys().next().copied() else {
                break;
            };
            info!(pid, remaining = self.children.len(), "waiting for worker to return");
            let Some(mut handle) = self.children.remove(&pid) else {
                break;
            };
            let status = handle.join()?;
            outcomes.push(self.settle(pid, status, handle.record, pool));
        }
        Ok(outcomes)
    }

    fn settle(
        &mut self,
        pid: u32,
        status: ExitStatus,
        record: ChildRecord,
        pool: &mut HostPool,
    ) -> ChildOutcome {
        pool.release(&record.host);
        if status.success() {
            info!(pid, remaining = self.children.len(), "worker finished");
            self.completed.push(record.clone());
            ChildOutcome::Completed(record)
        } else {
            let status = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            self.mark_crashed(Some(pid), &status, record.clone());
            ChildOutcome::Crashed {
                pid: Some(pid),
                status,
                record,
            }
        }
    }

    /// Records a chunk whose worker crashed or never produced usable output.
    pub fn mark_crashed(&mut self, pid: Option<u32>, status: &str, record: ChildRecord) {
        warn!(
            pid = pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            status,
            file = %record.output.local.display(),
            start_index = record.start_index,
            host = %record.host,
            "worker crashed"
        );
        self.crashed.push(record);
    }

    pub fn take_completed(&mut self) -> Vec<ChildRecord> {
        std::mem::take(&mut self.completed)
    }

    pub fn crashed(&self) -> &[ChildRecord] {
        &self.crashed
    }

    pub fn take_crashed(&mut self) -> Vec<ChildRecord> {
        std::mem::take(&mut self.crashed)
    }
}

use crate::cache::{Stage, StageCache};
use crate::hosts::{HostPool, HostsConfig};
use crate::pipeline::Pipeline;
use crate::remote::{shell_join, shell_quote, RemoteChannel};
use crate::sample::Sample;
use crate::setup::Setup;
use crate::split::{job_size, split_batch, Chunk};
use crate::stages::Stages;
use crate::store::{self, numbered_file_name};
use crate::supervisor::{ChildRecord, ChildSupervisor, ResultFile, WorkerHandle};
use crate::worker::WorkerPayload;
use anyhow::{anyhow, Result};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One chunk bound to the host that will evaluate it.
#[derive(Debug, Clone)]
pub struct Task {
    pub chunk: Chunk,
    pub host: String,
}

#[derive(Debug, Clone, Default)]
pub struct DistReport {
    pub submitted: usize,
    pub skipped: usize,
    pub chunks: usize,
    pub merged: usize,
    pub crashed: Vec<ChildRecord>,
}

/// Orchestrator of a distributed run. Owns the host pool, the remote channel
/// and the worker supervisor; the caller's pipeline is lent to it per call.
pub struct Dispatcher {
    pool: HostPool,
    channel: RemoteChannel,
    supervisor: ChildSupervisor,
    setup: Setup,
    worker_command: Vec<String>,
    file_suffix: u64,
}

impl Dispatcher {
    pub fn new(setup: Setup, hosts: &HostsConfig, worker_command: Vec<String>) -> Result<Self> {
        Self::with_pool(setup, HostPool::new(hosts), RemoteChannel::new(hosts), worker_command)
    }

    pub fn with_pool(
        setup: Setup,
        pool: HostPool,
        channel: RemoteChannel,
        worker_command: Vec<String>,
    ) -> Result<Self> {
        if worker_command.is_empty() {
            return Err(anyhow!("worker command is empty"));
        }
        if pool.total_slots() == 0 {
            return Err(anyhow!("host pool has no slots"));
        }
        Ok(Self {
            pool,
            channel,
            supervisor: ChildSupervisor::new(),
            setup,
            worker_command,
            file_suffix: 0,
        })
    }

    pub fn pool(&self) -> &HostPool {
        &self.pool
    }

    pub fn supervisor(&self) -> &ChildSupervisor {
        &self.supervisor
    }

    /// Evaluates every sample that has no result yet, spread over the pool,
    /// and merges the workers' caches into `pipeline`.
    ///
    /// Samples are resolved against the cache first, equivalence matching
    /// included, so a point within tolerance of a stored one is re-keyed and
    /// skipped. Incomplete entries are dropped and evaluated again.
    pub fn run<S: Stages>(
        &mut self,
        pipeline: &mut Pipeline<S>,
        samples: Vec<Sample>,
    ) -> Result<DistReport> {
        let total = samples.len();
        let pending = pending_samples(pipeline.cache_mut(), samples);
        let mut report = DistReport {
            submitted: pending.len(),
            skipped: total - pending.len(),
            ..DistReport::default()
        };
        if pending.is_empty() {
            info!(skipped = report.skipped, "all samples already evaluated");
            return Ok(report);
        }
        report.chunks = self.submit(pipeline.cache_mut(), pending)?;
        self.wait_for_results(pipeline)?;
        report.merged = self.load_results(pipeline)?;
        report.crashed = self.supervisor.crashed().to_vec();
        Ok(report)
    }

    /// Splits `samples` and spawns one worker per chunk. Returns the number
    /// of chunks. Blocks only while every host slot is taken.
    pub fn submit(&mut self, cache: &mut StageCache, samples: Vec<Sample>) -> Result<usize> {
        let len = samples.len();
        if len == 0 {
            return Ok(0);
        }
        let expected = self.setup.expected_samples.unwrap_or(len);
        let job = job_size(expected, self.pool.total_slots());
        let first = cache.next_ids(len as u64);
        let chunks = split_batch(samples, job, first);
        info!(
            chunks = chunks.len(),
            job_size = job,
            samples = len,
            first_index = first,
            "job configuration"
        );
        let count = chunks.len();
        for chunk in chunks {
            let host = self.acquire_host()?;
            self.spawn(Task { chunk, host })?;
        }
        Ok(count)
    }

    fn acquire_host(&mut self) -> Result<String> {
        loop {
            self.supervisor.poll(&mut self.pool)?;
            if let Some(host) = self.pool.acquire() {
                return Ok(host);
            }
        }
    }

    /// Starts the worker for `task` on its host and returns immediately.
    /// Failing to set the worker up counts as a crash of that chunk.
    pub fn spawn(&mut self, task: Task) -> Result<Option<u32>> {
        let host = self
            .pool
            .host(&task.host)
            .cloned()
            .ok_or_else(|| anyhow!("unknown host {}", task.host))?;
        let name = numbered_file_name(&self.setup.cache_file, self.file_suffix);
        self.file_suffix += 1;
        let local = self.local_dir().join(&name);

        let scratch = match self.channel.make_scratch_dir(&host) {
            Ok(dir) => dir,
            Err(e) => {
                warn!(host = %host.name, error = %e, "could not prepare scratch directory");
                let record = ChildRecord {
                    start_index: task.chunk.start_index,
                    output: ResultFile {
                        host: host.name.clone(),
                        remote: PathBuf::new(),
                        local,
                    },
                    host: host.name.clone(),
                    chunk: task.chunk,
                };
                self.pool.release(&host.name);
                self.supervisor.mark_crashed(None, "setup_failed", record);
                return Ok(None);
            }
        };
        let remote = scratch.join(&name);
        let record = ChildRecord {
            start_index: task.chunk.start_index,
            output: ResultFile {
                host: host.name.clone(),
                remote: remote.clone(),
                local,
            },
            host: host.name.clone(),
            chunk: task.chunk.clone(),
        };
        let payload = WorkerPayload {
            setup: self.setup.clone(),
            chunk: task.chunk,
            output: remote,
        };
        let input = serde_json::to_vec(&payload)?;
        let mut command = self.worker_command.clone();
        command.push("worker".to_string());
        let script = format!(
            "cd {} && exec {}",
            shell_quote(&scratch.to_string_lossy()),
            shell_join(&command)
        );

        let mut child = match self.channel.spawn(&host, &script) {
            Ok(child) => child,
            Err(e) => {
                warn!(host = %host.name, error = %e, "could not spawn worker");
                self.pool.release(&host.name);
                self.supervisor.mark_crashed(None, "spawn_failed", record);
                return Ok(None);
            }
        };
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(&input) {
                warn!(
                    host = %host.name,
                    start_index = record.start_index,
                    error = %e,
                    "failed to send payload to worker"
                );
            }
        }
        let handle = WorkerHandle::new(child, record);
        let pid = handle.pid();
        info!(
            pid,
            host = %host.name,
            start_index = handle.record().start_index,
            samples = handle.record().chunk.samples.len(),
            "worker spawned"
        );
        self.supervisor.track(handle);
        Ok(Some(pid))
    }

    fn local_dir(&self) -> PathBuf {
        self.setup
            .cache_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Persists the orchestrator's own cache, then blocks until every worker
    /// has exited.
    pub fn wait_for_results<S: Stages>(&mut self, pipeline: &Pipeline<S>) -> Result<()> {
        pipeline.persist()?;
        self.supervisor.drain(&mut self.pool)?;
        Ok(())
    }

    /// Merges the output of every completed worker into `pipeline`, persisting
    /// after each merge. A worker whose output cannot be fetched or read is
    /// treated as crashed; a key collision aborts.
    pub fn load_results<S: Stages>(&mut self, pipeline: &mut Pipeline<S>) -> Result<usize> {
        if self.supervisor.outstanding() > 0 {
            self.wait_for_results(pipeline)?;
        }
        let mut merged = 0;
        for record in self.supervisor.take_completed() {
            let incoming = match self.fetch_result(&record.output) {
                Ok(cache) => cache,
                Err(e) => {
                    warn!(error = %e, "worker result unusable");
                    self.supervisor.mark_crashed(None, "no_result", record);
                    continue;
                }
            };
            merge_into(pipeline.cache_mut(), incoming, &record.output.local)?;
            pipeline.persist()?;
            merged += 1;
        }
        Ok(merged)
    }

    fn fetch_result(&self, file: &ResultFile) -> Result<StageCache> {
        let host = self
            .pool
            .host(&file.host)
            .ok_or_else(|| anyhow!("unknown host {}", file.host))?;
        self.channel.fetch(host, &file.remote, &file.local)?;
        Ok(store::read_cache(&file.local)?)
    }

    /// Re-spawns the chunks of crashed workers with their original start
    /// indices. Returns how many chunks were resubmitted.
    pub fn resubmit_crashed(&mut self) -> Result<usize> {
        let crashed = self.supervisor.take_crashed();
        let count = crashed.len();
        for record in crashed {
            info!(
                start_index = record.start_index,
                previous_host = %record.host,
                "resubmitting crashed chunk"
            );
            let host = self.acquire_host()?;
            self.spawn(Task {
                chunk: record.chunk,
                host,
            })?;
        }
        Ok(count)
    }

    pub fn crashed(&self) -> &[ChildRecord] {
        self.supervisor.crashed()
    }
}

fn pending_samples(cache: &mut StageCache, samples: Vec<Sample>) -> Vec<Sample> {
    let mut seen = HashSet::new();
    let mut pending = Vec::with_capacity(samples.len());
    for sample in samples {
        let unit = sample.unit_key();
        if cache.lookup_preprocessed(&unit).is_some() {
            if cache.has_result(&unit) {
                continue;
            }
            debug!(sample = %sample, "dropping incomplete entry before dispatch");
            cache.remove(&unit);
        }
        if seen.insert(unit) {
            pending.push(sample);
        }
    }
    pending
}

/// Reads a cache file written elsewhere and merges it into `target`.
pub fn load_file(target: &mut StageCache, path: &Path) -> Result<()> {
    let incoming = store::read_cache(path)?;
    merge_into(target, incoming, path)
}

fn merge_into(target: &mut StageCache, incoming: StageCache, origin: &Path) -> Result<()> {
    if let (Some(ours), Some(theirs)) = (target.setup_digest(), incoming.setup_digest()) {
        if ours != theirs {
            warn!(
                file = %origin.display(),
                ours,
                theirs,
                "merging results produced by a different setup"
            );
        }
    }
    let added = incoming.size(Stage::Preprocess);
    target.merge_stats(incoming)?;
    info!(file = %origin.display(), added, "results merged");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Stage;
    use crate::hosts::HostsConfig;
    use crate::pipeline::tests::{five_samples, Doubling};
    use crate::sample::ParamKey;
    use crate::stages::{StageCommands, TimeWindow};
    use crate::worker::run_worker;
    use chrono::Utc;
    use std::fs;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "uq_dispatch_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&root).expect("root");
        root
    }

    fn setup(root: &Path) -> Setup {
        Setup {
            cache_file: root.join("main.uqcache"),
            verbose: false,
            time: TimeWindow::default(),
            stages: StageCommands {
                preprocess: None,
                simulate: vec!["unused".to_string()],
                postprocess: None,
            },
            save_after_each_run: true,
            expected_samples: None,
            worker_program: None,
            workdir: None,
        }
    }

    fn local_hosts(root: &Path) -> HostsConfig {
        let yaml = format!(
            "backoff_ms: 0\nhosts:\n  a: {{ slots: 1, scratch: {0}/a, local: true }}\n  b: {{ slots: 1, scratch: {0}/b, local: true }}\n",
            root.display()
        );
        serde_yaml::from_str(&yaml).expect("hosts")
    }

    fn dispatcher(root: &Path, worker: &[&str]) -> Dispatcher {
        let hosts = local_hosts(root);
        Dispatcher::with_pool(
            setup(root),
            HostPool::seeded(&hosts, 11),
            RemoteChannel::new(&hosts),
            worker.iter().map(|s| s.to_string()).collect(),
        )
        .expect("dispatcher")
    }

    fn pipeline(root: &Path) -> Pipeline<Doubling> {
        Pipeline::new(Doubling::default(), StageCache::new(false), TimeWindow::default())
            .with_cache_file(root.join("main.uqcache"), true)
    }

    #[test]
    fn crashed_workers_free_their_hosts_and_can_be_resubmitted() {
        let root = temp_root("crash");
        let mut d = dispatcher(&root, &["false"]);
        let mut p = pipeline(&root);
        let report = d.run(&mut p, five_samples()).expect("run");
        assert_eq!(report.submitted, 5);
        assert_eq!(report.chunks, 2);
        assert_eq!(report.merged, 0);
        assert_eq!(report.crashed.len(), 2);
        assert_eq!(d.pool().free_slots(), 2);

        let mut starts: Vec<u64> = report.crashed.iter().map(|r| r.start_index).collect();
        starts.sort();
        assert_eq!(starts, vec![0, 3]);
        assert_eq!(p.cache().lastid(), 5);

        assert_eq!(d.resubmit_crashed().expect("resubmit"), 2);
        d.wait_for_results(&p).expect("wait");
        let mut again: Vec<u64> = d.crashed().iter().map(|r| r.start_index).collect();
        again.sort();
        assert_eq!(again, vec![0, 3]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn worker_exiting_cleanly_without_output_counts_as_crashed() {
        let root = temp_root("no_output");
        let mut d = dispatcher(&root, &["sh", "-c", "cat > /dev/null", "sh"]);
        let mut p = pipeline(&root);
        let report = d.run(&mut p, five_samples()[..1].to_vec()).expect("run");
        assert_eq!(report.chunks, 1);
        assert_eq!(report.merged, 0);
        assert_eq!(report.crashed.len(), 1);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn completed_worker_outputs_merge_into_the_pipeline() {
        let root = temp_root("merge");
        let mut p = pipeline(&root);
        p.run(&five_samples()[0]).expect("local sample");

        for (i, range) in [1usize..3, 3..5].into_iter().enumerate() {
            let payload = WorkerPayload {
                setup: setup(&root),
                chunk: Chunk {
                    start_index: range.start as u64,
                    samples: five_samples()[range].to_vec(),
                },
                output: root.join(format!("main.{}.uqcache", i)),
            };
            run_worker(&payload, Doubling::default()).expect("worker");
            load_file(p.cache_mut(), &payload.output).expect("merge");
        }
        assert_eq!(p.cache().size(Stage::Postprocess), 5);
        let values: Vec<f64> = p.cache().results("qoi").iter().map(|(_, v)| v[0]).collect();
        assert_eq!(values, vec![0.0, 0.5, 1.0, 1.5, 2.0]);

        let err = load_file(p.cache_mut(), &root.join("main.0.uqcache")).expect_err("overlap");
        assert!(err.to_string().contains("overlapping settings"), "{}", err);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn near_duplicate_of_an_evaluated_sample_is_not_dispatched() {
        let root = temp_root("near_duplicate");
        let mut d = dispatcher(&root, &["false"]);
        let mut p = pipeline(&root);
        p.run(&Sample::from_unit(vec![0.5])).expect("local sample");

        let near = Sample::from_unit(vec![0.5 * (1.0 + 1e-9)]);
        let report = d.run(&mut p, vec![near.clone()]).expect("run");
        assert_eq!(report.submitted, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.chunks, 0);
        assert_eq!(p.cache().size(Stage::Preprocess), 1);
        assert!(p.cache().has_result(&near.unit_key()));
        assert_eq!(p.cache().lastid(), 0);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn incomplete_entries_and_repeats_are_dispatched_once() {
        let root = temp_root("incomplete");
        let mut d = dispatcher(&root, &["false"]);
        let mut p = pipeline(&root);
        let unit = ParamKey::new(vec![0.5]);
        p.cache_mut()
            .put_preprocessed(unit.clone(), ParamKey::new(vec![0.5]))
            .expect("pre");
        p.cache_mut()
            .put_simulated(ParamKey::new(vec![0.5]), serde_json::json!([1.0]))
            .expect("sim");

        let samples = vec![Sample::from_unit(vec![0.5]), Sample::from_unit(vec![0.5])];
        let report = d.run(&mut p, samples).expect("run");
        assert_eq!(report.submitted, 1);
        assert_eq!(report.skipped, 1);
        assert!(p.cache().preprocessed(&unit).is_none());
        p.cache().check_invariants().expect("invariants");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn spawning_never_exceeds_host_slots() {
        let root = temp_root("slots");
        let mut d = dispatcher(&root, &["sh", "-c", "cat > /dev/null; sleep 0.2", "sh"]);
        let p = pipeline(&root);
        for chunk in split_batch(five_samples(), 1.0, 0) {
            let host = d.acquire_host().expect("host");
            d.spawn(Task { chunk, host }).expect("spawn");
            for h in d.pool().hosts() {
                assert!(
                    d.supervisor().outstanding_on(&h.name) <= h.total_slots,
                    "{} runs {} workers on {} slots",
                    h.name,
                    d.supervisor().outstanding_on(&h.name),
                    h.total_slots
                );
            }
            assert!(d.supervisor().outstanding() <= d.pool().total_slots());
        }
        d.wait_for_results(&p).expect("wait");
        assert_eq!(d.supervisor().outstanding(), 0);
        assert_eq!(d.pool().free_slots(), 2);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn worker_ignoring_its_payload_is_still_tracked() {
        let root = temp_root("ignored_payload");
        let mut d = dispatcher(&root, &["true"]);
        let mut p = pipeline(&root);
        let report = d.run(&mut p, five_samples()[..2].to_vec()).expect("run");
        assert_eq!(report.chunks, 2);
        assert_eq!(report.crashed.len(), 2);
        assert_eq!(d.pool().free_slots(), 2);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn merges_reach_disk_before_a_later_collision() {
        let root = temp_root("persist_each");
        let prepared = root.join("prepared");
        fs::create_dir_all(&prepared).expect("prepared");
        for i in 0..2 {
            let payload = WorkerPayload {
                setup: setup(&root),
                chunk: Chunk {
                    start_index: i,
                    samples: vec![Sample::from_unit(vec![0.25])],
                },
                output: prepared.join(format!("main.{}.uqcache", i)),
            };
            run_worker(&payload, Doubling::default()).expect("worker");
        }
        let copy = format!("cat > /dev/null; cp {}/*.uqcache .", prepared.display());
        let mut d = dispatcher(&root, &["sh", "-c", &copy, "sh"]);
        let mut p = pipeline(&root);
        let samples = vec![Sample::from_unit(vec![0.25]), Sample::from_unit(vec![0.75])];
        let err = d.run(&mut p, samples).expect_err("second merge collides");
        assert!(err.to_string().contains("overlapping settings"), "{}", err);

        let on_disk = store::read_cache(&root.join("main.uqcache")).expect("persisted cache");
        assert_eq!(on_disk.size(Stage::Postprocess), 1);
        assert!(on_disk.has_result(&ParamKey::new(vec![0.25])));
        let _ = fs::remove_dir_all(root);
    }
}

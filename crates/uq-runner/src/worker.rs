use crate::cache::StageCache;
use crate::pipeline::{BatchReport, Pipeline};
use crate::setup::Setup;
use crate::split::Chunk;
use crate::stages::{CommandStages, Stages};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::PathBuf;
use tracing::info;

/// What a spawned worker receives on stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerPayload {
    pub setup: Setup,
    pub chunk: Chunk,
    pub output: PathBuf,
}

pub fn read_payload(mut reader: impl Read) -> Result<WorkerPayload> {
    let mut raw = Vec::new();
    reader.read_to_end(&mut raw)?;
    serde_json::from_slice(&raw).map_err(|e| anyhow!("invalid worker payload: {}", e))
}

/// Child side of a distributed run: evaluates the chunk with a fresh,
/// empty cache and leaves the result in `payload.output`.
pub fn run_worker<S: Stages>(payload: &WorkerPayload, stages: S) -> Result<BatchReport> {
    let setup = &payload.setup;
    let mut cache = StageCache::new(setup.verbose);
    cache.set_lastid(payload.chunk.start_index + payload.chunk.samples.len() as u64);
    cache.set_setup_digest(Some(setup.digest()?));

    let mut pipeline = Pipeline::new(stages, cache, setup.time)
        .with_cache_file(payload.output.clone(), setup.save_after_each_run);
    info!(
        start_index = payload.chunk.start_index,
        samples = payload.chunk.samples.len(),
        output = %payload.output.display(),
        "worker started"
    );
    let report = pipeline.run_samples(&payload.chunk.samples)?;
    pipeline.persist()?;
    info!(
        evaluated = report.evaluated,
        invalid = report.invalid.len(),
        "worker done"
    );
    Ok(report)
}

pub fn run_command_worker(payload: &WorkerPayload) -> Result<BatchReport> {
    let stages = CommandStages::new(payload.setup.stages.clone(), payload.setup.workdir.clone())?;
    run_worker(payload, stages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Stage;
    use crate::pipeline::tests::{five_samples, Doubling};
    use crate::stages::{StageCommands, TimeWindow};
    use crate::store;
    use chrono::Utc;

    #[test]
    fn worker_writes_its_chunk_with_a_fresh_cache() {
        let root = std::env::temp_dir().join(format!(
            "uq_worker_test_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let payload = WorkerPayload {
            setup: Setup {
                cache_file: root.join("main.uqcache"),
                verbose: false,
                time: TimeWindow::default(),
                stages: StageCommands {
                    preprocess: None,
                    simulate: vec!["unused".to_string()],
                    postprocess: None,
                },
                save_after_each_run: false,
                expected_samples: None,
                worker_program: None,
                workdir: None,
            },
            chunk: Chunk {
                start_index: 10,
                samples: five_samples()[1..3].to_vec(),
            },
            output: root.join("main.0.uqcache"),
        };
        let encoded = serde_json::to_vec(&payload).expect("encode");
        let decoded = read_payload(encoded.as_slice()).expect("decode");
        assert_eq!(decoded, payload);

        let report = run_worker(&decoded, Doubling::default()).expect("worker");
        assert_eq!(report.evaluated, 2);
        let cache = store::read_cache(&payload.output).expect("output written");
        assert_eq!(cache.size(Stage::Postprocess), 2);
        assert_eq!(cache.lastid(), 12);
        let _ = std::fs::remove_dir_all(root);
    }
}

use crate::cache::{QoiMap, Stage, StageCache};
use crate::error::UqError;
use crate::sample::{ParamKey, Sample};
use crate::setup::Setup;
use crate::stages::{CommandStages, Stages, TimeWindow};
use crate::store;
use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

macro_rules! stage_note {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            info!($($arg)+);
        } else {
            debug!($($arg)+);
        }
    };
}

#[derive(Debug, Clone)]
pub struct InvalidSample {
    pub index: usize,
    pub sample: Sample,
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub evaluated: usize,
    pub invalid: Vec<InvalidSample>,
}

/// preprocess → simulate → postprocess for single samples, memoized in a
/// [`StageCache`] and persisted after every stage that made progress.
pub struct Pipeline<S> {
    stages: S,
    cache: StageCache,
    window: TimeWindow,
    cache_file: Option<PathBuf>,
    save_after_each_run: bool,
}

impl<S: Stages> Pipeline<S> {
    pub fn new(stages: S, cache: StageCache, window: TimeWindow) -> Self {
        Self {
            stages,
            cache,
            window,
            cache_file: None,
            save_after_each_run: true,
        }
    }

    pub fn with_cache_file(mut self, path: impl Into<PathBuf>, save_after_each_run: bool) -> Self {
        self.cache_file = Some(path.into());
        self.save_after_each_run = save_after_each_run;
        self
    }

    pub fn cache(&self) -> &StageCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut StageCache {
        &mut self.cache
    }

    pub fn into_cache(self) -> StageCache {
        self.cache
    }

    pub fn cache_file(&self) -> Option<&Path> {
        self.cache_file.as_deref()
    }

    pub fn set_cache_file(&mut self, path: impl Into<PathBuf>) {
        self.cache_file = Some(path.into());
    }

    pub fn stages(&self) -> &S {
        &self.stages
    }

    pub fn window(&self) -> &TimeWindow {
        &self.window
    }

    /// Writes the whole cache to its file. Without a file nothing is written.
    pub fn persist(&self) -> Result<(), UqError> {
        match &self.cache_file {
            Some(path) => {
                stage_note!(self.cache.verbose(), path = %path.display(), "write cache to file");
                store::write_cache(path, &self.cache)
            }
            None => {
                debug!("cache file not set, cache not written");
                Ok(())
            }
        }
    }

    fn save_progress(&self) -> Result<(), UqError> {
        if self.save_after_each_run {
            self.persist()
        } else {
            Ok(())
        }
    }

    /// Evaluates one sample. Each stage is looked up in the cache first and
    /// only computed on a miss. Stage failures come back as the matching
    /// [`UqError`] variant; consistency and storage errors are fatal.
    pub fn run(&mut self, sample: &Sample) -> Result<QoiMap, UqError> {
        let verbose = self.cache.verbose();
        let unit = sample.unit_key();
        if unit.has_nan() || sample.probabilistic_space().iter().any(|v| v.is_nan()) {
            return Err(UqError::PreprocessFailed(format!("nan in sample {}", sample)));
        }

        let (q, fresh) = match self.cache.lookup_preprocessed(&unit) {
            Some(q) => {
                stage_note!(verbose, sample = %sample, transformed = %q, "restore pre-processing");
                (q, false)
            }
            None => {
                let out = self
                    .stages
                    .preprocess(sample.probabilistic_space(), &self.window)
                    .map_err(|e| UqError::PreprocessFailed(format!("{}: {:#}", sample, e)))?;
                let q = ParamKey::new(out);
                if q.has_nan() {
                    return Err(UqError::PreprocessFailed(format!(
                        "nan in pre-processed parameters {} for {}",
                        q, sample
                    )));
                }
                self.cache.check_transformed_dimension(&q)?;
                stage_note!(verbose, sample = %sample, transformed = %q, "apply pre-processing");
                (q, true)
            }
        };

        let simulated_before = self.cache.size(Stage::Simulate);
        let raw = match self.cache.simulated(&q) {
            Some(_) => {
                stage_note!(verbose, transformed = %q, "restore simulation result");
                None
            }
            None => {
                stage_note!(verbose, transformed = %q, "run simulation");
                let raw = self
                    .stages
                    .simulate(q.values(), &self.window)
                    .map_err(|e| UqError::SimulationFailed(format!("{}: {:#}", sample, e)))?;
                Some(raw)
            }
        };
        if fresh {
            self.cache.put_preprocessed(unit, q.clone())?;
        }
        if let Some(raw) = raw {
            self.cache.put_simulated(q.clone(), raw)?;
        }
        self.cache.check_sizes()?;
        if self.cache.size(Stage::Simulate) > simulated_before {
            self.save_progress()?;
        }

        if let Some(qoi) = self.cache.postprocessed(&q) {
            stage_note!(verbose, transformed = %q, "restore post-processing");
            return Ok(qoi.clone());
        }
        let qoi = {
            let raw = self.cache.simulated(&q).ok_or_else(|| {
                UqError::ConsistencyViolation(format!("simulation result for {} vanished", q))
            })?;
            stage_note!(verbose, transformed = %q, "apply post-processing");
            self.stages
                .postprocess(raw, q.values(), &self.window)
                .map_err(|e| UqError::PostprocessFailed(format!("{}: {:#}", sample, e)))?
        };
        self.cache.put_postprocessed(q, qoi.clone())?;
        self.save_progress()?;
        Ok(qoi)
    }

    /// Runs every sample in order. Invalid samples are logged and reported;
    /// a fatal error stops the batch.
    pub fn run_samples(&mut self, samples: &[Sample]) -> Result<BatchReport, UqError> {
        let mut report = BatchReport::default();
        let verbose = self.cache.verbose();
        for (index, sample) in samples.iter().enumerate() {
            stage_note!(
                verbose,
                "run {}/{} ({} results)",
                index + 1,
                samples.len(),
                self.cache.size(Stage::Postprocess)
            );
            match self.run(sample) {
                Ok(_) => report.evaluated += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(sample = %sample, error = %e, "invalid sample");
                    report.invalid.push(InvalidSample {
                        index,
                        sample: sample.clone(),
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                }
            }
        }
        if !self.save_after_each_run {
            self.persist()?;
        }
        Ok(report)
    }
}

/// Builds the command-driven pipeline described by `setup`, reading the
/// existing cache file if there is one.
pub fn command_pipeline(setup: &Setup) -> Result<Pipeline<CommandStages>> {
    let stages = CommandStages::new(setup.stages.clone(), setup.workdir.clone())?;
    let mut cache = store::open_or_create(&setup.cache_file, setup.verbose)?;
    cache.set_verbose(setup.verbose);
    cache.set_setup_digest(Some(setup.digest()?));
    Ok(Pipeline::new(stages, cache, setup.time)
        .with_cache_file(setup.cache_file.clone(), setup.save_after_each_run))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::RawResult;
    use anyhow::anyhow;
    use chrono::Utc;
    use serde_json::json;
    use std::cell::Cell;

    /// Identity preprocessor, `sim(x) = 2x`, postprocessor `{"qoi": sim(x)}`.
    #[derive(Default)]
    pub(crate) struct Doubling {
        pub pre: Cell<usize>,
        pub sim: Cell<usize>,
        pub post: Cell<usize>,
    }

    impl Stages for Doubling {
        fn preprocess(&self, params: &[f64], _window: &TimeWindow) -> anyhow::Result<Vec<f64>> {
            self.pre.set(self.pre.get() + 1);
            Ok(params.to_vec())
        }

        fn simulate(&self, params: &[f64], _window: &TimeWindow) -> anyhow::Result<RawResult> {
            self.sim.set(self.sim.get() + 1);
            if params.iter().any(|p| *p < 0.0) {
                return Err(anyhow!("negative parameter"));
            }
            Ok(json!(params.iter().map(|p| p * 2.0).collect::<Vec<_>>()))
        }

        fn postprocess(
            &self,
            raw: &RawResult,
            _params: &[f64],
            _window: &TimeWindow,
        ) -> anyhow::Result<QoiMap> {
            self.post.set(self.post.get() + 1);
            let values = raw
                .as_array()
                .ok_or_else(|| anyhow!("expected array"))?
                .iter()
                .filter_map(|v| v.as_f64())
                .collect();
            let mut qoi = QoiMap::new();
            qoi.insert("qoi".to_string(), values);
            Ok(qoi)
        }
    }

    pub(crate) fn five_samples() -> Vec<Sample> {
        [0.0, 0.25, 0.5, 0.75, 1.0]
            .iter()
            .map(|x| Sample::from_unit(vec![*x]))
            .collect()
    }

    fn pipeline() -> Pipeline<Doubling> {
        Pipeline::new(Doubling::default(), StageCache::new(false), TimeWindow::default())
    }

    #[test]
    fn second_run_hits_every_stage_cache() {
        let mut p = pipeline();
        let s = Sample::from_unit(vec![0.5]);
        let first = p.run(&s).expect("first run");
        let second = p.run(&s).expect("second run");
        assert_eq!(first, second);
        assert_eq!(p.stages().pre.get(), 1);
        assert_eq!(p.stages().sim.get(), 1);
        assert_eq!(p.stages().post.get(), 1);
    }

    #[test]
    fn direct_run_produces_doubled_values() {
        let mut p = pipeline();
        let report = p.run_samples(&five_samples()).expect("batch");
        assert_eq!(report.evaluated, 5);
        assert!(report.invalid.is_empty());
        let values: Vec<f64> = p
            .cache()
            .results("qoi")
            .into_iter()
            .map(|(_, v)| v[0])
            .collect();
        assert_eq!(values, vec![0.0, 0.5, 1.0, 1.5, 2.0]);
        p.cache().check_invariants().expect("invariants");
    }

    #[test]
    fn failing_sample_is_reported_and_batch_continues() {
        let mut p = pipeline();
        let samples = vec![
            Sample::from_unit(vec![0.1]),
            Sample::from_unit(vec![-1.0]),
            Sample::from_unit(vec![0.3]),
            Sample::from_unit(vec![f64::NAN]),
        ];
        let report = p.run_samples(&samples).expect("batch");
        assert_eq!(report.evaluated, 2);
        assert_eq!(report.invalid.len(), 2);
        assert_eq!(report.invalid[0].index, 1);
        assert_eq!(report.invalid[0].kind, "simulation_failed");
        assert_eq!(report.invalid[1].kind, "preprocess_failed");
        assert_eq!(p.cache().size(Stage::Preprocess), 2);
        assert_eq!(p.cache().size(Stage::Simulate), 2);
        p.cache().check_invariants().expect("failed simulation left no trace");
    }

    #[test]
    fn changed_preprocessor_dimension_aborts_the_batch() {
        struct Widening;
        impl Stages for Widening {
            fn preprocess(&self, params: &[f64], _w: &TimeWindow) -> anyhow::Result<Vec<f64>> {
                Ok(vec![params[0]; if params[0] < 0.5 { 1 } else { 2 }])
            }
            fn simulate(&self, _params: &[f64], _w: &TimeWindow) -> anyhow::Result<RawResult> {
                Ok(json!({"qoi": 1.0}))
            }
        }
        let mut p = Pipeline::new(Widening, StageCache::new(false), TimeWindow::default());
        let samples = vec![Sample::from_unit(vec![0.1]), Sample::from_unit(vec![0.9])];
        let err = p.run_samples(&samples).expect_err("fatal");
        assert!(matches!(err, UqError::ConsistencyViolation(_)));
    }

    #[test]
    fn progress_is_persisted_after_each_stage() {
        let root = std::env::temp_dir().join(format!(
            "uq_pipeline_persist_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let path = root.join("run.uqcache");
        let mut p = pipeline().with_cache_file(&path, true);
        p.run(&Sample::from_unit(vec![0.25])).expect("run");
        let restored = store::read_cache(&path).expect("cache written");
        assert!(restored.has_result(&ParamKey::new(vec![0.25])));
        let _ = std::fs::remove_dir_all(root);
    }
}

use crate::error::{consistency, UqError};
use crate::sample::{TransformedKey, UnitKey};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

pub type RawResult = Value;
pub type QoiMap = BTreeMap<String, Vec<f64>>;

/// Two unit keys closer than this (symmetric relative difference) are the same point.
pub const EQUIVALENCE_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Preprocess,
    Simulate,
    Postprocess,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Preprocess => "preprocessor",
            Stage::Simulate => "simulation",
            Stage::Postprocess => "postprocessor",
        }
    }
}

/// Memoized results of the three pipeline stages.
///
/// `preprocessed` and `preprocessed_reverse` are exact inverses and every
/// transformed key they hold has a simulation result. Postprocessed results
/// are only ever stored for simulated keys.
#[derive(Debug, Clone, Default)]
pub struct StageCache {
    preprocessed: HashMap<UnitKey, TransformedKey>,
    preprocessed_reverse: HashMap<TransformedKey, UnitKey>,
    simulated: HashMap<TransformedKey, RawResult>,
    postprocessed: HashMap<TransformedKey, QoiMap>,
    lastid: u64,
    verbose: bool,
    setup_digest: Option<String>,
}

impl StageCache {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            ..Self::default()
        }
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn lastid(&self) -> u64 {
        self.lastid
    }

    pub fn set_lastid(&mut self, lastid: u64) {
        self.lastid = lastid;
    }

    /// Reserves `count` consecutive ids and returns the first one.
    pub fn next_ids(&mut self, count: u64) -> u64 {
        let first = self.lastid;
        self.lastid += count;
        first
    }

    pub fn setup_digest(&self) -> Option<&str> {
        self.setup_digest.as_deref()
    }

    pub fn set_setup_digest(&mut self, digest: Option<String>) {
        self.setup_digest = digest;
    }

    pub fn preprocessed(&self, unit: &UnitKey) -> Option<&TransformedKey> {
        self.preprocessed.get(unit)
    }

    pub fn unit_for(&self, transformed: &TransformedKey) -> Option<&UnitKey> {
        self.preprocessed_reverse.get(transformed)
    }

    pub fn simulated(&self, transformed: &TransformedKey) -> Option<&RawResult> {
        self.simulated.get(transformed)
    }

    pub fn postprocessed(&self, transformed: &TransformedKey) -> Option<&QoiMap> {
        self.postprocessed.get(transformed)
    }

    /// Exact lookup first, the equivalence scan only on a miss.
    pub fn lookup_preprocessed(&mut self, unit: &UnitKey) -> Option<TransformedKey> {
        if let Some(q) = self.preprocessed.get(unit) {
            return Some(q.clone());
        }
        self.find_equivalent(unit)
    }

    /// Linear scan for the stored unit key closest to `unit`, accepted when it
    /// lies within [`EQUIVALENCE_TOLERANCE`]. Ties go to the smaller key. A
    /// match is re-keyed under `unit`: the old entry and everything hanging
    /// off its transformed key are removed, then inserted again.
    pub fn find_equivalent(&mut self, unit: &UnitKey) -> Option<TransformedKey> {
        if self.preprocessed.is_empty() {
            return None;
        }
        debug!(unit = %unit, "search for equivalent");
        let mut min_diff = f64::INFINITY;
        let mut found: Option<&UnitKey> = None;
        for candidate in self.preprocessed.keys() {
            let diff = candidate.relative_difference(unit);
            let closer =
                diff < min_diff || (diff == min_diff && found.is_some_and(|f| candidate < f));
            if closer {
                min_diff = diff;
                found = Some(candidate);
            }
        }
        let found = found.filter(|_| min_diff < EQUIVALENCE_TOLERANCE).cloned();
        let Some(old_unit) = found else {
            debug!(unit = %unit, min_diff, "no equivalent found");
            return None;
        };

        let q = self.preprocessed.remove(&old_unit)?;
        self.preprocessed_reverse.remove(&q);
        let simulated = self.simulated.remove(&q);
        let postprocessed = self.postprocessed.remove(&q);

        self.preprocessed.insert(unit.clone(), q.clone());
        self.preprocessed_reverse.insert(q.clone(), unit.clone());
        if let Some(raw) = simulated {
            self.simulated.insert(q.clone(), raw);
        }
        if let Some(qoi) = postprocessed {
            self.postprocessed.insert(q.clone(), qoi);
        }
        debug!(old = %old_unit, new = %unit, min_diff, "found equivalent");
        Some(q)
    }

    /// Stores a preprocessing result. The transformed key must have the same
    /// dimension as every earlier one and must not already belong to another
    /// unit key.
    pub fn put_preprocessed(
        &mut self,
        unit: UnitKey,
        transformed: TransformedKey,
    ) -> Result<(), UqError> {
        self.check_transformed_dimension(&transformed)?;
        if let Some(owner) = self.preprocessed_reverse.get(&transformed) {
            if owner != &unit {
                return Err(consistency(format!(
                    "pre-processor is not injective: {} and {} both map to {}",
                    owner, unit, transformed
                )));
            }
        }
        if let Some(previous) = self.preprocessed.get(&unit) {
            if previous != &transformed {
                return Err(consistency(format!(
                    "pre-processor result for {} changed from {} to {}",
                    unit, previous, transformed
                )));
            }
            return Ok(());
        }
        self.preprocessed_reverse.insert(transformed.clone(), unit.clone());
        self.preprocessed.insert(unit, transformed);
        Ok(())
    }

    pub fn check_transformed_dimension(&self, transformed: &TransformedKey) -> Result<(), UqError> {
        match self.preprocessed.values().next() {
            Some(existing) if existing.len() != transformed.len() => Err(consistency(format!(
                "the pre-processor has changed since the last run: dimension {} != {}",
                transformed.len(),
                existing.len()
            ))),
            _ => Ok(()),
        }
    }

    pub fn put_simulated(
        &mut self,
        transformed: TransformedKey,
        raw: RawResult,
    ) -> Result<(), UqError> {
        if !self.preprocessed_reverse.contains_key(&transformed) {
            return Err(consistency(format!(
                "simulation result for {} has no pre-processing entry",
                transformed
            )));
        }
        self.simulated.entry(transformed).or_insert(raw);
        Ok(())
    }

    pub fn put_postprocessed(
        &mut self,
        transformed: TransformedKey,
        qoi: QoiMap,
    ) -> Result<(), UqError> {
        if !self.simulated.contains_key(&transformed) {
            return Err(consistency(format!(
                "post-processing result for {} has no simulation entry",
                transformed
            )));
        }
        if let Some(existing) = self.postprocessed.values().next() {
            if !existing.keys().eq(qoi.keys()) {
                return Err(consistency(format!(
                    "the post-processor has changed since the last run: quantities {:?} != {:?}",
                    qoi.keys().collect::<Vec<_>>(),
                    existing.keys().collect::<Vec<_>>()
                )));
            }
        }
        self.postprocessed.entry(transformed).or_insert(qoi);
        Ok(())
    }

    /// Cheap form of [`check_invariants`](Self::check_invariants): sizes only.
    pub fn check_sizes(&self) -> Result<(), UqError> {
        let (pre, rev, sim, post) = (
            self.preprocessed.len(),
            self.preprocessed_reverse.len(),
            self.simulated.len(),
            self.postprocessed.len(),
        );
        if pre != rev || pre != sim || post > sim {
            return Err(consistency(format!(
                "cache sizes diverged: preprocessed={} reverse={} simulated={} postprocessed={}",
                pre, rev, sim, post
            )));
        }
        Ok(())
    }

    pub fn check_invariants(&self) -> Result<(), UqError> {
        self.check_sizes()?;
        for (unit, q) in &self.preprocessed {
            if self.preprocessed_reverse.get(q) != Some(unit) {
                return Err(consistency(format!(
                    "reverse map does not invert the pre-processor at {}",
                    unit
                )));
            }
            if !self.simulated.contains_key(q) {
                return Err(consistency(format!("missing simulation result for {}", q)));
            }
        }
        if let Some(q) = self.postprocessed.keys().find(|q| !self.simulated.contains_key(*q)) {
            return Err(consistency(format!(
                "post-processing result for {} has no simulation entry",
                q
            )));
        }
        Ok(())
    }

    pub fn size(&self, stage: Stage) -> usize {
        match stage {
            Stage::Preprocess => self.preprocessed.len(),
            Stage::Simulate => self.simulated.len(),
            Stage::Postprocess => self.postprocessed.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.preprocessed.is_empty() && self.postprocessed.is_empty()
    }

    pub fn has_result(&self, unit: &UnitKey) -> bool {
        self.preprocessed
            .get(unit)
            .map(|q| self.simulated.contains_key(q) && self.postprocessed.contains_key(q))
            .unwrap_or(false)
    }

    pub fn available_qoi(&self) -> Vec<String> {
        self.postprocessed
            .values()
            .find(|qoi| !qoi.is_empty())
            .map(|qoi| qoi.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn result(&self, unit: &UnitKey, qoi: &str) -> Option<&[f64]> {
        let q = self.preprocessed.get(unit)?;
        self.postprocessed
            .get(q)
            .and_then(|values| values.get(qoi))
            .map(Vec::as_slice)
    }

    /// All complete results for one quantity of interest, ordered by unit key.
    pub fn results(&self, qoi: &str) -> Vec<(UnitKey, Vec<f64>)> {
        let mut out: Vec<(UnitKey, Vec<f64>)> = self
            .postprocessed
            .iter()
            .filter_map(|(q, values)| {
                let unit = self.preprocessed_reverse.get(q)?;
                let series = values.get(qoi)?;
                Some((unit.clone(), series.clone()))
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Number of dangling references between the stage maps.
    pub fn sanity_check(&self) -> usize {
        let mut problems = 0;
        for (unit, q) in &self.preprocessed {
            if !self.preprocessed_reverse.contains_key(q) {
                problems += 1;
                debug!(unit = %unit, "pre-processing entry without reverse");
            }
            if !self.simulated.contains_key(q) {
                problems += 1;
                debug!(unit = %unit, "pre-processing entry without simulation");
            }
            if !self.postprocessed.contains_key(q) {
                problems += 1;
                debug!(unit = %unit, "pre-processing entry without post-processing");
            }
        }
        problems
    }

    pub fn remove(&mut self, unit: &UnitKey) -> bool {
        let Some(q) = self.preprocessed.remove(unit) else {
            return false;
        };
        self.preprocessed_reverse.remove(&q);
        self.simulated.remove(&q);
        self.postprocessed.remove(&q);
        true
    }

    /// Drops every entry without a non-empty post-processing result and
    /// returns how many were removed.
    pub fn clean_up(&mut self) -> usize {
        let incomplete: Vec<UnitKey> = self
            .preprocessed
            .iter()
            .filter(|(_, q)| {
                !self.simulated.contains_key(*q)
                    || self.postprocessed.get(*q).map_or(true, |qoi| qoi.is_empty())
            })
            .map(|(unit, _)| unit.clone())
            .collect();
        for unit in &incomplete {
            self.remove(unit);
        }
        incomplete.len()
    }

    /// Moves up to `count` entries, lowest unit keys first, into a new cache
    /// that is disjoint from this one.
    pub fn split_off(&mut self, count: usize) -> StageCache {
        let mut units: Vec<UnitKey> = self.preprocessed.keys().cloned().collect();
        units.sort();
        let mut out = StageCache::new(self.verbose);
        out.lastid = self.lastid;
        out.setup_digest = self.setup_digest.clone();
        for unit in units.into_iter().take(count) {
            let Some(q) = self.preprocessed.remove(&unit) else {
                continue;
            };
            self.preprocessed_reverse.remove(&q);
            if let Some(raw) = self.simulated.remove(&q) {
                out.simulated.insert(q.clone(), raw);
            }
            if let Some(qoi) = self.postprocessed.remove(&q) {
                out.postprocessed.insert(q.clone(), qoi);
            }
            out.preprocessed_reverse.insert(q.clone(), unit.clone());
            out.preprocessed.insert(unit, q);
        }
        out
    }

    /// Merges a cache evaluated on a disjoint parameter set. Any key present
    /// in both caches, in any of the four maps, is an error and leaves `self`
    /// untouched.
    pub fn merge_stats(&mut self, other: StageCache) -> Result<(), UqError> {
        fn overlap<K: std::hash::Hash + Eq + std::fmt::Display, A, B>(
            ours: &HashMap<K, A>,
            theirs: &HashMap<K, B>,
            map: &str,
        ) -> Result<(), UqError> {
            match theirs.keys().find(|k| ours.contains_key(*k)) {
                Some(key) => Err(consistency(format!(
                    "overlapping settings => cannot merge them automatically ({} key {})",
                    map, key
                ))),
                None => Ok(()),
            }
        }
        overlap(&self.preprocessed, &other.preprocessed, "preprocessed")?;
        overlap(
            &self.preprocessed_reverse,
            &other.preprocessed_reverse,
            "preprocessed_reverse",
        )?;
        overlap(&self.simulated, &other.simulated, "simulated")?;
        overlap(&self.postprocessed, &other.postprocessed, "postprocessed")?;

        if let (Some(ours), Some(theirs)) = (
            self.preprocessed.values().next(),
            other.preprocessed.values().next(),
        ) {
            if ours.len() != theirs.len() {
                return Err(consistency(format!(
                    "cannot merge caches with pre-processor dimensions {} and {}",
                    ours.len(),
                    theirs.len()
                )));
            }
        }

        self.preprocessed.extend(other.preprocessed);
        self.preprocessed_reverse.extend(other.preprocessed_reverse);
        self.simulated.extend(other.simulated);
        self.postprocessed.extend(other.postprocessed);
        self.lastid = self.lastid.max(other.lastid);
        self.check_invariants()
    }

    /// Forgets every stage result; the id counter and flags are kept.
    pub fn clear(&mut self) {
        self.preprocessed.clear();
        self.preprocessed_reverse.clear();
        self.simulated.clear();
        self.postprocessed.clear();
    }

    pub(crate) fn entries(&self) -> CacheEntries<'_> {
        CacheEntries {
            preprocessed: &self.preprocessed,
            preprocessed_reverse: &self.preprocessed_reverse,
            simulated: &self.simulated,
            postprocessed: &self.postprocessed,
        }
    }

    pub(crate) fn from_entries(
        preprocessed: HashMap<UnitKey, TransformedKey>,
        preprocessed_reverse: HashMap<TransformedKey, UnitKey>,
        simulated: HashMap<TransformedKey, RawResult>,
        postprocessed: HashMap<TransformedKey, QoiMap>,
    ) -> Result<Self, UqError> {
        let cache = Self {
            preprocessed,
            preprocessed_reverse,
            simulated,
            postprocessed,
            ..Self::default()
        };
        cache.check_invariants()?;
        Ok(cache)
    }

    pub fn unit_keys(&self) -> BTreeSet<UnitKey> {
        self.preprocessed.keys().cloned().collect()
    }
}

pub(crate) struct CacheEntries<'a> {
    pub preprocessed: &'a HashMap<UnitKey, TransformedKey>,
    pub preprocessed_reverse: &'a HashMap<TransformedKey, UnitKey>,
    pub simulated: &'a HashMap<TransformedKey, RawResult>,
    pub postprocessed: &'a HashMap<TransformedKey, QoiMap>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::ParamKey;
    use serde_json::json;

    fn key(values: &[f64]) -> ParamKey {
        ParamKey::new(values.to_vec())
    }

    fn qoi(value: f64) -> QoiMap {
        let mut map = QoiMap::new();
        map.insert("qoi".to_string(), vec![value]);
        map
    }

    fn filled(points: &[f64]) -> StageCache {
        let mut cache = StageCache::new(false);
        for p in points {
            cache
                .put_preprocessed(key(&[*p, 1.0]), key(&[*p * 10.0, 1.0]))
                .expect("pre");
            cache
                .put_simulated(key(&[*p * 10.0, 1.0]), json!({"x": p}))
                .expect("sim");
            cache
                .put_postprocessed(key(&[*p * 10.0, 1.0]), qoi(*p))
                .expect("post");
        }
        cache
    }

    #[test]
    fn near_identical_unit_keys_resolve_to_the_same_entry() {
        let mut cache = filled(&[0.3, 0.6]);
        let nearby = key(&[0.3 * (1.0 + 5e-8), 1.0]);
        let q = cache.lookup_preprocessed(&nearby).expect("equivalent entry");
        assert_eq!(q, key(&[3.0, 1.0]));
        assert!(cache.preprocessed(&nearby).is_some());
        assert!(cache.preprocessed(&key(&[0.3, 1.0])).is_none());
        assert_eq!(cache.unit_for(&q), Some(&nearby));
        assert!(cache.has_result(&nearby));
        cache.check_invariants().expect("invariants hold after re-keying");
    }

    #[test]
    fn distant_unit_keys_are_new_points() {
        let mut cache = filled(&[0.3]);
        let far = key(&[0.3 * (1.0 + 2e-3), 1.0]);
        assert!(cache.lookup_preprocessed(&far).is_none());
        assert!(cache.preprocessed(&key(&[0.3, 1.0])).is_some());
    }

    #[test]
    fn closest_equivalent_wins_when_several_are_in_tolerance() {
        let near = 0.3 * (1.0 + 4e-7);
        let mut cache = filled(&[0.3, near]);
        let query = key(&[0.3 * (1.0 + 3e-7), 1.0]);
        let q = cache.lookup_preprocessed(&query).expect("equivalent entry");
        assert_eq!(q, key(&[near * 10.0, 1.0]));
        assert!(cache.preprocessed(&key(&[near, 1.0])).is_none());
        assert!(cache.preprocessed(&key(&[0.3, 1.0])).is_some());
        cache.check_invariants().expect("invariants");
    }

    #[test]
    fn non_injective_preprocessor_is_rejected() {
        let mut cache = StageCache::new(false);
        cache.put_preprocessed(key(&[0.1]), key(&[5.0])).expect("first");
        let err = cache
            .put_preprocessed(key(&[0.9]), key(&[5.0]))
            .expect_err("second unit key maps to the same point");
        assert!(err.is_fatal());
        assert!(err.to_string().contains("not injective"), "{}", err);
    }

    #[test]
    fn dimension_change_is_rejected() {
        let mut cache = StageCache::new(false);
        cache.put_preprocessed(key(&[0.1]), key(&[1.0, 2.0])).expect("first");
        let err = cache
            .put_preprocessed(key(&[0.2]), key(&[1.0]))
            .expect_err("dimension changed");
        assert!(matches!(err, UqError::ConsistencyViolation(_)));
    }

    #[test]
    fn postprocessor_quantities_must_not_change() {
        let mut cache = filled(&[0.1]);
        cache.put_preprocessed(key(&[0.2, 1.0]), key(&[2.0, 1.0])).expect("pre");
        cache.put_simulated(key(&[2.0, 1.0]), json!(1)).expect("sim");
        let mut other = QoiMap::new();
        other.insert("other".to_string(), vec![1.0]);
        assert!(cache.put_postprocessed(key(&[2.0, 1.0]), other).is_err());
    }

    #[test]
    fn merging_disjoint_caches_adds_sizes() {
        let mut a = filled(&[0.1, 0.2]);
        a.set_lastid(4);
        let mut b = filled(&[0.3, 0.4, 0.5]);
        b.set_lastid(9);
        a.merge_stats(b).expect("disjoint merge");
        assert_eq!(a.size(Stage::Preprocess), 5);
        assert_eq!(a.size(Stage::Simulate), 5);
        assert_eq!(a.size(Stage::Postprocess), 5);
        assert_eq!(a.lastid(), 9);
    }

    #[test]
    fn merging_overlapping_caches_fails_without_changes() {
        let mut a = filled(&[0.1, 0.2]);
        let b = filled(&[0.2, 0.3]);
        let err = a.merge_stats(b).expect_err("overlap");
        assert!(err.to_string().contains("overlapping settings"), "{}", err);
        assert!(err.is_fatal());
        assert_eq!(a.size(Stage::Preprocess), 2);
    }

    #[test]
    fn split_off_produces_disjoint_parts() {
        let mut a = filled(&[0.1, 0.2, 0.3, 0.4]);
        let b = a.split_off(3);
        assert_eq!(b.size(Stage::Preprocess), 3);
        assert_eq!(a.size(Stage::Preprocess), 1);
        a.check_invariants().expect("rest");
        b.check_invariants().expect("split part");
        assert!(a.has_result(&key(&[0.4, 1.0])));
        a.merge_stats(b).expect("parts merge back");
        assert_eq!(a.size(Stage::Postprocess), 4);
    }

    #[test]
    fn clean_up_drops_incomplete_entries() {
        let mut cache = filled(&[0.1]);
        cache.put_preprocessed(key(&[0.2, 1.0]), key(&[2.0, 1.0])).expect("pre");
        cache.put_simulated(key(&[2.0, 1.0]), json!(1)).expect("sim");
        assert_eq!(cache.sanity_check(), 1);
        assert_eq!(cache.clean_up(), 1);
        assert_eq!(cache.sanity_check(), 0);
        assert_eq!(cache.size(Stage::Simulate), 1);
    }

    #[test]
    fn next_ids_reserves_disjoint_blocks() {
        let mut cache = StageCache::new(false);
        assert_eq!(cache.next_ids(5), 0);
        assert_eq!(cache.next_ids(3), 5);
        assert_eq!(cache.lastid(), 8);
    }
}

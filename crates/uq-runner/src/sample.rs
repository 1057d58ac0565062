use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::Path;

/// Ordered float tuple used as a cache key.
///
/// Equality and hashing work on the bit pattern, with `-0.0` folded into
/// `0.0`, so two keys are equal exactly when every coordinate compares equal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamKey(Vec<f64>);

pub type UnitKey = ParamKey;
pub type TransformedKey = ParamKey;

impl ParamKey {
    pub fn new(values: Vec<f64>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn has_nan(&self) -> bool {
        self.0.iter().any(|v| v.is_nan())
    }

    /// Symmetric relative difference: `Σ|a−b|/|b| + Σ|a−b|/|a|`, skipping zero
    /// denominators. Keys of different dimension are infinitely far apart.
    pub fn relative_difference(&self, other: &ParamKey) -> f64 {
        if self.len() != other.len() {
            return f64::INFINITY;
        }
        let mut diff = 0.0;
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            let delta = (a - b).abs();
            if b.abs() > 0.0 {
                diff += delta / b.abs();
            }
            if a.abs() > 0.0 {
                diff += delta / a.abs();
            }
        }
        diff
    }

    fn canonical_bits(&self) -> impl Iterator<Item = u64> + '_ {
        self.0
            .iter()
            .map(|v| if *v == 0.0 { 0.0f64.to_bits() } else { v.to_bits() })
    }
}

impl PartialEq for ParamKey {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.canonical_bits().eq(other.canonical_bits())
    }
}

impl Eq for ParamKey {}

impl Hash for ParamKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.len().hash(state);
        for bits in self.canonical_bits() {
            bits.hash(state);
        }
    }
}

impl PartialOrd for ParamKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ParamKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        for (a, b) in self.canonical_bits().zip(other.canonical_bits()) {
            let ord = f64::from_bits(a).total_cmp(&f64::from_bits(b));
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        self.len().cmp(&other.len())
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}

impl From<Vec<f64>> for ParamKey {
    fn from(values: Vec<f64>) -> Self {
        Self(values)
    }
}

/// One evaluation point, in unit space and in probabilistic space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    unit: Vec<f64>,
    #[serde(default)]
    probabilistic: Option<Vec<f64>>,
}

impl Sample {
    pub fn new(unit: Vec<f64>, probabilistic: Vec<f64>) -> Self {
        Self {
            unit,
            probabilistic: Some(probabilistic),
        }
    }

    pub fn from_unit(unit: Vec<f64>) -> Self {
        Self {
            unit,
            probabilistic: None,
        }
    }

    pub fn unit_space(&self) -> &[f64] {
        &self.unit
    }

    /// Falls back to the unit coordinates when no transformation was recorded.
    pub fn probabilistic_space(&self) -> &[f64] {
        self.probabilistic.as_deref().unwrap_or(&self.unit)
    }

    pub fn unit_key(&self) -> UnitKey {
        ParamKey::new(self.unit.clone())
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", ParamKey::new(self.unit.clone()))
    }
}

/// Reads a JSON Lines file with one sample per line. Blank lines are skipped.
pub fn load_samples(path: &Path) -> Result<Vec<Sample>> {
    let raw = fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read samples file {}: {}", path.display(), e))?;
    let mut samples = Vec::new();
    for (idx, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let sample: Sample = serde_json::from_str(line).map_err(|e| {
            anyhow!("invalid sample on line {} of {}: {}", idx + 1, path.display(), e)
        })?;
        samples.push(sample);
    }
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn negative_zero_and_zero_are_the_same_key() {
        let mut set = HashSet::new();
        set.insert(ParamKey::new(vec![0.0, 1.0]));
        assert!(set.contains(&ParamKey::new(vec![-0.0, 1.0])));
    }

    #[test]
    fn relative_difference_skips_zero_denominators() {
        let a = ParamKey::new(vec![0.0, 0.5]);
        let b = ParamKey::new(vec![0.0, 0.5]);
        assert_eq!(a.relative_difference(&b), 0.0);

        let c = ParamKey::new(vec![0.25]);
        let d = ParamKey::new(vec![0.5]);
        // 0.25/0.5 + 0.25/0.25
        assert!((c.relative_difference(&d) - 1.5).abs() < 1e-12);
        assert_eq!(c.relative_difference(&a), f64::INFINITY);
    }

    #[test]
    fn probabilistic_space_defaults_to_unit() {
        let s: Sample = serde_json::from_str(r#"{"unit":[0.5,0.25]}"#).expect("parse");
        assert_eq!(s.probabilistic_space(), &[0.5, 0.25]);
        let t = Sample::new(vec![0.5], vec![3.0]);
        assert_eq!(t.probabilistic_space(), &[3.0]);
    }
}

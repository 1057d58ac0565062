use crate::cache::{QoiMap, StageCache};
use crate::sample::UnitKey;
use crate::stages::TimeWindow;
use anyhow::{anyhow, Result};

/// Name of the quantity that, when present, carries a point's own time steps.
pub const TIME_QOI: &str = "time";

/// Two time steps closer than this are the same step.
pub const TIME_MATCH_TOLERANCE: f64 = 1e-8;

/// Time steps of a series of `len` values laid out by `window`.
///
/// With `t0`, `tn` and `dt` set the steps are `ceil((tn - t0) / dt + 1)` points
/// evenly spread over `[t0, tn]`. Without `tn` they start at `t0` with stride
/// `dt`. With nothing set they are `0, 1, .., len - 1`.
pub fn window_time_steps(window: &TimeWindow, len: usize) -> Result<Vec<f64>> {
    match (window.t0, window.tn, window.dt) {
        (Some(t0), Some(tn), Some(dt)) => {
            if dt.is_nan() || dt <= 0.0 || tn < t0 {
                return Err(anyhow!("invalid time window t0={} tn={} dt={}", t0, tn, dt));
            }
            let n = ((tn - t0) / dt + 1.0).ceil() as usize;
            Ok(linspace(t0, tn, n))
        }
        (Some(t0), None, Some(dt)) => Ok((0..len).map(|i| t0 + i as f64 * dt).collect()),
        (None, None, None) => Ok((0..len).map(|i| i as f64).collect()),
        _ => Err(anyhow!(
            "time window needs t0 and dt (tn optional) or nothing at all, got {:?}",
            window
        )),
    }
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n).map(|i| start + i as f64 * step).collect()
        }
    }
}

/// The time steps stored for one postprocessed point.
pub fn stored_time_steps(qoi: &QoiMap, len: usize, window: &TimeWindow) -> Result<Vec<f64>> {
    match qoi.get(TIME_QOI) {
        Some(time) => Ok(time.clone()),
        None => window_time_steps(window, len),
    }
}

impl StageCache {
    /// Values of `qoi` for `unit` at the requested time steps.
    ///
    /// `None` when the point was never postprocessed. Steps before the stored
    /// range read 0. Steps after it read the last value when
    /// `window.steady_state` is set and fail otherwise. Steps inside the range
    /// must match a stored step. An empty `ts` returns the whole stored series
    /// in time order.
    pub fn result_at(
        &self,
        unit: &UnitKey,
        qoi: &str,
        ts: &[f64],
        window: &TimeWindow,
    ) -> Result<Option<Vec<f64>>> {
        let q = self
            .preprocessed(unit)
            .ok_or_else(|| anyhow!("{} has not been evaluated", unit))?;
        let Some(post) = self.postprocessed(q) else {
            return Ok(None);
        };
        let values = post
            .get(qoi)
            .ok_or_else(|| anyhow!("quantity of interest {:?} not available for {}", qoi, unit))?;
        let steps = stored_time_steps(post, values.len(), window)?;
        if steps.len() != values.len() {
            return Err(anyhow!(
                "{} holds {} values of {:?} for {} time steps",
                unit,
                values.len(),
                qoi,
                steps.len()
            ));
        }
        if steps.is_empty() {
            return Ok(None);
        }
        if steps.len() == 1 {
            let n = ts.len().max(1);
            return Ok(Some(vec![values[0]; n]));
        }

        let mut series: Vec<(f64, f64)> = steps.into_iter().zip(values.iter().copied()).collect();
        series.sort_by(|a, b| a.0.total_cmp(&b.0));
        if ts.is_empty() {
            return Ok(Some(series.into_iter().map(|(_, v)| v).collect()));
        }

        let (first, _) = series[0];
        let (last, last_value) = series[series.len() - 1];
        let mut out = Vec::with_capacity(ts.len());
        for &t in ts {
            if let Some(&(_, v)) = series
                .iter()
                .find(|(s, _)| (s - t).abs() < TIME_MATCH_TOLERANCE)
            {
                out.push(v);
            } else if t < first {
                out.push(0.0);
            } else if t > last {
                if !window.steady_state {
                    return Err(anyhow!(
                        "extrapolation needed for t={} past {} but no steady state reached",
                        t,
                        last
                    ));
                }
                out.push(last_value);
            } else {
                return Err(anyhow!("no stored time step matches t={} for {}", t, unit));
            }
        }
        Ok(Some(out))
    }

    /// [`StageCache::result_at`] for every postprocessed point, ordered by
    /// unit key.
    pub fn results_at(
        &self,
        qoi: &str,
        ts: &[f64],
        window: &TimeWindow,
    ) -> Result<Vec<(UnitKey, Vec<f64>)>> {
        let mut out = Vec::new();
        for unit in self.unit_keys() {
            if let Some(values) = self.result_at(&unit, qoi, ts, window)? {
                out.push((unit, values));
            }
        }
        Ok(out)
    }
}

use crate::cache::{QoiMap, RawResult};
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::{debug, warn};

/// Optional simulation time window handed to every stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    #[serde(default)]
    pub t0: Option<f64>,
    #[serde(default)]
    pub tn: Option<f64>,
    #[serde(default)]
    pub dt: Option<f64>,
    /// Results past the last stored time step hold the final value.
    #[serde(default)]
    pub steady_state: bool,
}

/// The three external collaborators of the pipeline.
///
/// A missing preprocessor is the identity on the probabilistic coordinates
/// and a missing postprocessor reads the raw result as the quantity map, so
/// only `simulate` has to be provided.
pub trait Stages {
    fn preprocess(&self, params: &[f64], _window: &TimeWindow) -> Result<Vec<f64>> {
        Ok(params.to_vec())
    }

    fn simulate(&self, params: &[f64], window: &TimeWindow) -> Result<RawResult>;

    fn postprocess(
        &self,
        raw: &RawResult,
        _params: &[f64],
        _window: &TimeWindow,
    ) -> Result<QoiMap> {
        qoi_from_value(raw)
    }
}

/// Reads `{"name": [values...]}` (or `{"name": value}`) as a quantity map.
pub fn qoi_from_value(value: &Value) -> Result<QoiMap> {
    let obj = value
        .as_object()
        .ok_or_else(|| anyhow!("expected an object of quantities of interest, got {}", value))?;
    let mut out = QoiMap::new();
    for (name, v) in obj {
        let series = match v {
            Value::Array(items) => items
                .iter()
                .map(|x| {
                    x.as_f64()
                        .ok_or_else(|| anyhow!("quantity '{}' holds a non-numeric value {}", name, x))
                })
                .collect::<Result<Vec<f64>>>()?,
            Value::Number(n) => vec![n
                .as_f64()
                .ok_or_else(|| anyhow!("quantity '{}' is not a float", name))?],
            other => return Err(anyhow!("quantity '{}' has unsupported value {}", name, other)),
        };
        out.insert(name.clone(), series);
    }
    Ok(out)
}

/// Stage commands as they appear in the setup document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageCommands {
    #[serde(default)]
    pub preprocess: Option<Vec<String>>,
    pub simulate: Vec<String>,
    #[serde(default)]
    pub postprocess: Option<Vec<String>>,
}

/// Runs each stage as an external program.
///
/// The program gets a JSON payload on stdin plus `UQ_STAGE`, `UQ_PARAMS`
/// (space separated) and `UQ_T0`/`UQ_TN`/`UQ_DT` in its environment. The
/// last non-empty stdout line must be a JSON document.
#[derive(Debug, Clone)]
pub struct CommandStages {
    commands: StageCommands,
    workdir: Option<PathBuf>,
}

impl CommandStages {
    pub fn new(commands: StageCommands, workdir: Option<PathBuf>) -> Result<Self> {
        if commands.simulate.is_empty() {
            return Err(anyhow!("stages.simulate must name a command"));
        }
        for (name, cmd) in [
            ("preprocess", &commands.preprocess),
            ("postprocess", &commands.postprocess),
        ] {
            if matches!(cmd, Some(c) if c.is_empty()) {
                return Err(anyhow!("stages.{} is present but empty", name));
            }
        }
        Ok(Self { commands, workdir })
    }

    fn invoke(
        &self,
        stage: &str,
        command: &[String],
        params: &[f64],
        window: &TimeWindow,
        payload: Value,
    ) -> Result<Value> {
        let mut cmd = Command::new(&command[0]);
        cmd.args(&command[1..]);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        cmd.env("UQ_STAGE", stage);
        cmd.env(
            "UQ_PARAMS",
            params
                .iter()
                .map(|p| format!("{:?}", p))
                .collect::<Vec<_>>()
                .join(" "),
        );
        for (var, value) in [("UQ_T0", window.t0), ("UQ_TN", window.tn), ("UQ_DT", window.dt)] {
            if let Some(v) = value {
                cmd.env(var, format!("{:?}", v));
            }
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let input = serde_json::to_vec(&payload)?;
        let mut child = cmd
            .spawn()
            .map_err(|e| anyhow!("failed to start {} command '{}': {}", stage, command[0], e))?;
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(&input) {
                // commands that only read the UQ_* environment close stdin early
                if e.kind() == ErrorKind::BrokenPipe {
                    debug!(stage, command = %command[0], "command did not read its payload");
                } else {
                    warn!(stage, command = %command[0], error = %e, "failed to send payload");
                }
            }
        }
        let output = child.wait_with_output()?;

        if !output.status.success() {
            let stderr_tail = String::from_utf8_lossy(&output.stderr)
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("no output on stderr")
                .to_string();
            return Err(anyhow!(
                "{} command exited with {}: {}",
                stage,
                output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stderr_tail
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| anyhow!("{} command printed no result", stage))?;
        serde_json::from_str(line.trim())
            .map_err(|e| anyhow!("{} command printed invalid JSON '{}': {}", stage, line.trim(), e))
    }
}

impl Stages for CommandStages {
    fn preprocess(&self, params: &[f64], window: &TimeWindow) -> Result<Vec<f64>> {
        let Some(command) = &self.commands.preprocess else {
            return Ok(params.to_vec());
        };
        let payload = json!({ "stage": "preprocess", "params": params, "window": window });
        let value = self.invoke("preprocess", command, params, window, payload)?;
        let list = value
            .get("params")
            .unwrap_or(&value)
            .as_array()
            .ok_or_else(|| anyhow!("preprocess must print a list of floats, got {}", value))?;
        list.iter()
            .map(|v| {
                v.as_f64()
                    .ok_or_else(|| anyhow!("preprocess returned non-numeric parameter {}", v))
            })
            .collect()
    }

    fn simulate(&self, params: &[f64], window: &TimeWindow) -> Result<RawResult> {
        let payload = json!({ "stage": "simulate", "params": params, "window": window });
        self.invoke("simulate", &self.commands.simulate, params, window, payload)
    }

    fn postprocess(&self, raw: &RawResult, params: &[f64], window: &TimeWindow) -> Result<QoiMap> {
        let Some(command) = &self.commands.postprocess else {
            return qoi_from_value(raw);
        };
        let payload = json!({
            "stage": "postprocess",
            "params": params,
            "window": window,
            "raw": raw,
        });
        let value = self.invoke("postprocess", command, params, window, payload)?;
        qoi_from_value(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn qoi_accepts_scalars_and_series() {
        let qoi = qoi_from_value(&json!({"a": [1.0, 2.0], "b": 3})).expect("qoi");
        assert_eq!(qoi["a"], vec![1.0, 2.0]);
        assert_eq!(qoi["b"], vec![3.0]);
        assert!(qoi_from_value(&json!([1, 2])).is_err());
        assert!(qoi_from_value(&json!({"a": "x"})).is_err());
    }

    #[test]
    fn command_stage_reads_last_stdout_line() {
        let stages = CommandStages::new(
            StageCommands {
                preprocess: None,
                simulate: sh("echo progress; echo \"{\\\"qoi\\\": [$UQ_PARAMS]}\""),
                postprocess: None,
            },
            None,
        )
        .expect("stages");
        let window = TimeWindow::default();
        let q = stages.preprocess(&[0.5], &window).expect("identity");
        assert_eq!(q, vec![0.5]);
        let raw = stages.simulate(&q, &window).expect("simulate");
        let qoi = stages.postprocess(&raw, &q, &window).expect("post");
        assert_eq!(qoi["qoi"], vec![0.5]);
    }

    #[test]
    fn command_closing_stdin_still_returns_its_result() {
        let stages = CommandStages::new(
            StageCommands {
                preprocess: None,
                simulate: sh("exec 0<&-; echo \"{\\\"qoi\\\": [$UQ_PARAMS]}\""),
                postprocess: None,
            },
            None,
        )
        .expect("stages");
        let window = TimeWindow::default();
        let raw = stages.simulate(&[0.25], &window).expect("simulate");
        assert_eq!(raw, json!({"qoi": [0.25]}));
    }

    #[test]
    fn failing_command_reports_stderr_tail() {
        let stages = CommandStages::new(
            StageCommands {
                preprocess: None,
                simulate: sh("echo boom >&2; exit 3"),
                postprocess: None,
            },
            None,
        )
        .expect("stages");
        let err = stages
            .simulate(&[1.0], &TimeWindow::default())
            .expect_err("non-zero exit");
        let msg = err.to_string();
        assert!(msg.contains("exited with 3"), "{}", msg);
        assert!(msg.contains("boom"), "{}", msg);
    }

    #[test]
    fn empty_simulate_command_is_rejected() {
        assert!(CommandStages::new(StageCommands::default(), None).is_err());
    }
}

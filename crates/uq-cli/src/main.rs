use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uq_runner::{
    BatchReport, ChildRecord, Dispatcher, HostsConfig, Stage, StageCache, TimeWindow, UnitKey,
};

const DEFAULT_LOG_FILTER: &str = "uq_runner=info,uq_cli=info";

#[derive(Parser)]
#[command(name = "uq", version, about = "Memoizing UQ pipeline runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluates a samples file, locally or over a host pool.
    Run {
        setup: PathBuf,
        samples: PathBuf,
        #[arg(long)]
        hosts: Option<PathBuf>,
        #[arg(long)]
        cache: Option<PathBuf>,
        #[arg(long)]
        expected_samples: Option<usize>,
        #[arg(long, default_value_t = 0)]
        resubmit_rounds: u32,
        #[arg(long)]
        json: bool,
    },
    #[command(hide = true)]
    Worker,
    /// Merges cache files evaluated on disjoint samples into `target`.
    Merge {
        target: PathBuf,
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Moves `count` entries of `cache` into a new cache file.
    Split {
        cache: PathBuf,
        count: usize,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Check {
        cache: PathBuf,
        #[arg(long)]
        clean: bool,
        #[arg(long)]
        json: bool,
    },
    /// Prints stored results, or their values at the `--ts` time steps.
    Results {
        cache: PathBuf,
        #[arg(long)]
        qoi: Option<String>,
        #[arg(long, value_delimiter = ',', allow_negative_numbers = true, allow_hyphen_values = true)]
        ts: Vec<f64>,
        /// Setup whose time window lays out the stored series.
        #[arg(long)]
        setup: Option<PathBuf>,
        #[arg(long)]
        steady_state: bool,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            setup,
            samples,
            hosts,
            cache,
            expected_samples,
            resubmit_rounds,
            json,
        } => {
            let mut setup = uq_runner::Setup::load(&setup)?;
            if let Some(cache) = cache {
                setup.cache_file = cache;
            }
            if expected_samples.is_some() {
                setup.expected_samples = expected_samples;
            }
            let samples = uq_runner::load_samples(&samples)?;
            let mut pipeline = uq_runner::command_pipeline(&setup)?;

            let Some(hosts) = hosts else {
                let report = pipeline.run_samples(&samples)?;
                if json {
                    return Ok(Some(json!({
                        "ok": true,
                        "command": "run",
                        "mode": "local",
                        "cache_file": setup.cache_file.display().to_string(),
                        "batch": batch_report_to_json(&report),
                        "results": pipeline.cache().size(Stage::Postprocess)
                    })));
                }
                println!("cache_file: {}", setup.cache_file.display());
                println!("evaluated: {}", report.evaluated);
                println!("invalid: {}", report.invalid.len());
                println!("results: {}", pipeline.cache().size(Stage::Postprocess));
                return Ok(None);
            };

            let hosts = HostsConfig::load(&hosts)?;
            let worker_command = worker_command(setup.worker_program.as_deref())?;
            let cache_file = setup.cache_file.clone();
            let mut dispatcher = Dispatcher::new(setup, &hosts, worker_command)?;
            let mut report = dispatcher.run(&mut pipeline, samples)?;
            for round in 1..=resubmit_rounds {
                if dispatcher.crashed().is_empty() {
                    break;
                }
                info!(round, chunks = dispatcher.crashed().len(), "resubmission round");
                dispatcher.resubmit_crashed()?;
                report.merged += dispatcher.load_results(&mut pipeline)?;
            }
            let crashed = dispatcher.crashed().to_vec();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "mode": "distributed",
                    "cache_file": cache_file.display().to_string(),
                    "submitted": report.submitted,
                    "skipped": report.skipped,
                    "chunks": report.chunks,
                    "merged": report.merged,
                    "crashed": crashed.iter().map(child_record_to_json).collect::<Vec<_>>(),
                    "results": pipeline.cache().size(Stage::Postprocess)
                })));
            }
            println!("cache_file: {}", cache_file.display());
            println!("submitted: {}", report.submitted);
            println!("skipped: {}", report.skipped);
            println!("chunks: {}", report.chunks);
            println!("merged: {}", report.merged);
            println!("crashed: {}", crashed.len());
            for record in &crashed {
                println!(
                    "  start_index={} samples={} host={} file={}",
                    record.start_index,
                    record.chunk.samples.len(),
                    record.host,
                    record.output.local.display()
                );
            }
            println!("results: {}", pipeline.cache().size(Stage::Postprocess));
        }
        Commands::Worker => {
            let payload = uq_runner::read_payload(std::io::stdin().lock())?;
            uq_runner::run_command_worker(&payload)?;
        }
        Commands::Merge {
            target,
            inputs,
            json,
        } => {
            let mut cache = uq_runner::open_or_create(&target, false)?;
            for input in &inputs {
                uq_runner::load_file(&mut cache, input)?;
            }
            uq_runner::write_cache(&target, &cache)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "merge",
                    "target": target.display().to_string(),
                    "inputs": inputs.iter().map(|p| p.display().to_string()).collect::<Vec<_>>(),
                    "sizes": sizes_to_json(&cache)
                })));
            }
            println!("target: {}", target.display());
            println!("merged: {}", inputs.len());
            print_sizes(&cache);
        }
        Commands::Split {
            cache,
            count,
            out,
            json,
        } => {
            if out.exists() {
                return Err(anyhow!("refusing to overwrite {}", out.display()));
            }
            let mut source = uq_runner::read_cache(&cache)?;
            let part = source.split_off(count);
            uq_runner::write_cache(&out, &part)?;
            uq_runner::write_cache(&cache, &source)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "split",
                    "cache": cache.display().to_string(),
                    "out": out.display().to_string(),
                    "moved": part.size(Stage::Preprocess),
                    "remaining": source.size(Stage::Preprocess)
                })));
            }
            println!("moved: {}", part.size(Stage::Preprocess));
            println!("remaining: {}", source.size(Stage::Preprocess));
            println!("out: {}", out.display());
        }
        Commands::Check { cache, clean, json } => {
            let mut loaded = uq_runner::read_cache(&cache)?;
            let problems = loaded.sanity_check();
            let removed = if clean {
                let removed = loaded.clean_up();
                if removed > 0 {
                    uq_runner::write_cache(&cache, &loaded)?;
                }
                removed
            } else {
                0
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "check",
                    "cache": cache.display().to_string(),
                    "problems": problems,
                    "removed": removed,
                    "lastid": loaded.lastid(),
                    "setup_digest": loaded.setup_digest(),
                    "sizes": sizes_to_json(&loaded)
                })));
            }
            println!("cache: {}", cache.display());
            println!("problems: {}", problems);
            if clean {
                println!("removed: {}", removed);
            }
            println!("lastid: {}", loaded.lastid());
            print_sizes(&loaded);
        }
        Commands::Results {
            cache,
            qoi,
            ts,
            setup,
            steady_state,
            json,
        } => {
            let loaded = uq_runner::read_cache(&cache)?;
            let mut window = match setup {
                Some(path) => uq_runner::Setup::load(&path)?.time,
                None => TimeWindow::default(),
            };
            window.steady_state |= steady_state;
            let names = match qoi {
                Some(name) => vec![name],
                None => loaded.available_qoi(),
            };
            let mut rows_by_name = Vec::with_capacity(names.len());
            for name in names {
                let rows = if ts.is_empty() {
                    loaded.results(&name)
                } else {
                    loaded.results_at(&name, &ts, &window)?
                };
                rows_by_name.push((name, rows));
            }
            if json {
                let mut out = serde_json::Map::new();
                for (name, rows) in &rows_by_name {
                    let rows: Vec<Value> = rows
                        .iter()
                        .map(|(unit, values)| result_row_to_json(unit, values))
                        .collect();
                    out.insert(name.clone(), Value::Array(rows));
                }
                return Ok(Some(json!({
                    "ok": true,
                    "command": "results",
                    "cache": cache.display().to_string(),
                    "ts": ts,
                    "qoi": out
                })));
            }
            for (name, rows) in &rows_by_name {
                for (unit, values) in rows {
                    let values: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                    println!("{} {} {}", name, unit, values.join(" "));
                }
            }
        }
    }
    Ok(None)
}

/// Program (and leading arguments) that workers are started with; defaults
/// to this executable.
fn worker_command(configured: Option<&str>) -> Result<Vec<String>> {
    if let Some(program) = configured {
        let parts: Vec<String> = program.split_whitespace().map(str::to_string).collect();
        if parts.is_empty() {
            return Err(anyhow!("worker_program is empty"));
        }
        return Ok(parts);
    }
    let exe = std::env::current_exe()?;
    Ok(vec![exe.to_string_lossy().to_string()])
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Merge { json, .. }
        | Commands::Split { json, .. }
        | Commands::Check { json, .. }
        | Commands::Results { json, .. } => *json,
        Commands::Worker => false,
    }
}

fn batch_report_to_json(report: &BatchReport) -> Value {
    json!({
        "evaluated": report.evaluated,
        "invalid": report.invalid.iter().map(|s| json!({
            "index": s.index,
            "unit": s.sample.unit_space(),
            "kind": s.kind,
            "message": s.message
        })).collect::<Vec<_>>()
    })
}

fn child_record_to_json(record: &ChildRecord) -> Value {
    json!({
        "start_index": record.start_index,
        "samples": record.chunk.samples.len(),
        "host": record.host,
        "file": record.output.local.display().to_string()
    })
}

fn result_row_to_json(unit: &UnitKey, values: &[f64]) -> Value {
    json!({
        "unit": unit.values(),
        "values": values
    })
}

fn sizes_to_json(cache: &StageCache) -> Value {
    json!({
        "preprocessor": cache.size(Stage::Preprocess),
        "simulation": cache.size(Stage::Simulate),
        "postprocessor": cache.size(Stage::Postprocess)
    })
}

fn print_sizes(cache: &StageCache) {
    for stage in [Stage::Preprocess, Stage::Simulate, Stage::Postprocess] {
        println!("{}: {}", stage.as_str(), cache.size(stage));
    }
}

use std::{path::PathBuf, str::FromStr};

use clap::Parser;
use serde_json::{Map, Number, Value};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};
use training::{Trainer, TrainingConfig, TrainingError};

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Image classifier training CLI", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to training config file (TOML or JSON)"
    )]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, help = "Resume from the latest checkpoint if available")]
    resume: bool,

    #[arg(
        long,
        value_name = "CHECKPOINT_DIR",
        help = "Only evaluate the given checkpoint on the validation set"
    )]
    eval: Option<PathBuf>,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = TrainingConfig::load(&args.config)?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
    }
    if args.resume {
        config.runtime.checkpoint.auto_continue = true;
    }
    config.validate()?;

    let mut trainer = Trainer::new(config)?;

    if let Some(directory) = args.eval {
        let summary = trainer.evaluate_checkpoint(&directory)?;
        log::info!(
            "evaluated {} at iteration {}: top-1 err {:.4}, top-5 err {:.4}",
            directory.display(),
            summary.iteration,
            summary.top1_err,
            summary.top5_err
        );
        return Ok(());
    }

    let report = trainer.run()?;
    log::info!(
        "training finished at iteration {} (started at {}); final checkpoint {}",
        report.final_iteration,
        report.start_iteration,
        report.stabilized.directory.display()
    );
    Ok(())
}

fn apply_overrides(
    config: TrainingConfig,
    overrides: &[OverrideArg],
) -> Result<TrainingConfig, TrainingError> {
    let mut value = serde_json::to_value(config)?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }

    Ok(serde_json::from_value(value)?)
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

/// Writes `new_value` at a dot-separated path, creating objects on the way.
fn set_value_at_path(value: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments: Vec<&str> = path.split('.').map(str::trim).collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(TrainingError::configuration(format!(
            "invalid override path '{path}'"
        )));
    }

    let Some((last, parents)) = segments.split_last() else {
        return Err(TrainingError::configuration("override path must not be empty"));
    };

    let mut current = value;
    for segment in parents {
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
        let map = current.as_object_mut().ok_or_else(|| {
            TrainingError::configuration(format!(
                "override path segment '{segment}' points into a non-object value"
            ))
        })?;
        current = map.entry(segment.to_string()).or_insert(Value::Null);
    }

    if current.is_null() {
        *current = Value::Object(Map::new());
    }
    let map = current.as_object_mut().ok_or_else(|| {
        TrainingError::configuration(format!("override path '{path}' ends inside a non-object value"))
    })?;
    map.insert(last.to_string(), new_value);
    Ok(())
}

//! dagrun CLI Entry Point
//!
//! Provides command-line interface for pipeline execution.
//!
//! # Usage
//!
//! ```bash
//! # Execute a pipeline
//! dagrun pipeline.yaml --input reads=sample.fastq
//!
//! # Dry run mode (preview dispatch order)
//! dagrun pipeline.yaml --dry-run
//!
//! # Specify working directory
//! dagrun pipeline.yaml --working-dir /path/to/data
//!
//! # Set maximum parallel steps
//! dagrun pipeline.yaml --parallel 8
//! ```

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use log::{error, info};

use dagrun::execution::{Engine, ShellAdapter, StepStatus};
use dagrun::workflow::load_pipeline;
use dagrun::{Value, APP_NAME, VERSION};

/// Default pipeline file used when none is specified.
const DEFAULT_PIPELINE: &str = "pipeline.yaml";

/// Default maximum parallel steps, one per available core.
fn default_max_parallel() -> usize {
    num_cpus::get().max(1)
}

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    pipeline_path: String,
    inputs: Vec<(String, Value)>,
    dry_run: bool,
    working_dir: Option<PathBuf>,
    max_parallel: usize,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pipeline_path: DEFAULT_PIPELINE.to_string(),
            inputs: Vec::new(),
            dry_run: false,
            working_dir: None,
            max_parallel: default_max_parallel(),
            verbose: false,
        }
    }
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Workflow DAG Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: dagrun [OPTIONS] <PIPELINE_FILE>");
    println!();
    println!("Arguments:");
    println!("  <PIPELINE_FILE>     Path to pipeline YAML file");
    println!();
    println!("Options:");
    println!("  --input NAME=VALUE  Provide a workflow input (repeatable)");
    println!("  --dry-run           Preview dispatch order without executing");
    println!("  --working-dir PATH  Set working directory for file operations");
    println!("  --parallel N        Maximum parallel steps (default: {})", default_max_parallel());
    println!("  --verbose           Enable debug logging");
    println!("  --help              Show this help message");
    println!("  --version           Show version information");
    println!();
    println!("Examples:");
    println!("  dagrun pipeline.yaml --input reads=sample.fastq");
    println!("  dagrun pipeline.yaml --input 'intervals=[chr1, chr2, chr3]'");
    println!("  dagrun pipeline.yaml --working-dir /data/analysis --parallel 8");
}

/// Parses one `NAME=VALUE` input argument. The value side is YAML, so
/// sequences and numbers work as expected.
fn parse_input(spec: &str) -> Result<(String, Value), String> {
    let (name, raw) = spec
        .split_once('=')
        .ok_or_else(|| format!("Invalid input '{}', expected NAME=VALUE", spec))?;
    if name.is_empty() {
        return Err(format!("Invalid input '{}', empty name", spec));
    }
    let parsed: serde_json::Value = serde_yaml::from_str(raw)
        .map_err(|e| format!("Invalid value for input '{}': {}", name, e))?;
    Ok((name.to_string(), json_to_value(parsed)))
}

/// Maps a parsed YAML document onto a runtime value.
fn json_to_value(parsed: serde_json::Value) -> Value {
    match parsed {
        serde_json::Value::Null => Value::Unset,
        serde_json::Value::Array(items) => {
            Value::Array(items.into_iter().map(json_to_value).collect())
        }
        scalar => Value::Scalar(scalar),
    }
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positional_index = 0;
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--dry-run" => {
                config.dry_run = true;
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--input" | "-i" => {
                i += 1;
                if i >= args.len() {
                    return Err("--input requires a NAME=VALUE argument".to_string());
                }
                config.inputs.push(parse_input(&args[i])?);
            }
            "--working-dir" => {
                i += 1;
                if i >= args.len() {
                    return Err("--working-dir requires a path argument".to_string());
                }
                config.working_dir = Some(PathBuf::from(&args[i]));
            }
            "--parallel" => {
                i += 1;
                if i >= args.len() {
                    return Err("--parallel requires a number argument".to_string());
                }
                config.max_parallel = args[i]
                    .parse()
                    .map_err(|_| format!("Invalid parallel value: {}", args[i]))?;
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                match positional_index {
                    0 => config.pipeline_path = arg.clone(),
                    _ => return Err(format!("Unexpected argument: {}", arg)),
                }
                positional_index += 1;
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Validates the working directory.
fn check_working_directory(
    working_dir: &Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let Some(dir) = working_dir else {
        let current = env::current_dir()?;
        info!("Working directory: {}", current.display());
        return Ok(());
    };

    if !dir.exists() {
        return Err(format!("Working directory does not exist: {}", dir.display()).into());
    }
    if !dir.is_dir() {
        return Err(format!("Path is not a directory: {}", dir.display()).into());
    }
    info!("Working directory: {}", dir.display());
    Ok(())
}

/// Prints the per-step outcome table and workflow outputs.
fn print_report(report: &dagrun::RunReport, step_order: &[String]) {
    println!();
    println!("Run summary:");
    for step_id in step_order {
        let Some(status) = report.status(step_id) else {
            continue;
        };
        let label = match status {
            StepStatus::Completed => "completed".green(),
            StepStatus::Failed(_) => "failed".red(),
            StepStatus::Skipped => "skipped".yellow(),
            StepStatus::Cancelled => "cancelled".yellow(),
            other => other.to_string().normal(),
        };
        match report.durations.get(step_id) {
            Some(duration) if matches!(status, StepStatus::Completed | StepStatus::Failed(_)) => {
                println!("  {:<24} {} ({:.2}s)", step_id, label, duration.as_secs_f64());
            }
            _ => println!("  {:<24} {}", step_id, label),
        }
    }

    for (step_id, reason) in report.failed_steps() {
        println!("  {} {}: {}", "error".red(), step_id, reason);
    }

    if !report.outputs.is_empty() {
        println!();
        println!("Outputs:");
        let mut names: Vec<&String> = report.outputs.keys().collect();
        names.sort();
        for name in names {
            println!("  {} = {}", name, report.outputs[name].to_command_string());
        }
    }
    println!();
}

/// Main application entry point.
fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    if config.dry_run {
        info!("Mode: DRY RUN (adapters will not be invoked)");
        println!();
    }

    check_working_directory(&config.working_dir)?;

    info!("Loading pipeline: {}", config.pipeline_path);
    let pipeline = load_pipeline(&config.pipeline_path).map_err(|e| {
        error!("Failed to load pipeline: {}", e);
        format!(
            "Could not load pipeline from '{}': {}",
            config.pipeline_path, e
        )
    })?;

    info!(
        "Pipeline loaded: {} step(s), {} task(s)",
        pipeline.workflow.len(),
        pipeline.tasks.len()
    );

    let step_order: Vec<String> = pipeline.workflow.steps.iter().map(|s| s.id.clone()).collect();

    let mut adapter = ShellAdapter::new();
    if let Some(dir) = &config.working_dir {
        adapter = adapter.with_working_dir(dir);
    }

    let mut engine = Engine::new(pipeline, Arc::new(adapter));
    engine.set_max_parallel(config.max_parallel);
    engine.set_dry_run(config.dry_run);

    let inputs: HashMap<String, Value> = config.inputs.into_iter().collect();
    let report = engine.run(inputs)?;

    print_report(&report, &step_order);
    Ok(report.success())
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

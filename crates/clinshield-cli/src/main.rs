mod pipeline;
mod store;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use clinshield_core::{AnonymizerConfig, ConfigManager, LoggingConfig, RecordSink, RecordSource};
use clinshield_graph::{build_graph, GraphCalibrator, GraphMetrics};
use colored::Colorize;
use pipeline::{Pipeline, RunReport};
use serde::Serialize;
use std::path::{Path, PathBuf};
use store::JsonDirectoryStore;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "clinshield")]
#[command(about = "ClinShield - differentially private anonymization of clinical records", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ./.clinshield.toml, then ~/.clinshield/config.toml)
    #[arg(short, long, global = true, env = "CLINSHIELD_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Anonymize a directory of JSON resources
    Run {
        /// Directory of input *.json files
        #[arg(short, long)]
        input: PathBuf,

        /// Directory the anonymized resources are written to
        #[arg(short, long)]
        output: PathBuf,

        /// Master seed, overriding the configuration
        #[arg(long)]
        seed: Option<u64>,

        /// Leave the reference graph untouched
        #[arg(long)]
        skip_graph: bool,

        /// Write the run report as JSON
        #[arg(long)]
        report: Option<PathBuf>,

        /// Write graph mutation timings as JSON
        #[arg(long)]
        timings: Option<PathBuf>,
    },

    /// Write a documented configuration file
    InitConfig {
        /// Where to write the file
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Print the derived schema graph and the graph metrics of a corpus
    Inspect {
        /// Directory of input *.json files
        #[arg(short, long)]
        input: PathBuf,

        /// Output format
        #[arg(long, value_enum, default_value = "pretty")]
        format: OutputFormat,
    },
}

#[derive(Serialize)]
struct InspectResult {
    batches: usize,
    records: usize,
    schema: serde_json::Value,
    graph: serde_json::Value,
    metrics: GraphMetrics,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = execute(cli) {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn execute(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::InitConfig { path, force } => {
            init_tracing(&LoggingConfig::default(), cli.verbose);
            init_config(&path, force)
        }
        Commands::Run {
            input,
            output,
            seed,
            skip_graph,
            report,
            timings,
        } => {
            let mut config = load_config(cli.config.as_deref())?;
            if seed.is_some() {
                config.calibration.seed = seed;
            }
            init_tracing(&config.logging, cli.verbose);
            run(&config, &input, &output, skip_graph, report.as_deref(), timings.as_deref())
        }
        Commands::Inspect { input, format } => {
            let config = load_config(cli.config.as_deref())?;
            init_tracing(&config.logging, cli.verbose);
            inspect(&config, &input, &format)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<AnonymizerConfig> {
    let manager = ConfigManager::load(path).context("Failed to load configuration")?;
    Ok(manager.into_config())
}

/// Installs the global subscriber. `RUST_LOG` directives win over the
/// configured level.
fn init_tracing(logging: &LoggingConfig, verbose: bool) {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    let layer = fmt::layer().with_writer(std::io::stderr);
    let installed = match logging.format.as_str() {
        "json" => registry.with(layer.json()).try_init(),
        "compact" => registry.with(layer.compact()).try_init(),
        _ => registry.with(layer.pretty()).try_init(),
    };
    if let Err(e) = installed {
        eprintln!("{} {}", "Warning:".yellow().bold(), e);
    }
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists, pass --force to overwrite it",
            path.display()
        );
    }
    ConfigManager::create_default_config(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!(
        "{} {}",
        "Configuration written to".green(),
        path.display().to_string().cyan()
    );
    Ok(())
}

fn run(
    config: &AnonymizerConfig,
    input: &Path,
    output: &Path,
    skip_graph: bool,
    report_path: Option<&Path>,
    timings_path: Option<&Path>,
) -> Result<()> {
    let batches = JsonDirectoryStore::new(input)
        .load()
        .with_context(|| format!("Failed to read input directory {}", input.display()))?;
    if batches.is_empty() {
        anyhow::bail!("No resources found in {}", input.display());
    }

    let outcome = Pipeline::new(config, skip_graph).run(batches)?;

    JsonDirectoryStore::new(output)
        .store(&outcome.batches)
        .with_context(|| format!("Failed to write output directory {}", output.display()))?;

    if let Some(path) = report_path {
        write_json(path, &outcome.report)?;
    }
    if let Some(path) = timings_path {
        write_json(path, &outcome.timings)?;
    }

    print_summary(&outcome.report, output);
    Ok(())
}

fn inspect(config: &AnonymizerConfig, input: &Path, format: &OutputFormat) -> Result<()> {
    let batches = JsonDirectoryStore::new(input)
        .load()
        .with_context(|| format!("Failed to read input directory {}", input.display()))?;
    let batch_count = batches.len();
    let records: Vec<_> = batches.into_iter().flat_map(|b| b.records).collect();
    let record_count = records.len();

    let calibrator = GraphCalibrator::from_records(config.graph.clone(), records.iter());
    let graph = build_graph(records, calibrator.schema(), &config.graph.display_types);

    let result = InspectResult {
        batches: batch_count,
        records: record_count,
        schema: serde_json::to_value(calibrator.schema())?,
        graph: serde_json::to_value(graph.summary())?,
        metrics: GraphMetrics::measure(&graph, &config.graph.primary_type),
    };
    let value = serde_json::to_value(result)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&value)?),
        OutputFormat::Pretty => print_pretty(&value, 0),
    }
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
}

fn print_summary(report: &RunReport, output: &Path) {
    println!("{}", "Anonymization complete".green().bold());
    println!("{}: {}", "seed".cyan().bold(), report.seed.to_string().yellow());
    println!(
        "{}: {} in, {} out",
        "records".cyan().bold(),
        report.records_in.to_string().yellow(),
        report.records_out.to_string().yellow()
    );

    for numeric in &report.numeric {
        print_status(&numeric.file, numeric.converged(), numeric.iterations);
    }
    for categorical in &report.categorical {
        print_status(
            &categorical.resource_type,
            categorical.converged(),
            categorical.iterations,
        );
    }
    if let Some(graph) = &report.graph {
        print_status("reference graph", graph.converged(), graph.rounds);
        println!(
            "  {} {:.4}, {} +{} -{}, {} +{} -{}",
            "distortion".cyan(),
            graph.distortion_index,
            "nodes".cyan(),
            graph.nodes_added,
            graph.nodes_removed,
            "edges".cyan(),
            graph.edges_added,
            graph.edges_removed
        );
    }
    if let Some(repair) = &report.repair {
        println!(
            "  {} {} removed, {} added",
            "references".cyan(),
            repair.references_removed,
            repair.references_added
        );
    }
    if report.remapped_ids > 0 {
        println!("{}: {}", "remapped ids".cyan().bold(), report.remapped_ids);
    }
    println!("{}: {}", "output".cyan().bold(), output.display().to_string().green());
}

fn print_status(label: &str, converged: bool, iterations: usize) {
    let status = if converged {
        "converged".green()
    } else {
        "best effort".yellow()
    };
    println!(
        "{} {} ({} iterations)",
        label.cyan().bold(),
        status,
        iterations.to_string().yellow()
    );
}

fn print_pretty(value: &serde_json::Value, depth: usize) {
    let indent = "  ".repeat(depth);
    match value {
        serde_json::Value::Object(map) => {
            for (key, val) in map {
                let key_colored = key.cyan().bold();
                match val {
                    serde_json::Value::String(s) => {
                        println!("{}{}: {}", indent, key_colored, s.green());
                    }
                    serde_json::Value::Number(n) => {
                        println!("{}{}: {}", indent, key_colored, n.to_string().yellow());
                    }
                    serde_json::Value::Object(_) => {
                        println!("{}{}:", indent, key_colored);
                        print_pretty(val, depth + 1);
                    }
                    _ => {
                        println!("{}{}: {}", indent, key_colored, val);
                    }
                }
            }
        }
        _ => {
            println!("{}{}", indent, value);
        }
    }
}

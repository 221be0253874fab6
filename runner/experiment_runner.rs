// Experiment Runner - Load and execute experiment YAML files
//
// Usage:
//   cargo run --bin experiment_runner experiments/client_service.yaml
//   cargo run --bin experiment_runner experiments/  (runs all .yaml files in directory)
//   cargo run --bin experiment_runner experiments/pub_sub.yaml --report out.yaml
//   cargo run --bin experiment_runner experiments/pub_sub.yaml --events events.csv --seed 0x1234...

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use simple_logger::SimpleLogger;

use pt_rust::pt_events::{ConsoleEventSink, CsvEventSink, MultiEventSink};
use pt_rust::pt_memory_transport::{MemoryTransport, MemoryTransportConfig};
use pt_rust::{configure, run, write_report, ExperimentConfig, ExperimentError};

/// Experiment file format
#[derive(Debug, serde::Deserialize)]
struct ExperimentFile {
    /// Experiment metadata
    #[serde(default)]
    meta: ExperimentMeta,

    /// Experiment configuration, missing fields take the benchmark defaults
    #[serde(default)]
    config: ExperimentConfig,

    /// In-memory transport tuning
    #[serde(default)]
    transport: TransportOverrides,
}

#[derive(Debug, Default, serde::Deserialize)]
struct ExperimentMeta {
    name: Option<String>,
    description: Option<String>,
    hypothesis: Option<String>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct TransportOverrides {
    participant_discovery_delay_ms: Option<u64>,
    endpoint_discovery_delay_ms: Option<u64>,
    latency_us: Option<u64>,
    loss_fraction: Option<f64>,
}

struct RunnerArgs {
    path: PathBuf,
    report: Option<PathBuf>,
    events: Option<PathBuf>,
    seed: Option<[u8; 32]>,
}

fn main() {
    SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .unwrap();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!(
            "Usage: {} <experiment.yaml | directory/> [--report PATH] [--events PATH] [--seed SEED_HEX]",
            args[0]
        );
        eprintln!("\nExamples:");
        eprintln!("  {} experiments/client_service.yaml", args[0]);
        eprintln!("  {} experiments/", args[0]);
        eprintln!("  {} experiments/pub_sub.yaml --report pub_sub.yaml", args[0]);
        eprintln!("  {} experiments/pub_sub.yaml --seed 0x123456...", args[0]);
        std::process::exit(1);
    }

    let runner_args = parse_args(&args);
    let path = runner_args.path.as_path();

    let failures = if path.is_file() {
        usize::from(!run_experiment_file(path, &runner_args, false))
    } else if path.is_dir() {
        run_experiment_directory(path, &runner_args)
    } else {
        eprintln!("Error: Path does not exist: {}", path.display());
        std::process::exit(1);
    };

    if failures > 0 {
        std::process::exit(2);
    }
}

fn parse_args(args: &[String]) -> RunnerArgs {
    let mut runner_args = RunnerArgs {
        path: PathBuf::from(&args[1]),
        report: None,
        events: None,
        seed: None,
    };

    let mut rest = args[2..].iter();
    while let Some(flag) = rest.next() {
        let value = rest.next().unwrap_or_else(|| {
            eprintln!("Missing value for {}", flag);
            std::process::exit(1);
        });

        match flag.as_str() {
            "--report" => runner_args.report = Some(PathBuf::from(value)),
            "--events" => runner_args.events = Some(PathBuf::from(value)),
            "--seed" => runner_args.seed = Some(parse_seed_hex(value)),
            other => {
                eprintln!("Unknown argument: {}", other);
                std::process::exit(1);
            }
        }
    }

    runner_args
}

fn run_experiment_directory(dir: &Path, runner_args: &RunnerArgs) -> usize {
    let mut experiments = Vec::new();

    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if matches!(path.extension().and_then(|s| s.to_str()), Some("yaml") | Some("yml")) {
                experiments.push(path);
            }
        }
    }

    experiments.sort();

    if experiments.is_empty() {
        eprintln!("No .yaml files found in {}", dir.display());
        std::process::exit(1);
    }

    println!("\n╔════════════════════════════════════════════════════════╗");
    println!("║  EXPERIMENT RUNNER - Multiple Experiments              ║");
    println!("╚════════════════════════════════════════════════════════╝\n");
    println!("Found {} experiment(s) to run\n", experiments.len());

    let mut failures = 0;
    for (i, experiment_path) in experiments.iter().enumerate() {
        println!("\n{}/{} Running: {}\n", i + 1, experiments.len(), experiment_path.display());
        if !run_experiment_file(experiment_path, runner_args, true) {
            failures += 1;
        }
    }

    println!("\n╔════════════════════════════════════════════════════════╗");
    println!("║  All experiments complete! ({} failed)                  ", failures);
    println!("╚════════════════════════════════════════════════════════╝\n");

    failures
}

/// Returns false when the experiment could not produce a report.
fn run_experiment_file(path: &Path, runner_args: &RunnerArgs, many: bool) -> bool {
    println!("Loading experiment from: {}", path.display());

    let yaml_content = fs::read_to_string(path).unwrap_or_else(|e| {
        eprintln!("Failed to read {}: {}", path.display(), e);
        std::process::exit(1);
    });

    let experiment: ExperimentFile = match serde_yaml::from_str(&yaml_content) {
        Ok(experiment) => experiment,
        Err(e) => {
            error!("Failed to parse {}: {}", path.display(), e);
            return false;
        }
    };

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("experiment")
        .to_string();

    println!("\n╔════════════════════════════════════════════════════════╗");
    let title = experiment.meta.name.clone().unwrap_or_else(|| format!("Experiment: {}", stem));
    println!("║  {}{}║", title, " ".repeat(54_usize.saturating_sub(title.len())));
    println!("╚════════════════════════════════════════════════════════╝\n");

    if let Some(ref desc) = experiment.meta.description {
        println!("{}\n", desc);
    }

    if let Some(ref hypothesis) = experiment.meta.hypothesis {
        println!("Hypothesis:");
        println!("  {}\n", hypothesis);
    }

    let transport = build_transport(&experiment.transport, runner_args.seed);
    let config = experiment.config;

    println!("Configuration:");
    println!("  Clients: {} x {} service(s)", config.n_clients, config.n_services);
    println!("  Publishers: {}  Subscribers: {}", config.n_publishers, config.n_subscribers);
    println!("  Payload: {} ({} bytes)", config.msg_type, config.msg_type.size_bytes());
    println!("  Frequency: {} Hz", config.frequency);
    println!("  Executors: {}", if config.executors == 0 { "one per participant".to_string() } else { config.executors.to_string() });
    println!("  Duration: {}s", config.experiment_duration);
    println!("  Transport seed: {}", seed_hex(&transport.seed()));
    println!("\nWaiting for discovery...\n");

    let mut handle = match configure(config, transport) {
        Ok(handle) => handle,
        Err(e) => {
            error!("{}: {}", stem, e);
            return false;
        }
    };

    let mut sinks = MultiEventSink::new();
    sinks.add_sink(Box::new(ConsoleEventSink::new(true)));
    if let Some(ref events) = runner_args.events {
        let destination = per_experiment_path(events, &stem, "csv", many);
        match CsvEventSink::new(&destination) {
            Ok(sink) => sinks.add_sink(Box::new(sink)),
            Err(e) => error!("cannot open event log {}: {}", destination.display(), e),
        }
    }
    handle.enable_events_logger(Box::new(sinks));

    match run(&mut handle) {
        Ok(report) => report.print_summary(),
        Err(ExperimentError::DiscoveryTimeout { phase, missing }) => {
            error!("{}: discovery timed out in {} phase", stem, phase);
            for link in &missing {
                error!("  never matched: {}", link);
            }
            return false;
        }
        Err(e) => {
            error!("{}: {}", stem, e);
            return false;
        }
    }

    if let Some(ref report) = runner_args.report {
        let destination = per_experiment_path(report, &stem, "txt", many);
        match write_report(&handle, &destination) {
            Ok(()) => info!("report written to {}", destination.display()),
            Err(e) => {
                error!("{}", e);
                return false;
            }
        }
    }

    println!("\n✓ Experiment complete!\n");
    true
}

fn build_transport(overrides: &TransportOverrides, seed: Option<[u8; 32]>) -> Arc<MemoryTransport> {
    let mut config = MemoryTransportConfig {
        seed,
        ..MemoryTransportConfig::default()
    };

    if let Some(v) = overrides.participant_discovery_delay_ms {
        config.participant_discovery_delay = Duration::from_millis(v);
    }
    if let Some(v) = overrides.endpoint_discovery_delay_ms {
        config.endpoint_discovery_delay = Duration::from_millis(v);
    }
    if let Some(v) = overrides.latency_us {
        config.latency = Duration::from_micros(v);
    }
    if let Some(v) = overrides.loss_fraction {
        config.loss_fraction = v;
    }

    Arc::new(MemoryTransport::new(config))
}

/// With several experiments, `path` names a directory holding one file each.
fn per_experiment_path(path: &Path, stem: &str, extension: &str, many: bool) -> PathBuf {
    if many || path.is_dir() {
        if let Err(e) = fs::create_dir_all(path) {
            eprintln!("Failed to create {}: {}", path.display(), e);
            std::process::exit(1);
        }
        path.join(format!("{}.{}", stem, extension))
    } else {
        path.to_path_buf()
    }
}

fn parse_seed_hex(hex: &str) -> [u8; 32] {
    let hex = hex.strip_prefix("0x").unwrap_or(hex);
    let mut seed = [0u8; 32];

    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        if i >= 32 {
            break;
        }
        let parsed = std::str::from_utf8(chunk)
            .ok()
            .and_then(|byte_str| u8::from_str_radix(byte_str, 16).ok());
        seed[i] = parsed.unwrap_or_else(|| {
            eprintln!("Invalid hex seed: {}", hex);
            std::process::exit(1);
        });
    }

    seed
}

fn seed_hex(seed: &[u8; 32]) -> String {
    let digits: String = seed.iter().map(|b| format!("{:02x}", b)).collect();
    format!("0x{}", digits)
}

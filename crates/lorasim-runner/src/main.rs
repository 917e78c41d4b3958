//! # lorasim
//!
//! Command line for the LoRaWAN interference simulator.

use lorasim_runner::metrics_export::{self, InMemoryRecorder};
use lorasim_runner::{
    build_simulation, format_duration, load_scenario, EventLoop, ProgressInfo, RunnerError, SimTime,
    SimulationStats,
};

use clap::{Parser, Subcommand, ValueEnum};
use lorasim_phy::LoraTxParams;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Duration Parsing
// ============================================================================

/// Parse a duration into seconds.
///
/// Accepts a plain number of seconds (`60`), a number with a unit (`10s`,
/// `5m`, `2h`, `1d`) or combined units (`1h30m`).
fn parse_duration(s: &str) -> Result<f64, String> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<f64>() {
        return Ok(secs);
    }

    let mut total_seconds: f64 = 0.0;
    let mut current_number = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() || c == '.' {
            current_number.push(c);
            continue;
        }
        if current_number.is_empty() {
            return Err(format!("Invalid duration format: unexpected '{}' in '{}'", c, s));
        }
        let value: f64 = current_number
            .parse()
            .map_err(|_| format!("Invalid number '{}' in duration '{}'", current_number, s))?;
        let multiplier = match c {
            's' => 1.0,
            'm' => 60.0,
            'h' => 3600.0,
            'd' => 86400.0,
            _ => return Err(format!("Unknown duration unit '{}' in '{}'. Use s, m, h, or d.", c, s)),
        };
        total_seconds += value * multiplier;
        current_number.clear();
    }

    if !current_number.is_empty() {
        let value: f64 = current_number
            .parse()
            .map_err(|_| format!("Invalid number '{}' in duration '{}'", current_number, s))?;
        total_seconds += value;
    }

    if total_seconds == 0.0 && !s.is_empty() {
        return Err(format!("Invalid duration format: '{}'", s));
    }
    Ok(total_seconds)
}

// ============================================================================
// CLI Configuration
// ============================================================================

/// Output format for metrics at the end of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum MetricsOutputFormat {
    /// Aggregated JSON snapshot.
    Json,
    /// Prometheus text exposition format.
    Prometheus,
}

/// lorasim - LoRaWAN interference simulator
#[derive(Parser, Debug)]
#[command(name = "lorasim")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a simulation from a YAML scenario file
    Run(RunnerConfig),
    /// Compute the time on air of a LoRa frame
    Airtime(AirtimeConfig),
    /// List all available metrics with descriptions and labels
    Metrics,
}

/// Options of `lorasim run`.
#[derive(Parser, Debug)]
pub struct RunnerConfig {
    /// Scenario file
    pub scenario: PathBuf,

    /// Simulated duration (e.g. 3600, 10m, 1h30m); overrides the scenario
    #[arg(short, long, value_parser = parse_duration)]
    pub duration: Option<f64>,

    /// Random seed; overrides the scenario
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// Write the notification trace as JSON to this file
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Export metrics at the end of the run
    #[arg(long, value_enum)]
    pub metrics_output: Option<MetricsOutputFormat>,

    /// Metrics destination (stdout if not specified)
    #[arg(long)]
    pub metrics_file: Option<PathBuf>,

    /// Print progress and a summary table on stderr
    #[arg(short, long)]
    pub verbose: bool,
}

/// Options of `lorasim airtime`.
#[derive(Parser, Debug)]
pub struct AirtimeConfig {
    /// Spreading factor (7-12)
    #[arg(long)]
    pub sf: u8,

    /// Payload size in bytes
    #[arg(long)]
    pub payload: usize,

    /// Bandwidth in Hz
    #[arg(long, default_value = "125000")]
    pub bandwidth: u32,

    /// Coding rate 1-4 (4/5 to 4/8)
    #[arg(long, default_value = "1")]
    pub coding_rate: u8,

    /// Preamble symbols
    #[arg(long, default_value = "8")]
    pub preamble: u32,
}

// ============================================================================
// Run
// ============================================================================

fn print_summary_table(stats: &SimulationStats) {
    eprintln!();
    eprintln!(
        "┌{}┬{}┬{}┬{}┬{}┬{}┐",
        "─".repeat(18),
        "─".repeat(12),
        "─".repeat(8),
        "─".repeat(8),
        "─".repeat(8),
        "─".repeat(10)
    );
    eprintln!(
        "│ {:^16} │ {:^10} │ {:^6} │ {:^6} │ {:^6} │ {:^8} │",
        "Node", "Type", "TX", "RX", "Lost", "Acked"
    );
    eprintln!(
        "├{}┼{}┼{}┼{}┼{}┼{}┤",
        "─".repeat(18),
        "─".repeat(12),
        "─".repeat(8),
        "─".repeat(8),
        "─".repeat(8),
        "─".repeat(10)
    );
    for (name, node) in &stats.nodes {
        let lost: u64 = node.lost.values().sum();
        eprintln!(
            "│ {:16} │ {:10} │ {:>6} │ {:>6} │ {:>6} │ {:>8} │",
            name, node.role, node.tx, node.rx, lost, node.uplinks_acked
        );
    }
    eprintln!(
        "└{}┴{}┴{}┴{}┴{}┴{}┘",
        "─".repeat(18),
        "─".repeat(12),
        "─".repeat(8),
        "─".repeat(8),
        "─".repeat(8),
        "─".repeat(10)
    );
    let _ = std::io::stderr().flush();
}

/// Run a simulation with the given configuration.
pub fn run_simulation(config: &RunnerConfig) -> Result<SimulationStats, RunnerError> {
    let metrics_recorder = if config.metrics_output.is_some() {
        let recorder = InMemoryRecorder::new();
        metrics::set_global_recorder(recorder.clone())
            .map_err(|e| RunnerError::ConfigError(format!("Failed to install metrics recorder: {}", e)))?;
        lorasim_metrics::describe_metrics();
        Some(recorder)
    } else {
        None
    };

    let scenario = load_scenario(&config.scenario)?;
    let seed = config.seed.unwrap_or(scenario.simulation.seed);
    let duration_s = config.duration.unwrap_or(scenario.simulation.duration_s);
    if duration_s.is_nan() || duration_s <= 0.0 {
        return Err(RunnerError::ConfigError(format!("duration must be positive, got {}", duration_s)));
    }
    let duration = SimTime::from_secs(duration_s);
    info!(scenario = %config.scenario.display(), seed, duration_s, "loading scenario");

    let simulation = build_simulation(&scenario, seed)?;
    let trace_output: Option<Box<dyn Write>> = match &config.output {
        Some(path) => Some(Box::new(std::io::BufWriter::new(std::fs::File::create(path)?))),
        None => None,
    };
    let mut event_loop = EventLoop::new(simulation, trace_output);

    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_flag_clone = stop_flag.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        stop_flag_clone.store(true, Ordering::Relaxed);
    }) {
        warn!("cannot install Ctrl+C handler: {}", e);
    }

    let verbose = config.verbose;
    let stats = event_loop.run_with_progress(duration, Some(stop_flag), |_, progress: ProgressInfo, is_final| {
        if !verbose || is_final {
            return;
        }
        eprintln!(
            "  {:5.1}% sim {} | wall {} | {:>9} events | {:8.1}x | eta {}",
            progress.progress_percent,
            progress.sim_time,
            format_duration(progress.wall_elapsed),
            progress.events_processed,
            progress.time_multiplier,
            format_duration(progress.estimated_remaining),
        );
    })?;

    if verbose {
        print_summary_table(&stats);
        eprintln!("  Total events: {}", stats.total_events);
        eprintln!("  Uplinks sent: {}", stats.uplinks_sent);
        eprintln!("  Uplinks received: {}", stats.uplinks_received);
        eprintln!("  Delivery ratio: {:.3}", stats.delivery_ratio);
        eprintln!("  Wall time: {}ms", stats.wall_time_ms);
    }

    if let (Some(format), Some(recorder)) = (config.metrics_output, metrics_recorder) {
        let mut writer: Box<dyn Write> = match &config.metrics_file {
            Some(path) => Box::new(std::fs::File::create(path)?),
            None => Box::new(std::io::stdout()),
        };
        match format {
            MetricsOutputFormat::Json => metrics_export::export_json(&recorder.snapshot(), &mut writer)?,
            MetricsOutputFormat::Prometheus => metrics_export::export_prometheus(&recorder, &mut writer)?,
        }
        writer.flush()?;
        if let Some(ref path) = config.metrics_file {
            info!(path = %path.display(), "metrics exported");
        }
    }

    Ok(stats)
}

fn airtime_command(config: &AirtimeConfig) -> Result<(), RunnerError> {
    if !(7..=12).contains(&config.sf) {
        return Err(RunnerError::ConfigError(format!(
            "spreading factor must be 7..=12, got {}",
            config.sf
        )));
    }
    if !(1..=4).contains(&config.coding_rate) {
        return Err(RunnerError::ConfigError(format!(
            "coding rate must be 1..=4, got {}",
            config.coding_rate
        )));
    }
    let params = LoraTxParams {
        bandwidth_hz: config.bandwidth,
        coding_rate: config.coding_rate,
        preamble_symbols: config.preamble,
        ..LoraTxParams::with_sf(config.sf)
    };
    let out = serde_json::json!({
        "spreading_factor": params.spreading_factor,
        "bandwidth_hz": params.bandwidth_hz,
        "coding_rate": format!("4/{}", params.coding_rate + 4),
        "payload_bytes": config.payload,
        "symbol_duration_ms": params.symbol_duration_s() * 1e3,
        "preamble_duration_ms": params.preamble_duration_s() * 1e3,
        "payload_symbols": params.payload_symbol_count(config.payload),
        "low_data_rate_optimize": params.ldro_enabled(),
        "time_on_air_ms": params.on_air_time_s(config.payload) * 1e3,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

fn main() -> Result<(), RunnerError> {
    // RUST_LOG, warn by default
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(config) => {
            let stats = run_simulation(&config)?;
            // stdout carries the metrics instead when they are not written to a file
            if config.metrics_output.is_none() || config.metrics_file.is_some() {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
        }
        Commands::Airtime(config) => airtime_command(&config)?,
        Commands::Metrics => print_metrics_info(),
    }
    Ok(())
}

/// Print every metric definition, grouped by layer.
fn print_metrics_info() {
    use lorasim_metrics::metric_defs;

    println!("lorasim metrics");
    println!("===============\n");
    println!("All metrics carry the labels:");
    println!("  - node: node name from the scenario");
    println!("  - node_type: end_device, gateway, jammer, network_server or channel");
    println!();

    let categories = [
        ("Physical layer", "lorasim.phy."),
        ("Gateway", "lorasim.gateway."),
        ("Energy", "lorasim.energy."),
        ("MAC", "lorasim.mac."),
        ("Jammer", "lorasim.jammer."),
        ("Network server", "lorasim.server."),
        ("Timing", "lorasim.timing."),
    ];
    for (category_name, prefix) in categories {
        println!("## {}\n", category_name);
        for metric in metric_defs::ALL.iter().filter(|m| m.name.starts_with(prefix)) {
            println!("  {}", metric.name);
            println!("    Type: {}", metric.kind);
            let unit_str = metric.unit_str();
            if !unit_str.is_empty() {
                println!("    Unit: {}", unit_str);
            }
            println!("    Description: {}", metric.description);
            if !metric.labels.is_empty() {
                println!("    Extra labels: {}", metric.labels.join(", "));
            }
            println!();
        }
    }

    println!("## Usage\n");
    println!("  lorasim run scenarios/single_gateway.yaml --duration 1h --metrics-output json --metrics-file metrics.json");
    println!("  lorasim run scenarios/jammed.yaml --metrics-output prometheus");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_run() {
        let cli = Cli::try_parse_from([
            "lorasim",
            "run",
            "scenario.yaml",
            "--duration",
            "1h30m",
            "--seed",
            "7",
            "--metrics-output",
            "prometheus",
        ])
        .unwrap();
        let Commands::Run(config) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(config.scenario, PathBuf::from("scenario.yaml"));
        assert_eq!(config.duration, Some(5400.0));
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.metrics_output, Some(MetricsOutputFormat::Prometheus));
        assert!(config.output.is_none());
    }

    #[test]
    fn test_cli_parse_airtime_defaults() {
        let cli = Cli::try_parse_from(["lorasim", "airtime", "--sf", "12", "--payload", "20"]).unwrap();
        let Commands::Airtime(config) = cli.command else {
            panic!("expected airtime");
        };
        assert_eq!(config.bandwidth, 125_000);
        assert_eq!(config.coding_rate, 1);
        assert_eq!(config.preamble, 8);
    }

    #[test]
    fn test_cli_rejects_bad_duration() {
        assert!(Cli::try_parse_from(["lorasim", "run", "s.yaml", "--duration", "10x"]).is_err());
    }

    #[test]
    fn test_airtime_rejects_sf() {
        let config = AirtimeConfig {
            sf: 6,
            payload: 10,
            bandwidth: 125_000,
            coding_rate: 1,
            preamble: 8,
        };
        assert!(matches!(airtime_command(&config), Err(RunnerError::ConfigError(_))));
    }

    #[test]
    fn test_parse_duration_plain_seconds() {
        assert_eq!(parse_duration("60").unwrap(), 60.0);
        assert_eq!(parse_duration("0.5").unwrap(), 0.5);
    }

    #[test]
    fn test_parse_duration_with_units() {
        assert_eq!(parse_duration("60s").unwrap(), 60.0);
        assert_eq!(parse_duration("10m").unwrap(), 600.0);
        assert_eq!(parse_duration("2h").unwrap(), 7200.0);
        assert_eq!(parse_duration("1d").unwrap(), 86400.0);
    }

    #[test]
    fn test_parse_duration_combined() {
        assert_eq!(parse_duration("1h30m").unwrap(), 5400.0);
        assert_eq!(parse_duration("1d2h30m45s").unwrap(), 95445.0);
        assert_eq!(parse_duration("1.5h").unwrap(), 5400.0);
    }

    #[test]
    fn test_parse_duration_errors() {
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("h10").is_err());
    }
}

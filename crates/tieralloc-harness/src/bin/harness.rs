//! CLI entrypoint for the tieralloc verification harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tieralloc_harness::structured_log::{
    validate_log_file, ArtifactIndex, LogEmitter, LogEntry, LogLevel, Outcome, StreamKind,
};
use tieralloc_harness::{stress, Scenario, StressConfig};

/// Scenario, stress and log tooling for tieralloc.
#[derive(Debug, Parser)]
#[command(name = "tieralloc-harness")]
#[command(about = "Verification harness for the tieralloc allocator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one scenario, or all of them.
    Scenario {
        /// Scenario name (e.g. "tier_routing"), or "all".
        #[arg(long, default_value = "all")]
        name: String,
        #[arg(long, default_value_t = 1)]
        seed: u64,
        /// Structured JSONL log path.
        #[arg(long)]
        log: Option<PathBuf>,
        /// Artifact index JSON path; requires --log.
        #[arg(long)]
        artifact_index: Option<PathBuf>,
    },
    /// Hammer one context from several threads.
    Stress {
        #[arg(long, default_value_t = 4)]
        threads: usize,
        #[arg(long, default_value_t = 10_000)]
        ops: usize,
        #[arg(long, default_value_t = 0x5EED)]
        seed: u64,
        #[arg(long, default_value_t = 64 * 1024)]
        max_size: usize,
        #[arg(long, default_value_t = 10)]
        root_percent: u32,
        /// Use an embedded pool of this many bytes.
        #[arg(long)]
        embedded_pool: Option<usize>,
        /// Output JSON report path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Check a JSONL log against the structured-log schema.
    ValidateLog {
        #[arg(long)]
        log: PathBuf,
    },
}

fn run_id() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!("run-{secs}-{}", std::process::id())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Scenario {
            name,
            seed,
            log,
            artifact_index,
        } => {
            let selected: Vec<Scenario> = if name == "all" {
                Scenario::ALL.to_vec()
            } else {
                vec![Scenario::from_name(&name)
                    .ok_or_else(|| format!("Unknown scenario '{name}'"))?]
            };
            if artifact_index.is_some() && log.is_none() {
                return Err("--artifact-index requires --log".into());
            }
            let run = run_id();
            let mut emitter = match &log {
                Some(path) => Some(LogEmitter::to_file(path, "scenario", &run)?),
                None => None,
            };

            let mut failed = Vec::new();
            for scenario in selected {
                if let Some(emitter) = emitter.as_mut() {
                    emitter.emit_entry(
                        LogEntry::new("", LogLevel::Info, "scenario_start")
                            .with_stream(StreamKind::Scenario)
                            .with_case(scenario.name())
                            .with_seed(seed),
                    )?;
                }
                let report = scenario.run(seed)?;
                let status = if report.passed() { "PASS" } else { "FAIL" };
                eprintln!(
                    "{status} {} (seed={seed}, {} checks, {} ms)",
                    report.name,
                    report.checks.len(),
                    report.duration_ms
                );
                for label in report.failures() {
                    eprintln!("  failed: {label}");
                }
                if let Some(emitter) = emitter.as_mut() {
                    let level = if report.passed() {
                        LogLevel::Info
                    } else {
                        LogLevel::Error
                    };
                    emitter.emit_entry(
                        LogEntry::new("", level, "scenario_end")
                            .with_stream(StreamKind::Scenario)
                            .with_case(report.name)
                            .with_seed(seed)
                            .with_outcome(report.outcome)
                            .with_duration_ms(report.duration_ms)
                            .with_details(serde_json::to_value(&report)?),
                    )?;
                }
                if report.outcome != Outcome::Pass {
                    failed.push(report.name);
                }
            }

            if let Some(mut emitter) = emitter {
                emitter.flush()?;
            }
            if let (Some(log), Some(index_path)) = (log, artifact_index) {
                let mut index = ArtifactIndex::new(&run);
                index.add_file(&log, "structured_log")?;
                std::fs::write(&index_path, index.to_json()?)?;
                eprintln!("Wrote artifact index to {}", index_path.display());
            }
            if !failed.is_empty() {
                return Err(format!("{} scenario(s) failed: {}", failed.len(), failed.join(", ")).into());
            }
        }
        Command::Stress {
            threads,
            ops,
            seed,
            max_size,
            root_percent,
            embedded_pool,
            output,
        } => {
            let config = StressConfig {
                threads,
                ops_per_thread: ops,
                seed,
                max_size,
                root_percent,
                embedded_pool,
                ..StressConfig::default()
            };
            eprintln!("Stressing with {threads} threads x {ops} ops (seed={seed})");
            let report = stress::run(&config)?;
            let json = serde_json::to_string_pretty(&serde_json::json!({
                "config": config,
                "report": report,
            }))?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)?;
                    eprintln!("Wrote stress report to {}", path.display());
                }
                None => println!("{json}"),
            }
            eprintln!(
                "{} ops in {:.1} ms ({:.0} ops/s), {} refused",
                report.ops,
                report.elapsed_ns as f64 / 1e6,
                report.ops_per_sec,
                report.failures
            );
            if !report.clean() {
                return Err(format!(
                    "stress run not clean: overwrites={} buddy_consistent={} bytes_in_use={}",
                    report.overwrites, report.buddy_consistent, report.metrics.bytes_in_use
                )
                .into());
            }
        }
        Command::ValidateLog { log } => {
            let (lines, errors) = validate_log_file(&log)?;
            for err in &errors {
                eprintln!("{err}");
            }
            eprintln!("{lines} line(s), {} error(s)", errors.len());
            if !errors.is_empty() {
                return Err(format!("{} failed validation", log.display()).into());
            }
        }
    }

    Ok(())
}

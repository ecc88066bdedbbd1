use std::path::PathBuf;

use tieralloc_harness::structured_log::{
    validate_log_file, ArtifactIndex, LogEmitter, LogEntry, LogLevel, StreamKind,
};
use tieralloc_harness::{stress, Scenario, StressConfig};

fn unique_path(prefix: &str, suffix: &str) -> PathBuf {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    std::env::temp_dir().join(format!("{prefix}-{}-{nanos}{suffix}", std::process::id()))
}

#[test]
fn every_scenario_passes_across_seeds() {
    for seed in [1u64, 7, 0x5EED] {
        for scenario in Scenario::ALL {
            let report = scenario
                .run(seed)
                .unwrap_or_else(|e| panic!("seed={seed} scenario={}: {e}", scenario.name()));
            assert!(
                report.passed(),
                "seed={seed} scenario={}: {:?}",
                scenario.name(),
                report.failures().collect::<Vec<_>>()
            );
            assert!(!report.checks.is_empty(), "seed={seed} scenario={}", scenario.name());
        }
    }
}

#[test]
fn reports_serialize_with_metrics() {
    let report = Scenario::DoubleFree.run(3).unwrap();
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["name"], "double_free");
    assert_eq!(json["outcome"], "pass");
    assert_eq!(json["metrics"]["double_frees_ignored"], 3);
}

#[test]
fn embedded_stress_run_is_clean() {
    let report = stress::run(&StressConfig {
        threads: 3,
        ops_per_thread: 1_500,
        max_size: 8_192,
        embedded_pool: Some(1 << 20),
        ..StressConfig::default()
    })
    .unwrap();
    assert!(report.clean(), "{report:?}");
    assert_eq!(report.allocs, report.frees);
    assert!(report.metrics.buddy_hits > 0);
    assert_eq!(report.metrics.pocket_hits + report.metrics.bump_hits, 0);
}

#[test]
fn emitted_log_validates_and_is_indexed() {
    let log = unique_path("tieralloc-log", ".jsonl");
    let index_path = unique_path("tieralloc-index", ".json");
    {
        let mut emitter = LogEmitter::to_file(&log, "scenario", "run-test").unwrap();
        for scenario in [Scenario::TierRouting, Scenario::RootReclaim] {
            let report = scenario.run(11).unwrap();
            emitter
                .emit_entry(
                    LogEntry::new("", LogLevel::Info, "scenario_end")
                        .with_stream(StreamKind::Scenario)
                        .with_case(report.name)
                        .with_seed(11)
                        .with_outcome(report.outcome)
                        .with_details(serde_json::to_value(&report).unwrap()),
                )
                .unwrap();
        }
        emitter.flush().unwrap();
    }
    let (lines, errors) = validate_log_file(&log).unwrap();
    assert_eq!(lines, 2);
    assert!(errors.is_empty(), "{errors:?}");

    let mut index = ArtifactIndex::new("run-test");
    index.add_file(&log, "structured_log").unwrap();
    std::fs::write(&index_path, index.to_json().unwrap()).unwrap();
    assert!(index.verify().is_empty());
    assert_eq!(index.artifacts[0].sha256.len(), 64);

    std::fs::write(&log, "tampered\n").unwrap();
    assert_eq!(index.verify().len(), 1);
    let (_, errors) = validate_log_file(&log).unwrap();
    assert_eq!(errors[0].field, "<json>");

    let _ = std::fs::remove_file(&log);
    let _ = std::fs::remove_file(&index_path);
}

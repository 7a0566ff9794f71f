//! End-to-end session behavior over replayed and synthetic sensor feeds.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use breath_session_agent::{
    core::{DetectorConfig, SessionStatus, PLATEAUS_PER_SESSION},
    source::{
        GuardedSource, MockProfile, MockSource, PortRegistry, ReplaySource, SampleSource,
        SourceError,
    },
    store::{JsonFileStore, MemoryStore, SessionStore},
    CancelFlag, Config, SessionError, SessionRecord, SessionRunner, SessionSupervisor,
};
use serde_json::Value;

fn config(threshold: f64, delta: f64) -> Config {
    Config {
        detector: DetectorConfig {
            stability_threshold_ppm: threshold,
            min_plateau_delta_ppm: delta,
            ..DetectorConfig::default()
        },
        ..Config::default()
    }
}

fn replay(lines: &[String]) -> ReplaySource<Cursor<Vec<u8>>> {
    let mut text = lines.join("\n");
    text.push('\n');
    ReplaySource::new(Cursor::new(text.into_bytes()), "capture")
}

fn run_lines(config: Config, lines: &[String]) -> SessionRecord {
    let runner = SessionRunner::new(config, Arc::new(MemoryStore::new()));
    runner.run_with_source("user-1", &mut replay(lines), &CancelFlag::new())
}

/// Ten readings at each of 900, 850, 800, 750 ppm.
fn staircase() -> Vec<String> {
    [900, 850, 800, 750]
        .iter()
        .flat_map(|level| std::iter::repeat(format!("{level},45.0")).take(10))
        .collect()
}

#[test]
fn test_staircase_completes_with_four_plateaus() {
    let record = run_lines(config(2.0, 20.0), &staircase());

    assert_eq!(record.status, SessionStatus::Completed);
    let values: Vec<f64> = record.plateaus.iter().map(|p| p.co2_value).collect();
    assert_eq!(values, vec![900.0, 850.0, 800.0, 750.0]);
    assert!(record.plateaus.iter().all(|p| p.humidity_value == 45.0));
}

#[test]
fn test_noisy_staircase_stops_at_the_fourth_plateau() {
    // +/-1 ppm jitter on every level, and a fifth level the session must not read
    let values: Vec<f64> = [900.0, 850.0, 800.0, 750.0, 700.0]
        .iter()
        .flat_map(|level| std::iter::repeat(*level).take(10))
        .enumerate()
        .map(|(i, level)| if i % 2 == 0 { level + 1.0 } else { level - 1.0 })
        .collect();
    let lines: Vec<String> = values.iter().map(|co2| format!("{co2},45.0")).collect();

    let record = run_lines(config(2.0, 20.0), &lines);

    assert_eq!(record.status, SessionStatus::Completed);
    assert_eq!(record.sample_count(), 36);
    assert_eq!(record.raw_co2, values[..36]);

    let indices: Vec<usize> = record.plateaus.iter().map(|p| p.sample_index).collect();
    assert_eq!(indices, vec![5, 17, 25, 35]);
    for (plateau, level) in record.plateaus.iter().zip([900.0, 850.0, 800.0, 750.0]) {
        assert!((plateau.co2_value - level).abs() <= 1.0, "{plateau:?}");
    }
}

#[test]
fn test_raw_curves_stay_paired() {
    let mut expected = Vec::new();
    let lines: Vec<String> = (0..60)
        .map(|i| {
            if i % 7 == 3 {
                "garbage".to_string()
            } else {
                let (co2, hum) = (800 + (i * 37) % 200, 40 + i % 10);
                expected.push((co2 as f64, hum as f64));
                format!("{co2},{hum}")
            }
        })
        .collect();
    let record = run_lines(config(2.0, 20.0), &lines);

    assert_eq!(record.raw_co2.len(), record.raw_humidity.len());
    let recorded: Vec<(f64, f64)> = record
        .raw_co2
        .iter()
        .copied()
        .zip(record.raw_humidity.iter().copied())
        .collect();
    assert_eq!(recorded, expected[..record.sample_count()]);
    assert!(record
        .rejected_lines
        .iter()
        .all(|r| r.line == "garbage" && r.raw_position <= record.sample_count()));
}

#[test]
fn test_completed_iff_four_increasing_indices() {
    let completed = run_lines(config(2.0, 20.0), &staircase());
    assert_eq!(completed.plateaus.len(), PLATEAUS_PER_SESSION);
    assert!(completed
        .plateaus
        .windows(2)
        .all(|w| w[0].sample_index < w[1].sample_index));

    // Only three levels: never completes
    let short: Vec<String> = staircase().into_iter().take(30).collect();
    let partial = run_lines(config(2.0, 20.0), &short);
    assert_ne!(partial.status, SessionStatus::Completed);
    assert!(partial.plateaus.len() < PLATEAUS_PER_SESSION);
}

#[test]
fn test_never_stable_stream_times_out_with_every_sample() {
    let mut cfg = config(2.0, 20.0);
    cfg.detector.max_samples_without_plateau = 40;

    // Climbs 25 ppm per reading: adjacent blocks always differ by 75 ppm
    let lines: Vec<String> = (0..100).map(|i| format!("{},50", 500 + i * 25)).collect();
    let record = run_lines(cfg, &lines);

    assert_eq!(record.status, SessionStatus::TimedOut);
    assert!(record.plateaus.is_empty());
    assert_eq!(record.sample_count(), 40);
    let expected: Vec<f64> = (0..40).map(|i| (500 + i * 25) as f64).collect();
    assert_eq!(record.raw_co2, expected);
}

#[test]
fn test_flat_signal_yields_only_a_baseline() {
    let mut cfg = config(2.0, 20.0);
    cfg.detector.max_samples_without_plateau = 80;

    let lines: Vec<String> = (0..200).map(|_| "900,45".to_string()).collect();
    let record = run_lines(cfg, &lines);

    assert_eq!(record.status, SessionStatus::TimedOut);
    assert_eq!(record.plateaus.len(), 1);
    assert_eq!(record.plateaus[0].co2_value, 900.0);
}

#[test]
fn test_malformed_lines_do_not_shift_detection() {
    let clean = run_lines(config(2.0, 20.0), &staircase());

    let mut noisy = Vec::new();
    for (i, line) in staircase().into_iter().enumerate() {
        noisy.push(line);
        if i % 4 == 1 {
            noisy.push("12a4,45".to_string());
        }
        if i % 9 == 0 {
            noisy.push("900;45".to_string());
        }
    }
    let dirty = run_lines(config(2.0, 20.0), &noisy);

    assert_eq!(dirty.status, SessionStatus::Completed);
    assert_eq!(dirty.plateaus, clean.plateaus);
    assert_eq!(dirty.raw_co2, clean.raw_co2);
    assert!(!dirty.rejected_lines.is_empty());
    assert!(dirty
        .rejected_lines
        .windows(2)
        .all(|w| w[0].seq < w[1].seq));
}

#[test]
fn test_out_of_range_readings_stay_in_the_curve() {
    let mut lines = staircase();
    lines.insert(12, "-5,45".to_string());
    lines.insert(13, "900,140".to_string());

    let record = run_lines(config(2.0, 20.0), &lines);

    assert_eq!(record.status, SessionStatus::Completed);
    assert_eq!(record.raw_co2[12], -5.0);
    assert_eq!(record.raw_humidity[13], 140.0);
    let values: Vec<f64> = record.plateaus.iter().map(|p| p.co2_value).collect();
    assert_eq!(values, vec![900.0, 850.0, 800.0, 750.0]);
}

#[test]
fn test_completion_preserves_manual_fields() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonFileStore::open(dir.path()).unwrap());

    store
        .set_manual_field("user-1", "weight_kg", Value::from(68.0))
        .unwrap();
    store
        .set_manual_field("user-1", "notes", Value::from("fasted"))
        .unwrap();

    let runner = SessionRunner::new(config(2.0, 20.0), store.clone());
    let record = runner.run_with_source("user-1", &mut replay(&staircase()), &CancelFlag::new());
    assert_eq!(record.status, SessionStatus::Completed);

    let doc = store.get_measurements("user-1").unwrap().unwrap();
    assert_eq!(doc.values["weight_kg"], Value::from(68.0));
    assert_eq!(doc.values["notes"], Value::from("fasted"));
    for (n, expected) in [(1, 900.0), (2, 850.0), (3, 800.0), (4, 750.0)] {
        assert_eq!(doc.values[&format!("co2_{n}")], Value::from(expected));
        assert_eq!(doc.values[&format!("hum_{n}")], Value::from(45.0));
    }
    assert!(doc.co2_updated_at.is_some());

    let latest = store.get_latest_session("user-1").unwrap().unwrap();
    assert_eq!(latest.session_id, record.session_id);
    assert_eq!(latest.status, SessionStatus::Completed);
}

#[test]
fn test_failed_session_leaves_measurements_alone() {
    let store = Arc::new(MemoryStore::new());
    store
        .set_manual_field("user-1", "weight_kg", Value::from(68.0))
        .unwrap();

    let runner = SessionRunner::new(config(2.0, 20.0), store.clone());
    let short: Vec<String> = staircase().into_iter().take(15).collect();
    let record = runner.run_with_source("user-1", &mut replay(&short), &CancelFlag::new());

    assert_eq!(record.status, SessionStatus::Failed);
    let stored = store.get_latest_session("user-1").unwrap().unwrap();
    assert_eq!(stored.sample_count(), 15);
    assert!(!stored.plateaus.is_empty());

    let doc = store.get_measurements("user-1").unwrap().unwrap();
    assert_eq!(doc.values.len(), 1);
    assert!(doc.co2_updated_at.is_none());
}

#[tokio::test]
async fn test_concurrent_logins_run_exactly_one_session() {
    let ports = PortRegistry::new();
    let store = Arc::new(MemoryStore::new());
    let runner = Arc::new(
        SessionRunner::new(Config::default(), store.clone()).with_ports(ports.clone()),
    );

    // Paced so the first session is still running when the others arrive
    let factory_ports = ports.clone();
    let factory = move || -> Result<Box<dyn SampleSource>, SourceError> {
        let guard = factory_ports.acquire("/dev/ttyACM0")?;
        let source = MockSource::new(MockProfile::Random).with_interval(Duration::from_millis(20));
        Ok(Box::new(GuardedSource::new(source, guard)))
    };
    let supervisor = SessionSupervisor::new(
        runner,
        Arc::new(factory),
        tokio::runtime::Handle::current(),
    );

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let supervisor = supervisor.clone();
            std::thread::spawn(move || supervisor.submit("user-1"))
        })
        .collect();
    let results: Vec<Result<_, SessionError>> =
        handles.into_iter().map(|h| h.join().unwrap()).collect();

    let accepted: Vec<_> = results.into_iter().filter_map(Result::ok).collect();
    assert_eq!(accepted.len(), 1);
    assert_eq!(supervisor.active_users(), vec!["user-1".to_string()]);

    supervisor.shutdown();
    let ticket = accepted.into_iter().next().unwrap();
    let record = ticket.wait().await.unwrap();
    assert_eq!(record.status, SessionStatus::Failed);
    assert_eq!(record.failure_reason.as_deref(), Some("cancelled"));

    assert_eq!(
        store.get_latest_session("user-1").unwrap().unwrap().session_id,
        record.session_id
    );
    assert!(!ports.is_held("/dev/ttyACM0"));
    assert!(supervisor.active_users().is_empty());
}

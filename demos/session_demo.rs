//! Demonstration of a full breathing session without hardware.
//!
//! This example shows how to:
//! 1. Drive a synthetic CO2 sensor through the session runner
//! 2. Watch the baseline and plateaus as they are detected
//! 3. Read back the stored session and the measurement document
//!
//! Run with: cargo run --example session_demo
//!
//! Set RUST_LOG=debug to see rejected plateau candidates.

use std::sync::Arc;

use breath_session_agent::{
    audit::create_shared_log,
    store::{MemoryStore, SessionStore},
    CancelFlag, Config, MockProfile, MockSource, SessionRunner,
};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    println!("Breath Session Agent - Session Demo");
    println!("===================================");
    println!();

    let store = Arc::new(MemoryStore::new());
    let log = create_shared_log();
    let runner = SessionRunner::new(Config::default(), store.clone()).with_log(log.clone());

    // Someone already typed their weight in by hand
    if let Err(e) = store.set_manual_field("demo-user", "weight_kg", 72.5.into()) {
        eprintln!("Could not set manual field: {e}");
        return;
    }

    // Unpaced and seeded, so the demo finishes instantly and reproducibly
    let mut source = MockSource::new(MockProfile::default()).with_seed(42);
    let record = runner.run_with_source("demo-user", &mut source, &CancelFlag::new());

    println!();
    println!("Session {} finished: {}", record.session_id, record.status);
    println!("  Samples recorded: {}", record.sample_count());
    for (i, plateau) in record.plateaus.iter().enumerate() {
        println!(
            "  #{i}: {:>7.1} ppm  {:>5.1} %RH  at sample {}",
            plateau.co2_value, plateau.humidity_value, plateau.sample_index
        );
    }

    println!();
    match store.get_measurements("demo-user") {
        Ok(Some(doc)) => match serde_json::to_string_pretty(&doc) {
            Ok(json) => println!("Measurement document:\n{json}"),
            Err(e) => eprintln!("Could not render measurements: {e}"),
        },
        Ok(None) => println!("No measurement document written"),
        Err(e) => eprintln!("Store error: {e}"),
    }

    println!();
    println!("{}", log.summary());
}

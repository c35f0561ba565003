//! Full protocol walkthrough against the built-in device simulator
//!
//! Runs the whole configuration lifecycle without hardware: plain write,
//! key/ACL provisioning, lock, signed write, induced verification mismatch,
//! and restart with reconnect.
//!
//! Usage:
//!   RUST_LOG=muxlink_core=debug cargo run --example sim_tour

use muxlink_core::prelude::*;
use muxlink_core::sim::{Fragmentation, SimConfig, SimDevice};
use serde_json::json;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), ProtocolError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let device = SimDevice::new(SimConfig {
        serial_number: "SIM-TOUR-01".into(),
        // Chop responses into tiny frames to show reassembly at work
        fragment: Fragmentation::Random { seed: 1, max: 8 },
        ..SimConfig::default()
    });

    let mut config = SessionConfig::default();
    config.settle_delay = Duration::from_millis(10);
    config.reconnect_delay = Duration::from_millis(50);

    println!("Connecting to simulator...");
    let mut session = Session::connect(
        Box::new(device.transport()),
        config,
        Box::new(JsonInfoCodec),
    )?;
    println!("  lock state: {:?}", session.lock_state());

    println!("\nPlain write while unlocked");
    let doc = SettingsDocument::new().with("app/brightness", 25);
    session.write(doc.clone(), true)?;
    session.verify(&doc)?;
    println!("  app/brightness = 25, verified");

    println!("\nProvisioning key slot 0 with an all-access ACL");
    let key = AuthKey::from_bytes(&[0x42; 32])?;
    session.store_key(0, key, AclVector::all())?;
    println!("  key stored, state: {:?}", session.lock_state());

    println!("\nLocking the device");
    session.lock()?;
    println!("  locked: {:?}", session.lock_state());

    println!("\nSigned write to the locked device");
    let doc = SettingsDocument::new().with("app/brightness", 5);
    session.write_verified(doc, true)?;
    println!(
        "  wrote app/brightness = 5 signed with serial {}",
        session.serial_number()?
    );

    println!("\nProvoking a verification mismatch");
    device.force_value("app/brightness", json!(30));
    let doc = SettingsDocument::new().with("app/brightness", 5);
    match session.verify(&doc) {
        Err(err) => println!("  as expected: {}", err),
        Ok(()) => println!("  unexpected: verification passed"),
    }

    println!("\nRestarting the device");
    session.restart()?;
    session.reconnect(|| Ok(Box::new(device.transport()) as Box<dyn Transport>))?;
    println!("  reconnected, lock state: {:?}", session.lock_state());

    let doc = SettingsDocument::new().with("app/brightness", 5);
    session.verify(&doc)?;
    println!("  settings persisted across restart");

    let counters = session.counters();
    println!(
        "\nDone. {} frames sent, {} received since reconnect.",
        counters.frames_sent, counters.frames_received
    );
    Ok(())
}

//! Device provisioning and lock tool
//!
//! Connects to a real device over a serial port, stores a freshly generated
//! authentication key with an all-access ACL in slot 0, locks the device,
//! and confirms the lock with a signed test write. Prints the key in base64;
//! keep it, the device will only accept signed writes from now on.
//!
//! The firmware-info exchange here uses the JSON codec; devices with a
//! binary info schema need their own `InfoCodec` implementation.
//!
//! Usage:
//!   cargo run --example lock_device -- [OPTIONS]
//!
//! Options:
//!   --port PORT       Serial port (default: first detected)
//!   --baud RATE       Baud rate (default: 115200)
//!   --dry-run         Stop before storing the key

use muxlink_core::prelude::*;
use muxlink_core::transport::serial::{list_ports, open_port};
use rand::RngCore;
use std::env;
use std::process;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut port_name: Option<String> = None;
    let mut baud: u32 = DEFAULT_BAUD_RATE;
    let mut dry_run = false;

    let args: Vec<String> = env::args().skip(1).collect();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--port" => {
                i += 1;
                port_name = args.get(i).cloned();
            }
            "--baud" => {
                i += 1;
                baud = args
                    .get(i)
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_BAUD_RATE);
            }
            "--dry-run" => dry_run = true,
            other => {
                eprintln!("Unknown option: {}", other);
                process::exit(2);
            }
        }
        i += 1;
    }

    let port_name = port_name.unwrap_or_else(|| {
        let ports = list_ports();
        match ports.first() {
            Some(info) => {
                println!("Auto-selected port: {}", info.name);
                info.name.clone()
            }
            None => {
                eprintln!("No serial ports found, pass --port");
                process::exit(1);
            }
        }
    });

    println!("Opening {} at {} baud", port_name, baud);
    let port = match open_port(&port_name, Some(baud)) {
        Ok(port) => port,
        Err(e) => {
            eprintln!("Failed to open port: {}", e);
            process::exit(1);
        }
    };

    let result = run(
        Box::new(SerialTransport::new(port)),
        dry_run,
    );
    if let Err(e) = result {
        eprintln!("Failed: {}", e);
        process::exit(1);
    }
}

fn run(transport: Box<dyn Transport>, dry_run: bool) -> Result<(), ProtocolError> {
    let mut session = Session::connect(transport, SessionConfig::default(), Box::new(JsonInfoCodec))?;
    println!("Connected, lock state: {:?}", session.lock_state());

    let current = session.read()?;
    println!("Device reports {} settings paths", current.len());

    if session.lock_state() == LockState::Locked {
        println!("Device is already locked, nothing to do.");
        return Ok(());
    }
    if dry_run {
        println!("Dry run, stopping before key provisioning.");
        return Ok(());
    }

    let mut key_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key_bytes);
    let key = AuthKey::from_bytes(&key_bytes)?;
    println!("Generated key for slot 0 (KEEP THIS): {}", key.encode());

    session.store_key(0, key, AclVector::all())?;
    println!("Key and ACL stored and verified.");

    session.lock()?;
    println!("Device locked.");

    // Signed round trip proves the stored key works
    let probe = SettingsDocument::new().with("app/lock_probe", 1);
    session.write_verified(probe, false)?;
    println!("Signed test write verified, serial {}", session.serial_number()?);
    Ok(())
}

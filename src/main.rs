//! Interactive command-line driver for bio-impedance devices.
//!
//! Usage:
//!   cargo run --bin bioz               # scan for a BIOZ* device over BLE
//!   cargo run --bin bioz -- --simulate # use the built-in simulated device

use std::io::{self, BufRead};

use anyhow::Result;
use log::{error, info};
use serde_json::{json, Map, Value};

use bioz_rs::ble::{BleConfig, BleLink};
use bioz_rs::client::{BiozClient, BiozHandle};
use bioz_rs::protocol::{MeasurementRequest, DEFAULT_REPETITION_COUNT};
use bioz_rs::session::SessionConfig;
use bioz_rs::sim::{spawn_simulator, SimConfig};
use bioz_rs::transport::channel_link;
use bioz_rs::types::{MeasurementResults, SessionEvent};

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=bioz_rs=debug cargo run --bin bioz
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let simulate = std::env::args().skip(1).any(|a| a == "--simulate");

    // ── Connect ───────────────────────────────────────────────────────────────
    let client = BiozClient::new(SessionConfig::default());
    let (mut rx, handle) = if simulate {
        info!("Starting simulated device …");
        let (transport, device, link) = channel_link(512);
        spawn_simulator(device, SimConfig::default());
        client.attach(transport, link)
    } else {
        info!("Connecting to bio-impedance device …");
        let (transport, link) = BleLink::new(BleConfig::default()).connect_first().await?;
        client.attach(transport, link)
    };

    info!("Commands (type + Enter):");
    info!("  s      – start program (then request inner device id)");
    info!("  m [n]  – measure with n repetitions (default {DEFAULT_REPETITION_COUNT})");
    info!("  e      – end program");
    info!("  i      – request inner device id");
    info!("  c      – clear measurement buffers");
    info!("  q      – disconnect and quit\n");

    // ── Stdin command loop ────────────────────────────────────────────────────
    // Lines are read on a dedicated OS thread so no StdinLock is held across
    // await points, then relayed to an async task.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l.trim().to_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let handle_cmd = handle.clone();
    tokio::spawn(async move {
        while let Some(line) = line_rx.recv().await {
            if line.is_empty() {
                continue;
            }
            if let Err(e) = run_command(&handle_cmd, &line).await {
                error!("'{line}': {e}");
            }
        }
    });

    // ── Main event loop ───────────────────────────────────────────────────────
    while let Some(event) = rx.recv().await {
        let link_lost = event.is_link_lost();
        match event {
            SessionEvent::Message(text) => println!("[INFO] {text}"),
            SessionEvent::StateChanged {
                connection,
                program,
            } => println!("[STATE] connection={connection:?} program={program:?}"),
            SessionEvent::InnerDeviceId(id) => println!("[DEVICE ID] {id}"),
            SessionEvent::MeasurementComplete(results) => {
                println!("[MEASUREMENT] {} electrode(s)", results.len());
                let doc = results_json(&handle.inner_device_id(), &results);
                println!("{}", serde_json::to_string_pretty(&doc)?);
            }
            SessionEvent::Error(e) => println!("[ERROR] {e}"),
        }
        if link_lost || handle.is_closed() {
            info!("Device link lost.");
            break;
        }
    }

    info!("Event loop finished – exiting.");
    Ok(())
}

async fn run_command(handle: &BiozHandle, line: &str) -> Result<()> {
    let mut words = line.split_whitespace();
    match words.next().unwrap_or_default() {
        "s" => handle.start_program().await?,
        "e" => handle.end_program().await?,
        "i" => handle.request_inner_device_id().await?,
        "c" => {
            handle.clear_measurement();
            info!("Measurement buffers cleared.");
        }
        "m" => {
            let repeat_count = match words.next() {
                Some(n) => n.parse()?,
                None => DEFAULT_REPETITION_COUNT,
            };
            handle
                .start_measurement(&MeasurementRequest::with_repeat_count(repeat_count))
                .await?;
        }
        "q" => {
            info!("Quit requested.");
            handle.disconnect().await.ok();
            std::process::exit(0);
        }
        other => info!("Unknown command '{other}'"),
    }
    Ok(())
}

/// `{"device": …, "impedance": {"1": …, "2": …}}` for one finished measurement.
fn results_json(device_id: &str, results: &MeasurementResults) -> Value {
    let impedance: Map<String, Value> = results
        .iter()
        .map(|(electrode, value)| (electrode.get().to_string(), json!(value)))
        .collect();
    json!({ "device": device_id, "electrodes": results.len(), "impedance": impedance })
}

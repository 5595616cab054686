//! A simulated bio-impedance device on the device side of a [`channel_link`].
//!
//! The simulator answers every command the way the firmware does:
//!
//! | Command | Reply |
//! |---|---|
//! | `0x60` | `[0x60, 0x01]` |
//! | `0x61` | `[0x61, 0x01]` |
//! | `0x91` | `[0x91, id0, id1, id2, id3]` |
//! | `0x62 n …` | `n` (narrow, wide) pairs per electrode, up to 4 pairs per frame |
//! | other | `[0xF0, opcode, 0x08, 0x01]` (protocol / unknown command) |
//!
//! Used by the CLI's `--simulate` mode and by the integration tests.
//!
//! [`channel_link`]: crate::transport::channel_link

use std::f64::consts::PI;
use std::time::Duration;

use log::{debug, info};
use tokio::task::JoinHandle;

use crate::parse::{encode_measurement_frame, SamplePair, MAX_PAIRS_PER_FRAME};
use crate::protocol::{
    ACK_OK, HEADER_ERROR, HEADER_INNER_DEVICE_ID, HEADER_MEASUREMENT, HEADER_PROGRAM_END,
    HEADER_PROGRAM_START,
};
use crate::transport::{DeviceEnd, TransportError};
use crate::types::ElectrodeId;

/// Configuration for [`spawn_simulator`].
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Raw id bytes reported in `0x91` responses.  Default: `de ad be ef`.
    pub inner_device_id: [u8; 4],
    /// Pause between measurement frames.  Default: 2 ms.
    pub frame_interval: Duration,
    /// Walk the host through connect/discover/ready before serving commands.
    /// Default: `true`.
    pub auto_connect: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            inner_device_id: [0xde, 0xad, 0xbe, 0xef],
            frame_interval: Duration::from_millis(2),
            auto_connect: true,
        }
    }
}

/// Deterministic raw sample for `electrode`, repetition `rep` and pulse class.
///
/// Each electrode sits on its own baseline; the wide pulse reads slightly
/// higher than the narrow one.  The first repetition carries a settling
/// transient so that dropping it visibly matters.
pub fn sim_sample(electrode: ElectrodeId, rep: usize, wide: bool) -> u16 {
    let e = electrode.get() as f64;
    let base = 400.0 + 12.5 * e + if wide { 35.0 } else { 0.0 };
    let ripple = 3.0 * (2.0 * PI * rep as f64 / 7.0 + e).sin();
    let transient = if rep == 0 { 60.0 } else { 0.0 };
    (base + ripple + transient).round() as u16
}

/// Measurement frames answering one `0x62` request with `repeat_count` pairs per electrode.
pub fn measurement_frames(repeat_count: usize) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    for electrode in ElectrodeId::all() {
        let pairs: Vec<SamplePair> = (0..repeat_count)
            .map(|rep| SamplePair {
                narrow: sim_sample(electrode, rep, false),
                wide: sim_sample(electrode, rep, true),
            })
            .collect();
        frames.extend(
            pairs
                .chunks(MAX_PAIRS_PER_FRAME)
                .filter_map(|chunk| encode_measurement_frame(electrode, chunk)),
        );
    }
    frames
}

/// Run the simulated device on `device` until the host side goes away.
pub fn spawn_simulator(mut device: DeviceEnd, config: SimConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = serve(&mut device, &config).await {
            debug!("simulator stopped: {e}");
        }
        info!("simulator finished");
    })
}

async fn serve(device: &mut DeviceEnd, config: &SimConfig) -> Result<(), TransportError> {
    if config.auto_connect {
        device.connect().await?;
    }
    while let Some(command) = device.next_written().await {
        let Some(&opcode) = command.first() else {
            continue;
        };
        debug!("simulator: command {command:02x?}");
        match opcode {
            HEADER_PROGRAM_START | HEADER_PROGRAM_END => {
                device.notify(vec![opcode, ACK_OK]).await?;
            }
            HEADER_INNER_DEVICE_ID => {
                let mut reply = vec![HEADER_INNER_DEVICE_ID];
                reply.extend_from_slice(&config.inner_device_id);
                device.notify(reply).await?;
            }
            HEADER_MEASUREMENT => {
                let repeat_count = command.get(1).copied().unwrap_or(0) as usize;
                for frame in measurement_frames(repeat_count) {
                    device.notify(frame).await?;
                    tokio::time::sleep(config.frame_interval).await;
                }
            }
            other => {
                device.notify(vec![HEADER_ERROR, other, 0x08, 0x01]).await?;
            }
        }
    }
    Ok(())
}

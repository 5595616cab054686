//! # bioz-rs
//!
//! Async Rust protocol engine for 32-electrode bio-impedance measurement
//! devices.
//!
//! The engine owns everything above the byte link: command encoding,
//! header-dispatch decoding of device notifications, connection / program
//! state tracking, per-electrode narrow/wide pulse accumulation and the
//! structured decoding of device-reported errors.  Links are plugged in
//! through the [`transport::Transport`] trait; a desktop BLE adapter
//! ([`ble`], feature `ble`) and an in-memory link ([`transport::channel_link`])
//! ship with the crate.
//!
//! ## Measurement flow
//!
//! | Step | Host writes | Device replies |
//! |---|---|---|
//! | 1 | `0x60` program start | `[0x60, 0x01]` |
//! | 2 | `0x91` id request (1 s after step 1) | `[0x91, 4 id bytes]` |
//! | 3 | `0x62 …` measurement request | `0x62` data frames for electrodes 1–32 |
//! | 4 | `0x61` program end | `[0x61, 0x01]` |
//!
//! Any step may be answered with an `0xF0` error frame instead.
//!
//! ## Quick start
//!
//! ```no_run
//! use bioz_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (transport, link) = BleLink::new(BleConfig::default()).connect_first().await?;
//!     let (mut rx, handle) = BiozClient::new(SessionConfig::default()).attach(transport, link);
//!
//!     while let Some(event) = rx.recv().await {
//!         match event {
//!             SessionEvent::StateChanged { connection: ConnectionState::Ready, program: ProgramState::NotStarted } => {
//!                 handle.start_program().await?;
//!                 handle.start_measurement(&MeasurementRequest::default()).await?;
//!             }
//!             SessionEvent::MeasurementComplete(results) => {
//!                 for (electrode, ohms) in &results {
//!                     println!("{electrode}: {ohms:.2}");
//!                 }
//!                 break;
//!             }
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`client`] | The async engine ([`client::BiozClient`]) and the [`client::BiozHandle`] command API |
//! | [`session`] | Synchronous connection/program state machine |
//! | [`accumulator`] | Per-electrode pulse buffers and impedance computation |
//! | [`protocol`] | Wire constants and command encoders |
//! | [`parse`] | Header dispatch and frame decoders |
//! | [`error_codes`] | Device error frame decoder and detail tables |
//! | [`transport`] | The transport seam and an in-memory link |
//! | [`ble`] | `btleplug` desktop adapter (feature `ble`) |
//! | [`sim`] | Simulated device for demos and tests |
//! | [`types`] | States, events and reports |

pub mod accumulator;
#[cfg(feature = "ble")]
pub mod ble;
pub mod client;
pub mod error;
pub mod error_codes;
pub mod parse;
pub mod protocol;
pub mod session;
pub mod sim;
pub mod transport;
pub mod types;

pub use error::{Error, Result};

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Engine ────────────────────────────────────────────────────────────────
    pub use crate::client::{BiozClient, BiozHandle};
    pub use crate::session::{IdRequestMode, SessionConfig};

    // ── Transports ────────────────────────────────────────────────────────────
    #[cfg(feature = "ble")]
    pub use crate::ble::{BleConfig, BleDevice, BleLink, BleTransport};
    pub use crate::transport::{channel_link, ChannelTransport, DeviceEnd, LinkEvent, Transport};

    // ── Events and data types ─────────────────────────────────────────────────
    pub use crate::types::{
        ConnectionState, ElectrodeId, ErrorClass, ErrorReport, HeaderCategory,
        MeasurementResults, ProgramState, SessionError, SessionEvent,
    };

    // ── Protocol ──────────────────────────────────────────────────────────────
    pub use crate::protocol::{
        MeasurementRequest, StimulusPayload, DEFAULT_REPETITION_COUNT, ELECTRODE_COUNT,
    };
    pub use crate::{Error, Result};
}

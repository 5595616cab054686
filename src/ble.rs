//! Desktop BLE transport for bio-impedance devices, built on `btleplug`.
//!
//! The adapter scans for a device by name prefix, connects, resolves the
//! client-to-device write characteristic and the device-to-client notify
//! characteristic, and then forwards:
//!
//! * every notification on the notify characteristic as [`LinkEvent::Frame`],
//! * the adapter's `DeviceDisconnected` event as [`LinkEvent::Disconnected`].
//!
//! All protocol handling lives in [`crate::client`]; this module only moves bytes.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::transport::{LinkEvent, Transport, TransportError};

// ── GATT layout ───────────────────────────────────────────────────────────────

/// Primary service exposing the command/response channel.
pub const IMPEDANCE_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// Client-to-device characteristic (write without response).
pub const COMMAND_CHARACTERISTIC: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// Device-to-client characteristic (notify).
pub const NOTIFY_CHARACTERISTIC: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

// ── BleConfig ─────────────────────────────────────────────────────────────────

/// Configuration for [`BleLink`].
#[derive(Debug, Clone)]
pub struct BleConfig {
    /// BLE scan duration in seconds before giving up. Default: `15`.
    pub scan_timeout_secs: u64,
    /// Match devices whose advertised name starts with this string.
    /// Default: `"BIOZ"`.
    pub name_prefix: String,
    /// Default: [`COMMAND_CHARACTERISTIC`].
    pub command_characteristic: Uuid,
    /// Default: [`NOTIFY_CHARACTERISTIC`].
    pub notify_characteristic: Uuid,
    /// Capacity of the link event channel. Default: `512`.
    pub link_capacity: usize,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            scan_timeout_secs: 15,
            name_prefix: "BIOZ".into(),
            command_characteristic: COMMAND_CHARACTERISTIC,
            notify_characteristic: NOTIFY_CHARACTERISTIC,
            link_capacity: 512,
        }
    }
}

/// A device discovered during a BLE scan.
#[derive(Clone, Debug)]
pub struct BleDevice {
    /// Advertised device name.
    pub name: String,
    /// Platform BLE identifier (UUID on macOS / Windows, MAC on Linux).
    pub id: String,
    peripheral: Peripheral,
    adapter: Adapter,
}

// ── BleLink ───────────────────────────────────────────────────────────────────

/// Scanner / connector producing a [`BleTransport`] and its link event stream.
pub struct BleLink {
    config: BleConfig,
}

impl BleLink {
    pub fn new(config: BleConfig) -> Self {
        Self { config }
    }

    /// Scan for all nearby devices matching the name prefix.
    pub async fn scan_all(&self) -> Result<Vec<BleDevice>> {
        let adapter = first_adapter().await?;
        info!("scan_all: scanning for {} s …", self.config.scan_timeout_secs);
        adapter.start_scan(ScanFilter::default()).await?;
        tokio::time::sleep(Duration::from_secs(self.config.scan_timeout_secs)).await;
        adapter.stop_scan().await.ok();

        let mut found = vec![];
        for p in adapter.peripherals().await? {
            if let Ok(Some(props)) = p.properties().await {
                if let Some(name) = props.local_name {
                    if name.starts_with(&self.config.name_prefix) {
                        let id = p.id().to_string();
                        info!("scan_all: found {name}  id={id}");
                        found.push(BleDevice {
                            name,
                            id,
                            peripheral: p,
                            adapter: adapter.clone(),
                        });
                    }
                }
            }
        }
        info!("scan_all: {} device(s) found", found.len());
        Ok(found)
    }

    /// Scan for the first matching device and connect to it.
    ///
    /// Fails only if no device is found; connect failures arrive on the
    /// returned receiver as [`LinkEvent::Failed`].
    pub async fn connect_first(&self) -> Result<(BleTransport, mpsc::Receiver<LinkEvent>)> {
        let adapter = first_adapter().await?;
        info!(
            "Scanning for {}* devices (timeout: {} s) …",
            self.config.name_prefix, self.config.scan_timeout_secs
        );
        adapter.start_scan(ScanFilter::default()).await?;
        let peripheral = find_first(&adapter, &self.config.name_prefix, self.config.scan_timeout_secs).await?;
        adapter.stop_scan().await.ok();

        let props = peripheral.properties().await?.unwrap_or_default();
        let name = props.local_name.unwrap_or_else(|| "Unknown".into());
        let id = peripheral.id().to_string();
        Ok(self.connect_to(BleDevice {
            name,
            id,
            peripheral,
            adapter,
        }))
    }

    /// Connect to a device returned by [`BleLink::scan_all`].
    ///
    /// Returns immediately.  Link establishment runs in a background task
    /// that reports `Connecting`, `Discovering` and then `Connected` or
    /// `Failed` on the returned receiver, so a failed connect reaches the
    /// session like any other link event.  Writes are rejected until the
    /// command characteristic has been resolved.
    pub fn connect_to(&self, device: BleDevice) -> (BleTransport, mpsc::Receiver<LinkEvent>) {
        let (tx, rx) = mpsc::channel::<LinkEvent>(self.config.link_capacity.max(4));
        let command_char = Arc::new(OnceLock::new());
        let transport = BleTransport {
            peripheral: device.peripheral.clone(),
            command_char: Arc::clone(&command_char),
        };
        tokio::spawn(run_connection(self.config.clone(), device, command_char, tx));
        (transport, rx)
    }
}

/// Establish the link to `device` and, on success, start the disconnect
/// watcher and the notification pump.
async fn run_connection(
    config: BleConfig,
    device: BleDevice,
    command_char: Arc<OnceLock<Characteristic>>,
    tx: mpsc::Sender<LinkEvent>,
) {
    let BleDevice {
        name,
        peripheral,
        adapter,
        ..
    } = device;

    let Some((command, notify_char)) =
        report_establish(&tx, establish(&config, &peripheral, &tx)).await
    else {
        return;
    };
    let _ = command_char.set(command);
    info!("Connected and services discovered: {name}");

    // ── Disconnect watcher ──────────────────────────────────────────────────
    let disconnect_tx = tx.clone();
    let peripheral_id = peripheral.id();
    tokio::spawn(async move {
        match adapter.events().await {
            Ok(mut events) => {
                while let Some(event) = events.next().await {
                    if let CentralEvent::DeviceDisconnected(id) = event {
                        if id == peripheral_id {
                            info!("Disconnect watcher: device {id:?} disconnected.");
                            let _ = disconnect_tx.send(LinkEvent::Disconnected).await;
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!("Disconnect watcher: could not subscribe to adapter events: {e}"),
        }
    });

    // ── Notification pump ───────────────────────────────────────────────────
    let notify_uuid = notify_char.uuid;
    let frame_tx = tx.clone();
    tokio::spawn(async move {
        let mut notifications = match peripheral.notifications().await {
            Ok(n) => n,
            Err(e) => {
                warn!("could not get notifications stream: {e}");
                return;
            }
        };
        while let Some(notif) = notifications.next().await {
            if notif.uuid != notify_uuid {
                debug!("Unknown notification from {}", notif.uuid);
                continue;
            }
            if frame_tx.send(LinkEvent::Frame(notif.value)).await.is_err() {
                break;
            }
        }
        info!("Notification stream ended – device disconnected.");
        let _ = frame_tx.send(LinkEvent::Disconnected).await;
    });

    let _ = tx.send(LinkEvent::Connected).await;
}

/// Send `Connecting`, drive `establish`, and send `Failed` if it errors.
async fn report_establish<T>(
    tx: &mpsc::Sender<LinkEvent>,
    establish: impl Future<Output = Result<T>>,
) -> Option<T> {
    let _ = tx.send(LinkEvent::Connecting).await;
    match establish.await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("link establishment failed: {e}");
            let _ = tx.send(LinkEvent::Failed(e.to_string())).await;
            None
        }
    }
}

/// Connect, discover services, resolve both characteristics and subscribe
/// to notifications.
async fn establish(
    config: &BleConfig,
    peripheral: &Peripheral,
    tx: &mpsc::Sender<LinkEvent>,
) -> Result<(Characteristic, Characteristic)> {
    // BlueZ's Device1.Connect can block forever when the device is out of range.
    tokio::time::timeout(Duration::from_secs(10), peripheral.connect())
        .await
        .map_err(|_| anyhow!("BLE connect() timed out after 10 s"))??;

    let _ = tx.send(LinkEvent::Discovering).await;
    // BlueZ reports the connection before its GATT cache is populated.
    #[cfg(target_os = "linux")]
    tokio::time::sleep(Duration::from_millis(600)).await;

    tokio::time::timeout(Duration::from_secs(15), peripheral.discover_services())
        .await
        .map_err(|_| anyhow!("discover_services() timed out after 15 s"))??;

    let chars: BTreeSet<Characteristic> = peripheral.characteristics();
    let find_char = |uuid: Uuid| -> Result<Characteristic> {
        chars
            .iter()
            .find(|c| c.uuid == uuid)
            .cloned()
            .ok_or_else(|| anyhow!("Characteristic {uuid} not found"))
    };
    let command_char = find_char(config.command_characteristic)?;
    let notify_char = find_char(config.notify_characteristic)?;
    peripheral.subscribe(&notify_char).await?;
    Ok((command_char, notify_char))
}

async fn first_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;

    // CoreBluetooth ignores scan requests until the manager reaches poweredOn.
    #[cfg(target_os = "macos")]
    {
        use btleplug::api::CentralState;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            match adapter.adapter_state().await {
                Ok(CentralState::PoweredOn) => break,
                Ok(state) if tokio::time::Instant::now() >= deadline => {
                    warn!("macOS: adapter still in state {state:?} after 3 s, proceeding anyway");
                    break;
                }
                Ok(state) => debug!("macOS: adapter state = {state:?}, waiting…"),
                Err(e) => {
                    warn!("macOS: adapter_state() error: {e}");
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    Ok(adapter)
}

/// Poll until the first matching peripheral appears or the timeout expires.
async fn find_first(adapter: &Adapter, prefix: &str, timeout_secs: u64) -> Result<Peripheral> {
    let result = tokio::time::timeout(Duration::from_secs(timeout_secs), async {
        loop {
            let peripherals = adapter.peripherals().await.unwrap_or_default();
            for p in peripherals {
                if let Ok(Some(props)) = p.properties().await {
                    if props.local_name.as_deref().is_some_and(|n| n.starts_with(prefix)) {
                        return p;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
    })
    .await;

    result.map_err(|_| anyhow!("Timed out scanning for a {prefix}* device after {timeout_secs} s"))
}

// ── BleTransport ──────────────────────────────────────────────────────────────

/// Write half of a BLE link.
pub struct BleTransport {
    peripheral: Peripheral,
    /// Set once the link is established.
    command_char: Arc<OnceLock<Characteristic>>,
}

#[async_trait]
impl Transport for BleTransport {
    async fn write(&self, frame: &[u8]) -> Result<(), TransportError> {
        let Some(command_char) = self.command_char.get() else {
            return Err(TransportError::WriteFailed("link not established".into()));
        };
        self.peripheral
            .write(command_char, frame, WriteType::WithoutResponse)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }
}

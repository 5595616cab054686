//! The transport seam between the protocol engine and a physical link.
//!
//! A transport is two things:
//!
//! * a [`Transport`] implementation the engine writes command frames to, and
//! * a `mpsc::Receiver<LinkEvent>` carrying link lifecycle changes and
//!   inbound frames, in the order the link observed them.
//!
//! The engine never scans, pairs or opens a link.  Adapters resolve the
//! client-to-device write target and the device-to-client notification
//! source before handing both halves to [`crate::client::BiozClient::attach`].
//!
//! [`channel_link`] builds an in-memory link used by the simulator and tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors surfaced by a [`Transport`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The link is gone.
    #[error("link closed")]
    Closed,

    /// The underlying stack rejected the write.
    #[error("write failed: {0}")]
    WriteFailed(String),
}

/// One item of the inbound link stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Link establishment started.
    Connecting,
    /// Link is up; service / characteristic discovery is running.
    Discovering,
    /// Write target and notification source are resolved.
    Connected,
    /// Link establishment failed.
    Failed(String),
    /// The link dropped.
    Disconnected,
    /// One complete device notification.
    Frame(Vec<u8>),
}

/// Write half of a link to the device.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Write one command frame to the device.
    async fn write(&self, frame: &[u8]) -> Result<(), TransportError>;

    /// Tear the link down.  Transports that cannot close themselves keep the default.
    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

// ── In-memory link ────────────────────────────────────────────────────────────

/// Host half of an in-memory link created by [`channel_link`].
///
/// Holds only a weak handle on the link stream, so the stream ends once the
/// [`DeviceEnd`] is dropped.
#[derive(Clone)]
pub struct ChannelTransport {
    written: mpsc::UnboundedSender<Vec<u8>>,
    link: mpsc::WeakSender<LinkEvent>,
    fail_writes: Arc<AtomicBool>,
}

/// Device half of an in-memory link created by [`channel_link`].
#[derive(Debug)]
pub struct DeviceEnd {
    written: mpsc::UnboundedReceiver<Vec<u8>>,
    link: mpsc::Sender<LinkEvent>,
    fail_writes: Arc<AtomicBool>,
}

/// Create an in-memory link.
///
/// Returns the host-side transport, the device side, and the link event
/// receiver to pass to [`crate::client::BiozClient::attach`].
pub fn channel_link(capacity: usize) -> (ChannelTransport, DeviceEnd, mpsc::Receiver<LinkEvent>) {
    let (written_tx, written_rx) = mpsc::unbounded_channel();
    let (link_tx, link_rx) = mpsc::channel(capacity);
    let fail_writes = Arc::new(AtomicBool::new(false));
    let transport = ChannelTransport {
        written: written_tx,
        link: link_tx.downgrade(),
        fail_writes: Arc::clone(&fail_writes),
    };
    let device = DeviceEnd {
        written: written_rx,
        link: link_tx,
        fail_writes,
    };
    (transport, device, link_rx)
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn write(&self, frame: &[u8]) -> Result<(), TransportError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::WriteFailed("write rejected by link".into()));
        }
        self.written
            .send(frame.to_vec())
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self) -> Result<(), TransportError> {
        let link = self.link.upgrade().ok_or(TransportError::Closed)?;
        link.send(LinkEvent::Disconnected)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

impl DeviceEnd {
    /// Push a link event towards the host.
    pub async fn send(&self, event: LinkEvent) -> Result<(), TransportError> {
        self.link.send(event).await.map_err(|_| TransportError::Closed)
    }

    /// Deliver one device notification.
    pub async fn notify(&self, frame: impl Into<Vec<u8>>) -> Result<(), TransportError> {
        self.send(LinkEvent::Frame(frame.into())).await
    }

    /// Walk the host through `Connecting → Discovering → Connected`.
    pub async fn connect(&self) -> Result<(), TransportError> {
        self.send(LinkEvent::Connecting).await?;
        self.send(LinkEvent::Discovering).await?;
        self.send(LinkEvent::Connected).await
    }

    /// Drop the link from the device side.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        self.send(LinkEvent::Disconnected).await
    }

    /// Make every subsequent host write fail (or succeed again).
    pub fn set_write_failure(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Wait for the next frame written by the host.
    pub async fn next_written(&mut self) -> Option<Vec<u8>> {
        self.written.recv().await
    }

    /// Drain every frame the host has written so far without waiting.
    pub fn drain_written(&mut self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.written.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

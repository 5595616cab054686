use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::error::{Error, Result};
use crate::protocol::MeasurementRequest;
use crate::session::{IdRequestMode, Session, SessionConfig};
use crate::transport::{LinkEvent, Transport};
use crate::types::{ConnectionState, MeasurementResults, ProgramState, SessionError, SessionEvent};

// ── BiozClient ────────────────────────────────────────────────────────────────

/// Async protocol engine for one bio-impedance device.
///
/// The client is transport-agnostic: hand it a [`Transport`] for writes and
/// the matching [`LinkEvent`] receiver, and it spawns a single task that
/// processes link events and inbound frames strictly one at a time.
///
/// ```no_run
/// use bioz_rs::prelude::*;
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let (transport, device, link) = channel_link(64);
/// let (mut rx, handle) = BiozClient::new(SessionConfig::default()).attach(transport, link);
/// # drop(device);
/// while let Some(event) = rx.recv().await {
///     if let SessionEvent::StateChanged { connection: ConnectionState::Ready, .. } = event {
///         handle.start_program().await?;
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct BiozClient {
    config: SessionConfig,
}

impl BiozClient {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }

    /// Bind a session to a link and start the frame-processing task.
    ///
    /// Must be called from within a Tokio runtime.  Returns the event
    /// receiver and a [`BiozHandle`] for issuing commands.  When the link
    /// event stream ends the session is reset and the handle rejects further
    /// commands with [`Error::SessionClosed`].
    pub fn attach<T: Transport>(
        &self,
        transport: T,
        link: mpsc::Receiver<LinkEvent>,
    ) -> (mpsc::Receiver<SessionEvent>, BiozHandle) {
        let (tx, rx) = mpsc::channel::<SessionEvent>(self.config.event_capacity.max(1));
        let handle = BiozHandle {
            session: Arc::new(Mutex::new(Session::new(self.config.clone()))),
            transport: Arc::new(transport),
            events: tx,
            delivery: Arc::new(AsyncMutex::new(())),
            closed: Arc::new(AtomicBool::new(false)),
        };
        tokio::spawn(run_link(handle.clone(), link));
        (rx, handle)
    }
}

/// Drain link events into the session until the link stream closes.
async fn run_link(handle: BiozHandle, mut link: mpsc::Receiver<LinkEvent>) {
    let mut frame_count: u64 = 0;
    while let Some(event) = link.recv().await {
        if let LinkEvent::Frame(ref frame) = event {
            frame_count += 1;
            if frame_count <= 3 || frame_count % 500 == 0 {
                debug!("frame #{frame_count} len={} header={:02x?}", frame.len(), frame.first());
            }
        }
        let reply = handle.apply(move |s| s.handle_link_event(event)).await;
        if let Some(frame) = reply {
            // Failures are recorded on the session and surfaced as events.
            let _ = handle.write(&frame).await;
        }
    }

    info!("link event stream ended after {frame_count} frame(s), closing session");
    handle.closed.store(true, Ordering::SeqCst);
    handle.apply(Session::reset).await;
}

// ── BiozHandle ────────────────────────────────────────────────────────────────

/// A handle to an attached session that issues device commands.
///
/// Cloning is cheap; every clone drives the same session.
#[derive(Clone)]
pub struct BiozHandle {
    session: Arc<Mutex<Session>>,
    transport: Arc<dyn Transport>,
    events: mpsc::Sender<SessionEvent>,
    /// Held from draining the session's events until they are all sent, so
    /// every producer delivers in the order the session emitted.
    delivery: Arc<AsyncMutex<()>>,
    closed: Arc<AtomicBool>,
}

impl BiozHandle {
    /// Start the device program, then request the inner device id.
    ///
    /// With [`IdRequestMode::AfterSettleDelay`] this waits the configured
    /// settle interval after writing the start command and then writes the
    /// id request, unless the session was disconnected or restarted
    /// meanwhile.  With [`IdRequestMode::AfterStartAck`] the id request is
    /// written by the frame task when the start ack arrives, and this returns
    /// right after the start command is written.
    pub async fn start_program(&self) -> Result<()> {
        let (frame, generation) = self.with_session(Session::begin_program_start).await?;
        info!("starting program");
        self.write(&frame).await?;

        let (mode, settle) = {
            let session = self.session.lock();
            (session.config().id_request, session.config().settle_interval)
        };
        if mode == IdRequestMode::AfterSettleDelay {
            tokio::time::sleep(settle).await;
            let due = self.session.lock().id_request_due(generation);
            if let Some(frame) = due {
                self.write(&frame).await?;
            }
        }
        Ok(())
    }

    /// End the device program.
    pub async fn end_program(&self) -> Result<()> {
        let frame = self.with_session(Session::begin_program_end).await?;
        info!("ending program");
        self.write(&frame).await
    }

    /// Clear all pulse buffers and request a new measurement.
    pub async fn start_measurement(&self, request: &MeasurementRequest) -> Result<()> {
        let frame = self.with_session(|s| s.begin_measurement(request)).await?;
        self.write(&frame).await
    }

    /// Request the inner device id outside the program start sequence.
    pub async fn request_inner_device_id(&self) -> Result<()> {
        let frame = self.with_session(Session::begin_id_request).await?;
        self.write(&frame).await
    }

    /// Discard measurement buffers and results without changing either state.
    pub fn clear_measurement(&self) {
        self.session.lock().clear_measurement();
    }

    /// Reset the session immediately and ask the transport to close the link.
    ///
    /// Buffers and the inner device id are cleared before the transport is
    /// touched; any pending settle wait is abandoned.
    pub async fn disconnect(&self) -> Result<()> {
        self.apply(Session::reset).await;
        self.transport.close().await?;
        Ok(())
    }

    // ── Snapshots ─────────────────────────────────────────────────────────────

    pub fn connection_state(&self) -> ConnectionState {
        self.session.lock().connection_state()
    }

    pub fn program_state(&self) -> ProgramState {
        self.session.lock().program_state()
    }

    pub fn inner_device_id(&self) -> String {
        self.session.lock().inner_device_id().to_owned()
    }

    pub fn last_results(&self) -> MeasurementResults {
        self.session.lock().last_results().clone()
    }

    pub fn last_error(&self) -> Option<SessionError> {
        self.session.lock().last_error().cloned()
    }

    /// `true` once the link event stream has ended.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    /// Run a guarded command builder on the session and deliver the events
    /// it produced.
    async fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> Result<R>) -> Result<R> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        self.apply(f).await
    }

    /// Apply `f` under the session lock, then send every event it produced.
    ///
    /// Events are never dropped: a full channel applies backpressure.
    async fn apply<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        let _delivery = self.delivery.lock().await;
        let (out, events) = {
            let mut session = self.session.lock();
            let out = f(&mut *session);
            (out, session.drain_events())
        };
        for event in events {
            if self.events.send(event).await.is_err() {
                debug!("event receiver dropped");
                break;
            }
        }
        out
    }

    async fn write(&self, frame: &[u8]) -> Result<()> {
        debug!("write {:02x?}", frame);
        if let Err(err) = self.transport.write(frame).await {
            self.apply(|s| s.record_write_failure(&err)).await;
            return Err(err.into());
        }
        Ok(())
    }
}

//! Connection and program state tracking for one device session.
//!
//! [`Session`] is the synchronous core of the engine: it owns both state
//! variables, the inner device id and the [`MeasurementAccumulator`], and it
//! turns link events and inbound frames into [`SessionEvent`]s.  It performs
//! no I/O.  Command methods (`begin_*`) check their guard, update state and
//! return the frame the caller must write; the caller reports a failed write
//! back through [`Session::record_write_failure`].
//!
//! # Guards
//!
//! | Operation | Connection | Program |
//! |---|---|---|
//! | program start | `Ready` | any |
//! | program end | `Ready` | any |
//! | measurement | `Ready` | `Started` or `Completed` |
//! | inner-device-id request | `Ready` | any |
//!
//! A failed guard returns a precondition [`Error`] and changes nothing.

use std::mem;
use std::time::Duration;

use log::{debug, info, warn};

use crate::accumulator::MeasurementAccumulator;
use crate::error::{Error, Result};
use crate::error_codes::decode_error_frame;
use crate::parse::{
    parse_ack_status, parse_inner_device_id, parse_measurement_frame, route_frame, Frame,
};
use crate::protocol::{
    encode_inner_device_id_request, encode_measurement_request, encode_program_end,
    encode_program_start, MeasurementRequest, ACK_OK, DEFAULT_REPETITION_COUNT,
    IMPEDANCE_OFFSET, INNER_DEVICE_ID_SENTINEL, PROGRAM_SETTLE_INTERVAL,
};
use crate::transport::{LinkEvent, TransportError};
use crate::types::{ConnectionState, MeasurementResults, ProgramState, SessionError, SessionEvent};

// ── Configuration ─────────────────────────────────────────────────────────────

/// When the inner-device-id request follows a program start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdRequestMode {
    /// Write the request a fixed settle interval after the start command.
    #[default]
    AfterSettleDelay,
    /// Write the request as soon as the device acknowledges the start command.
    AfterStartAck,
}

/// Configuration for [`Session`] and [`crate::client::BiozClient`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Repetition count used for data that arrives before any measurement
    /// request.  A request's own `repeat_count` takes precedence.
    /// Default: [`DEFAULT_REPETITION_COUNT`].
    pub repetition_count: u8,
    /// Calibration offset subtracted from each pulse average.
    /// Default: [`IMPEDANCE_OFFSET`].
    pub impedance_offset: f64,
    /// Default: [`IdRequestMode::AfterSettleDelay`].
    pub id_request: IdRequestMode,
    /// Delay used by [`IdRequestMode::AfterSettleDelay`].
    /// Default: [`PROGRAM_SETTLE_INTERVAL`] (1 s).
    pub settle_interval: Duration,
    /// Capacity of the event channel returned by the client.  Default: `256`.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            repetition_count: DEFAULT_REPETITION_COUNT,
            impedance_offset: IMPEDANCE_OFFSET,
            id_request: IdRequestMode::AfterSettleDelay,
            settle_interval: PROGRAM_SETTLE_INTERVAL,
            event_capacity: 256,
        }
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// State of one logical device session.
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    connection: ConnectionState,
    program: ProgramState,
    inner_device_id: String,
    accumulator: MeasurementAccumulator,
    last_error: Option<SessionError>,
    /// Bumped on every program start and every reset; a delayed id request
    /// is only written if the generation it captured is still current.
    generation: u64,
    events: Vec<SessionEvent>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let accumulator =
            MeasurementAccumulator::new(config.repetition_count as usize, config.impedance_offset);
        Self {
            config,
            connection: ConnectionState::Disconnected,
            program: ProgramState::NotStarted,
            inner_device_id: INNER_DEVICE_ID_SENTINEL.to_owned(),
            accumulator,
            last_error: None,
            generation: 0,
            events: Vec::new(),
        }
    }

    // ── Snapshots ─────────────────────────────────────────────────────────────

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection
    }

    pub fn program_state(&self) -> ProgramState {
        self.program
    }

    /// The last reported inner device id, or [`INNER_DEVICE_ID_SENTINEL`].
    pub fn inner_device_id(&self) -> &str {
        &self.inner_device_id
    }

    pub fn accumulator(&self) -> &MeasurementAccumulator {
        &self.accumulator
    }

    /// Results of the last finished measurement, empty if none.
    pub fn last_results(&self) -> &MeasurementResults {
        self.accumulator.results()
    }

    pub fn last_error(&self) -> Option<&SessionError> {
        self.last_error.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Take every event produced since the last call.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        mem::take(&mut self.events)
    }

    // ── Commands ──────────────────────────────────────────────────────────────

    /// Guard and build the program start command.
    ///
    /// Returns the frame to write and the generation a delayed id request
    /// must present to [`Session::id_request_due`].
    pub fn begin_program_start(&mut self) -> Result<(Vec<u8>, u64)> {
        self.require_ready()?;
        self.generation += 1;
        Ok((encode_program_start(), self.generation))
    }

    /// Guard and build the program end command.
    pub fn begin_program_end(&mut self) -> Result<Vec<u8>> {
        self.require_ready()?;
        Ok(encode_program_end())
    }

    /// Guard and build the inner-device-id request.
    pub fn begin_id_request(&mut self) -> Result<Vec<u8>> {
        self.require_ready()?;
        Ok(encode_inner_device_id_request())
    }

    /// Guard and build a measurement request, opening a fresh measurement session.
    ///
    /// On success all pulse buffers are cleared, the accumulator adopts the
    /// request's repeat count, and the program state becomes `Measuring`.
    pub fn begin_measurement(&mut self, request: &MeasurementRequest) -> Result<Vec<u8>> {
        self.require_ready()?;
        if !matches!(self.program, ProgramState::Started | ProgramState::Completed) {
            return Err(Error::ProgramNotStarted {
                state: self.program,
            });
        }
        let frame = encode_measurement_request(request)?;
        self.accumulator.reset(request.repeat_count as usize);
        self.set_program(ProgramState::Measuring);
        info!(
            "measurement requested: {} repetition(s) per pulse class",
            request.repeat_count
        );
        Ok(frame)
    }

    /// The id request to write once the settle interval after a program
    /// start has elapsed, or `None` if the session moved on meanwhile.
    pub fn id_request_due(&self, generation: u64) -> Option<Vec<u8>> {
        if generation != self.generation || self.connection != ConnectionState::Ready {
            debug!("settle wait superseded (generation {generation}), skipping id request");
            return None;
        }
        Some(encode_inner_device_id_request())
    }

    /// Record a failed command write.  The connection state is left alone;
    /// the transport reports disconnection through its own link event.
    pub fn record_write_failure(&mut self, err: &TransportError) {
        warn!("command write failed: {err}");
        self.fail(SessionError::Transport(err.to_string()));
    }

    /// Drop the session back to `Disconnected` / `NotStarted`.
    ///
    /// Clears the inner device id, every pulse buffer and all results, and
    /// invalidates any pending settle wait.
    pub fn reset(&mut self) {
        self.generation += 1;
        self.inner_device_id = INNER_DEVICE_ID_SENTINEL.to_owned();
        self.accumulator.clear();
        self.set_states(ConnectionState::Disconnected, ProgramState::NotStarted);
    }

    /// Discard measurement buffers and results without touching either state.
    pub fn clear_measurement(&mut self) {
        self.accumulator.clear();
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    /// Apply one link event.
    ///
    /// Returns a command frame the caller must write in response, if any.
    pub fn handle_link_event(&mut self, event: LinkEvent) -> Option<Vec<u8>> {
        match event {
            LinkEvent::Connecting => self.set_connection(ConnectionState::Connecting),
            LinkEvent::Discovering => self.set_connection(ConnectionState::Discovering),
            LinkEvent::Connected => {
                self.set_connection(ConnectionState::Ready);
                self.message("link ready");
            }
            LinkEvent::Failed(reason) => {
                warn!("link failed: {reason}");
                self.last_error = Some(SessionError::ConnectFailed(reason.clone()));
                self.set_states(ConnectionState::Error, ProgramState::Error);
                self.events
                    .push(SessionEvent::Error(SessionError::ConnectFailed(reason)));
            }
            LinkEvent::Disconnected => {
                info!("link disconnected, resetting session");
                self.reset();
            }
            LinkEvent::Frame(frame) => return self.handle_frame(&frame),
        }
        None
    }

    /// Dispatch one inbound frame by header byte.
    ///
    /// Returns a command frame the caller must write in response, if any.
    pub fn handle_frame(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let Some(routed) = route_frame(frame) else {
            debug!("empty frame discarded");
            return None;
        };
        match routed {
            Frame::ProgramStartAck(f) => return self.on_program_start_ack(f),
            Frame::ProgramEndAck(f) => self.on_program_end_ack(f),
            Frame::Measurement(f) => self.on_measurement(f),
            Frame::InnerDeviceId(f) => self.on_inner_device_id(f),
            Frame::Error(f) => self.on_error_frame(f),
            Frame::Unrecognized(header) => {
                debug!("unrecognized header 0x{header:02x} ({} bytes) discarded", frame.len());
            }
        }
        None
    }

    fn on_program_start_ack(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        match parse_ack_status(frame) {
            Some(ACK_OK) => {
                self.set_program(ProgramState::Started);
                self.message("program started");
                if self.config.id_request == IdRequestMode::AfterStartAck
                    && self.connection == ConnectionState::Ready
                {
                    return Some(encode_inner_device_id_request());
                }
            }
            Some(status) => self.fail(SessionError::Handshake(format!(
                "program start rejected (status 0x{status:02x})"
            ))),
            None => self.fail(SessionError::Handshake(
                "program start ack carries no status".into(),
            )),
        }
        None
    }

    fn on_program_end_ack(&mut self, frame: &[u8]) {
        match parse_ack_status(frame) {
            Some(ACK_OK) => {
                self.set_program(ProgramState::NotStarted);
                self.message("program ended");
            }
            Some(status) => self.fail(SessionError::Handshake(format!(
                "program end rejected (status 0x{status:02x})"
            ))),
            None => self.fail(SessionError::Handshake(
                "program end ack carries no status".into(),
            )),
        }
    }

    fn on_measurement(&mut self, frame: &[u8]) {
        let Some(measurement) = parse_measurement_frame(frame) else {
            debug!(
                "measurement frame discarded (len {}, electrode byte {:?})",
                frame.len(),
                frame.get(2)
            );
            return;
        };
        if let Some(results) = self.accumulator.push_frame(&measurement) {
            self.set_program(ProgramState::Completed);
            self.events.push(SessionEvent::MeasurementComplete(results));
        }
    }

    fn on_inner_device_id(&mut self, frame: &[u8]) {
        match parse_inner_device_id(frame) {
            Some(id) => {
                info!("inner device id: {id}");
                self.inner_device_id.clone_from(&id);
                self.events.push(SessionEvent::InnerDeviceId(id));
            }
            None => debug!("inner-device-id frame of length {} ignored", frame.len()),
        }
    }

    fn on_error_frame(&mut self, frame: &[u8]) {
        let error = match decode_error_frame(frame) {
            Some(report) => SessionError::Device(report),
            None => SessionError::MalformedErrorFrame(frame.to_vec()),
        };
        warn!("{error}");
        self.fail(error);
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn require_ready(&self) -> Result<()> {
        if self.connection != ConnectionState::Ready {
            return Err(Error::NotReady {
                state: self.connection,
            });
        }
        Ok(())
    }

    fn fail(&mut self, error: SessionError) {
        self.last_error = Some(error.clone());
        self.set_program(ProgramState::Error);
        self.events.push(SessionEvent::Error(error));
    }

    fn message(&mut self, text: &str) {
        self.events.push(SessionEvent::Message(text.to_owned()));
    }

    fn set_connection(&mut self, connection: ConnectionState) {
        self.set_states(connection, self.program);
    }

    fn set_program(&mut self, program: ProgramState) {
        self.set_states(self.connection, program);
    }

    fn set_states(&mut self, connection: ConnectionState, program: ProgramState) {
        if connection == self.connection && program == self.program {
            return;
        }
        debug!(
            "state: {:?}/{:?} → {connection:?}/{program:?}",
            self.connection, self.program
        );
        self.connection = connection;
        self.program = program;
        self.events.push(SessionEvent::StateChanged {
            connection,
            program,
        });
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::{encode_measurement_frame, SamplePair};
    use crate::types::{ElectrodeId, ErrorClass, HeaderCategory};

    fn ready_session() -> Session {
        let mut session = Session::default();
        session.handle_link_event(LinkEvent::Connecting);
        session.handle_link_event(LinkEvent::Discovering);
        session.handle_link_event(LinkEvent::Connected);
        session.drain_events();
        session
    }

    fn started_session() -> Session {
        let mut session = ready_session();
        session.begin_program_start().unwrap();
        session.handle_frame(&[0x60, 0x01]);
        session.drain_events();
        session
    }

    fn measurement_frames(electrode: u8, rep: u16) -> Vec<Vec<u8>> {
        let electrode = ElectrodeId::new(electrode).unwrap();
        (0..rep)
            .map(|i| {
                encode_measurement_frame(electrode, &[SamplePair { narrow: 100 + i, wide: 300 + i }])
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_connection_lifecycle() {
        let mut session = Session::default();
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        session.handle_link_event(LinkEvent::Connecting);
        assert_eq!(session.connection_state(), ConnectionState::Connecting);
        session.handle_link_event(LinkEvent::Discovering);
        session.handle_link_event(LinkEvent::Connected);
        assert_eq!(session.connection_state(), ConnectionState::Ready);

        let changes = session
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::StateChanged { .. }))
            .count();
        assert_eq!(changes, 3);
    }

    #[test]
    fn test_guards_require_ready() {
        let mut session = Session::default();
        assert!(matches!(
            session.begin_program_start(),
            Err(Error::NotReady { state: ConnectionState::Disconnected })
        ));
        assert!(session.begin_program_end().unwrap_err().is_precondition());
        assert!(session
            .begin_measurement(&MeasurementRequest::default())
            .unwrap_err()
            .is_precondition());
        assert!(session.drain_events().is_empty());
    }

    #[test]
    fn test_measurement_requires_started_program() {
        let mut session = ready_session();
        let err = session
            .begin_measurement(&MeasurementRequest::default())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ProgramNotStarted { state: ProgramState::NotStarted }
        ));
        assert_eq!(session.program_state(), ProgramState::NotStarted);
    }

    #[test]
    fn test_program_start_and_end_acks() {
        let mut session = ready_session();
        let (frame, _) = session.begin_program_start().unwrap();
        assert_eq!(frame, [0x60]);
        assert_eq!(session.handle_frame(&[0x60, 0x01]), None);
        assert_eq!(session.program_state(), ProgramState::Started);

        assert_eq!(session.begin_program_end().unwrap(), [0x61]);
        session.handle_frame(&[0x61, 0x01]);
        assert_eq!(session.program_state(), ProgramState::NotStarted);
    }

    #[test]
    fn test_rejected_handshake() {
        let mut session = ready_session();
        session.begin_program_start().unwrap();
        session.handle_frame(&[0x60, 0x00]);
        assert_eq!(session.program_state(), ProgramState::Error);
        assert_eq!(session.connection_state(), ConnectionState::Ready);
        assert!(matches!(
            session.last_error(),
            Some(SessionError::Handshake(_))
        ));

        let mut session = ready_session();
        session.handle_frame(&[0x61]);
        assert_eq!(session.program_state(), ProgramState::Error);
    }

    #[test]
    fn test_start_ack_triggers_id_request_when_configured() {
        let mut session = Session::new(SessionConfig {
            id_request: IdRequestMode::AfterStartAck,
            ..SessionConfig::default()
        });
        session.handle_link_event(LinkEvent::Connected);
        session.begin_program_start().unwrap();
        assert_eq!(session.handle_frame(&[0x60, 0x01]), Some(vec![0x91]));
    }

    #[test]
    fn test_id_request_due_checks_generation() {
        let mut session = ready_session();
        let (_, generation) = session.begin_program_start().unwrap();
        assert_eq!(session.id_request_due(generation), Some(vec![0x91]));

        session.handle_link_event(LinkEvent::Disconnected);
        assert_eq!(session.id_request_due(generation), None);
    }

    #[test]
    fn test_inner_device_id_update_and_reset() {
        let mut session = ready_session();
        assert_eq!(session.inner_device_id(), INNER_DEVICE_ID_SENTINEL);

        session.handle_frame(&[0x91, 0x12, 0x34, 0xab, 0xcd]);
        assert_eq!(session.inner_device_id(), "1234abcd");
        assert_eq!(
            session.drain_events(),
            vec![SessionEvent::InnerDeviceId("1234abcd".into())]
        );

        // Wrong length: ignored, no event.
        session.handle_frame(&[0x91, 0x00, 0x00, 0x00]);
        assert_eq!(session.inner_device_id(), "1234abcd");
        assert!(session.drain_events().is_empty());

        session.handle_link_event(LinkEvent::Disconnected);
        assert_eq!(session.inner_device_id(), INNER_DEVICE_ID_SENTINEL);
    }

    #[test]
    fn test_error_frame_sets_program_error_only() {
        let mut session = started_session();
        session.handle_frame(&[0xF0, 0x62, 0x02, 0x01]);
        assert_eq!(session.program_state(), ProgramState::Error);
        assert_eq!(session.connection_state(), ConnectionState::Ready);

        match session.last_error() {
            Some(SessionError::Device(report)) => {
                assert_eq!(report.header_category, HeaderCategory::MeasurementCommand);
                assert_eq!(report.error_class, ErrorClass::DataProcessing);
                assert_eq!(report.detail_text, "unavailable map data");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_short_error_frame_is_surfaced() {
        let mut session = started_session();
        session.handle_frame(&[0xF0, 0x62]);
        assert_eq!(session.program_state(), ProgramState::Error);
        assert_eq!(
            session.last_error(),
            Some(&SessionError::MalformedErrorFrame(vec![0xF0, 0x62]))
        );
    }

    #[test]
    fn test_invalid_electrode_leaves_buffers_untouched() {
        let mut session = started_session();
        session
            .begin_measurement(&MeasurementRequest::with_repeat_count(2))
            .unwrap();
        session.handle_frame(&[0x62, 0x00, 0x00, 0x00, 0x01, 0x00, 0x02]);
        session.handle_frame(&[0x62, 0x00, 33, 0x00, 0x01, 0x00, 0x02]);
        assert!(session.accumulator().is_empty());
        assert_eq!(session.program_state(), ProgramState::Measuring);
    }

    #[test]
    fn test_full_measurement_completes_once() {
        let mut session = started_session();
        session
            .begin_measurement(&MeasurementRequest::with_repeat_count(3))
            .unwrap();
        session.drain_events();

        for electrode in 1..=32 {
            for frame in measurement_frames(electrode, 3) {
                session.handle_frame(&frame);
            }
        }
        // Stray frames after completion do not complete again.
        for frame in measurement_frames(1, 3) {
            session.handle_frame(&frame);
        }

        let completions: Vec<_> = session
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::MeasurementComplete(r) => Some(r),
                _ => None,
            })
            .collect();
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].len(), 32);
        assert_eq!(session.program_state(), ProgramState::Completed);

        // narrow rest [101, 102], wide rest [301, 302]
        let expected = ((101.5 - IMPEDANCE_OFFSET) + (301.5 - IMPEDANCE_OFFSET)) / 2.0;
        assert_eq!(completions[0][&ElectrodeId::new(17).unwrap()], expected);

        // A completed program may be measured again.
        assert!(session
            .begin_measurement(&MeasurementRequest::with_repeat_count(3))
            .is_ok());
        assert!(session.last_results().is_empty());
    }

    #[test]
    fn test_disconnect_mid_measurement_clears_buffers() {
        let mut session = started_session();
        session
            .begin_measurement(&MeasurementRequest::with_repeat_count(4))
            .unwrap();
        for frame in measurement_frames(5, 4).into_iter().chain(measurement_frames(6, 2)) {
            session.handle_frame(&frame);
        }
        assert!(!session.accumulator().is_empty());

        session.handle_link_event(LinkEvent::Disconnected);
        assert!(session.accumulator().is_empty());
        assert_eq!(session.connection_state(), ConnectionState::Disconnected);
        assert_eq!(session.program_state(), ProgramState::NotStarted);
    }

    #[test]
    fn test_write_failure_sets_program_error() {
        let mut session = started_session();
        session.record_write_failure(&TransportError::WriteFailed("gatt busy".into()));
        assert_eq!(session.program_state(), ProgramState::Error);
        assert_eq!(session.connection_state(), ConnectionState::Ready);
    }

    #[test]
    fn test_connect_failure() {
        let mut session = Session::default();
        session.handle_link_event(LinkEvent::Connecting);
        session.handle_link_event(LinkEvent::Failed("adapter off".into()));
        assert_eq!(session.connection_state(), ConnectionState::Error);
        assert_eq!(session.program_state(), ProgramState::Error);
    }

    #[test]
    fn test_unrecognized_and_empty_frames_ignored() {
        let mut session = started_session();
        assert_eq!(session.handle_frame(&[]), None);
        assert_eq!(session.handle_frame(&[0x33, 0x01, 0x02]), None);
        assert!(session.drain_events().is_empty());
        assert_eq!(session.program_state(), ProgramState::Started);
    }
}

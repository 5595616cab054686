use std::collections::BTreeMap;
use std::fmt;

use crate::protocol::{ELECTRODE_MAX, ELECTRODE_MIN};

/// Link lifecycle, driven by transport events.
///
/// ```text
/// Disconnected → Connecting → Discovering → Ready
///        ↑                                    │
///        └──────────── disconnect ────────────┘
/// ```
///
/// `Error` is entered only when the transport reports that establishing the
/// link failed.  A device-reported error never changes this state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Discovering,
    Ready,
    Error,
}

/// Device-side program lifecycle, orthogonal to [`ConnectionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgramState {
    #[default]
    NotStarted,
    /// Program start acknowledged by the device.
    Started,
    /// A measurement request has been written; data frames are expected.
    Measuring,
    /// All 32 electrodes delivered a full narrow pulse buffer.
    Completed,
    /// The last program operation failed.
    Error,
}

/// One of the 32 physical measurement channels, numbered 1–32 as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ElectrodeId(u8);

impl ElectrodeId {
    /// Returns `None` for numbers outside 1–32.
    pub fn new(number: u8) -> Option<Self> {
        (ELECTRODE_MIN..=ELECTRODE_MAX)
            .contains(&number)
            .then_some(Self(number))
    }

    /// The wire electrode number (1–32).
    pub fn get(self) -> u8 {
        self.0
    }

    /// Iterate all 32 electrodes in ascending order.
    pub fn all() -> impl Iterator<Item = ElectrodeId> {
        (ELECTRODE_MIN..=ELECTRODE_MAX).map(Self)
    }
}

impl fmt::Display for ElectrodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{:02}", self.0)
    }
}

/// Final impedance value per electrode for one finished measurement session.
pub type MeasurementResults = BTreeMap<ElectrodeId, f64>;

/// Command that a device-reported error refers to (byte 1 of an `0xF0` frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderCategory {
    ProgramStart,
    ProgramEnd,
    MeasurementCommand,
    SpecificStimulus,
    Unknown,
}

/// Subsystem that raised a device-reported error (byte 2 of an `0xF0` frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Cfx,
    DataProcessing,
    Sensor,
    RfPmic,
    FpgaComm,
    FpgaSetting,
    InternalDevice,
    Protocol,
    Pcm,
    Unknown,
}

/// A decoded device-reported error.
///
/// Produced by [`crate::error_codes::decode_error_frame`] and surfaced as
/// [`SessionError::Device`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub header_category: HeaderCategory,
    pub error_class: ErrorClass,
    /// Raw detail byte (byte 3 of the frame).
    pub detail_code: u8,
    /// Human-readable detail resolved from the per-class table.
    pub detail_text: &'static str,
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} / {:?} (detail 0x{:02x}): {}",
            self.header_category, self.error_class, self.detail_code, self.detail_text
        )
    }
}

/// Failures surfaced through [`SessionEvent::Error`].
///
/// Every variant except [`SessionError::ConnectFailed`] leaves the
/// connection state untouched and moves the program state to
/// [`ProgramState::Error`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// Structured error reported by the device firmware.
    Device(ErrorReport),
    /// An `0xF0` frame too short to carry category, class and detail.
    MalformedErrorFrame(Vec<u8>),
    /// A program start/end acknowledgement that did not report success.
    Handshake(String),
    /// Writing a command to the transport failed.
    Transport(String),
    /// The transport could not establish the link.
    ConnectFailed(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(report) => write!(f, "device error: {report}"),
            Self::MalformedErrorFrame(raw) => {
                write!(f, "unrecognized error frame: {raw:02x?}")
            }
            Self::Handshake(msg) => write!(f, "handshake failed: {msg}"),
            Self::Transport(msg) => write!(f, "transport error: {msg}"),
            Self::ConnectFailed(msg) => write!(f, "connect failed: {msg}"),
        }
    }
}

/// All events emitted by [`crate::client::BiozClient`].
///
/// Consumers receive these values through the `mpsc::Receiver` returned by
/// [`crate::client::BiozClient::attach`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Informational text (acks, progress).
    Message(String),
    /// Either state variable changed.  Carries both current values.
    StateChanged {
        connection: ConnectionState,
        program: ProgramState,
    },
    /// A valid inner-device-id response was received.
    InnerDeviceId(String),
    /// A measurement session finished.  Fired once per session.
    MeasurementComplete(MeasurementResults),
    /// A program operation failed.
    Error(SessionError),
}

impl SessionEvent {
    /// `true` for events after which the link is gone: a drop to
    /// [`ConnectionState::Disconnected`] or a failed connect.
    pub fn is_link_lost(&self) -> bool {
        matches!(
            self,
            Self::StateChanged {
                connection: ConnectionState::Disconnected,
                ..
            } | Self::Error(SessionError::ConnectFailed(_))
        )
    }
}

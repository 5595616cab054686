//! Wire constants and command encoders for the bio-impedance device.
//!
//! The device speaks a header-byte protocol in both directions.  Commands
//! written by the host are single opcodes, except the measurement request
//! which carries an opaque stimulus payload:
//!
//! | Opcode | Command | Response header |
//! |---|---|---|
//! | `0x60` | program start | `0x60` (ack) |
//! | `0x61` | program end | `0x61` (ack) |
//! | `0x62` | measurement request | `0x62` (measurement data, many frames) |
//! | `0x91` | inner-device-id request | `0x91` (4-byte id) |
//! | n/a | n/a | `0xF0` (device-reported error) |

use std::time::Duration;

use crate::error::{Error, Result};

// ── Headers ──────────────────────────────────────────────────────────────────

/// Program start command / acknowledgement header.
pub const HEADER_PROGRAM_START: u8 = 0x60;

/// Program end command / acknowledgement header.
pub const HEADER_PROGRAM_END: u8 = 0x61;

/// Measurement request command / measurement data header.
pub const HEADER_MEASUREMENT: u8 = 0x62;

/// Inner-device-id request / response header.
pub const HEADER_INNER_DEVICE_ID: u8 = 0x91;

/// Device-reported error header.
pub const HEADER_ERROR: u8 = 0xF0;

/// Status byte carried at offset 1 of a successful program start/end ack.
pub const ACK_OK: u8 = 0x01;

// ── Electrodes ───────────────────────────────────────────────────────────────

/// Number of physical measurement channels.
pub const ELECTRODE_COUNT: usize = 32;

/// Lowest valid electrode number on the wire.
pub const ELECTRODE_MIN: u8 = 1;

/// Highest valid electrode number on the wire.
pub const ELECTRODE_MAX: u8 = 32;

// ── Measurement constants ────────────────────────────────────────────────────

/// Samples collected per electrode per pulse class when the caller does not
/// choose a repetition count.
pub const DEFAULT_REPETITION_COUNT: u8 = 10;

/// Calibration offset subtracted from both the narrow and wide pulse means.
///
/// `narrow_avg = mean(narrow[1..]) − IMPEDANCE_OFFSET`, same for wide.
pub const IMPEDANCE_OFFSET: f64 = 20.0;

/// Interval between writing the program start command and writing the
/// inner-device-id request.  The firmware is not guaranteed to accept the id
/// request before it has processed the start command.
pub const PROGRAM_SETTLE_INTERVAL: Duration = Duration::from_secs(1);

/// Placeholder reported as the inner device id while none is known.
pub const INNER_DEVICE_ID_SENTINEL: &str = "--------";

/// Exact length of a valid inner-device-id response (header + 4 id bytes).
pub const INNER_DEVICE_ID_FRAME_LEN: usize = 5;

// ── Command encoders ─────────────────────────────────────────────────────────

/// Encode the program start command.
///
/// ```
/// # use bioz_rs::protocol::encode_program_start;
/// assert_eq!(encode_program_start(), vec![0x60]);
/// ```
pub fn encode_program_start() -> Vec<u8> {
    vec![HEADER_PROGRAM_START]
}

/// Encode the program end command.
pub fn encode_program_end() -> Vec<u8> {
    vec![HEADER_PROGRAM_END]
}

/// Encode the inner-device-id request.
pub fn encode_inner_device_id_request() -> Vec<u8> {
    vec![HEADER_INNER_DEVICE_ID]
}

/// Firmware-defined stimulus parameters.
///
/// The field semantics are owned by the device firmware; this crate only
/// guarantees that `bytes` reach the device in the given order and width,
/// tagged with the payload layout `version`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StimulusPayload {
    /// Payload layout version understood by the firmware.
    pub version: u8,
    /// Raw parameter bytes, copied verbatim.
    pub bytes: Vec<u8>,
}

/// A typed measurement request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementRequest {
    /// Samples per electrode per pulse class.  Must be non-zero.
    pub repeat_count: u8,
    pub stimulus: StimulusPayload,
}

impl Default for MeasurementRequest {
    fn default() -> Self {
        Self {
            repeat_count: DEFAULT_REPETITION_COUNT,
            stimulus: StimulusPayload::default(),
        }
    }
}

impl MeasurementRequest {
    /// Request `repeat_count` samples per pulse class with an empty stimulus payload.
    pub fn with_repeat_count(repeat_count: u8) -> Self {
        Self {
            repeat_count,
            ..Self::default()
        }
    }
}

/// Encode a measurement request.
///
/// ```text
/// byte 0     : 0x62
/// byte 1     : repeat count
/// byte 2     : stimulus payload version
/// bytes 3..  : stimulus payload, verbatim
/// ```
///
/// Returns [`Error::InvalidArgument`] when `repeat_count` is zero.
pub fn encode_measurement_request(request: &MeasurementRequest) -> Result<Vec<u8>> {
    if request.repeat_count == 0 {
        return Err(Error::invalid_argument("repeat count must be positive"));
    }
    let mut frame = Vec::with_capacity(3 + request.stimulus.bytes.len());
    frame.push(HEADER_MEASUREMENT);
    frame.push(request.repeat_count);
    frame.push(request.stimulus.version);
    frame.extend_from_slice(&request.stimulus.bytes);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_opcode_commands() {
        assert_eq!(encode_program_start(), [0x60]);
        assert_eq!(encode_program_end(), [0x61]);
        assert_eq!(encode_inner_device_id_request(), [0x91]);
    }

    #[test]
    fn test_measurement_request_layout() {
        let request = MeasurementRequest {
            repeat_count: 4,
            stimulus: StimulusPayload {
                version: 2,
                bytes: vec![0x12, 0x34, 0x00, 0xff],
            },
        };
        let frame = encode_measurement_request(&request).unwrap();
        assert_eq!(frame, [0x62, 4, 2, 0x12, 0x34, 0x00, 0xff]);
    }

    #[test]
    fn test_measurement_request_default() {
        let frame = encode_measurement_request(&MeasurementRequest::default()).unwrap();
        assert_eq!(frame, [0x62, DEFAULT_REPETITION_COUNT, 0]);
    }

    #[test]
    fn test_measurement_request_rejects_zero_repeat() {
        let err = encode_measurement_request(&MeasurementRequest::with_repeat_count(0));
        assert!(matches!(err, Err(Error::InvalidArgument { .. })));
    }
}

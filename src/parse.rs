//! Decoders for inbound device frames.
//!
//! All public functions in this module are pure (no I/O, no state) and are
//! safe to call from any async or sync context.
//!
//! # Header dispatch
//!
//! [`route_frame`] classifies a frame by its first byte:
//!
//! | Header | Frame |
//! |---|---|
//! | `0x60` | [`Frame::ProgramStartAck`] |
//! | `0x61` | [`Frame::ProgramEndAck`] |
//! | `0x62` | [`Frame::Measurement`] |
//! | `0x91` | [`Frame::InnerDeviceId`] |
//! | `0xF0` | [`Frame::Error`] |
//! | other | [`Frame::Unrecognized`] |
//!
//! # Measurement frames
//!
//! ```text
//! byte 0     : 0x62
//! byte 1     : reserved
//! byte 2     : electrode number (1–32)
//! bytes 3..  : 1–4 interleaved (narrow, wide) u16 big-endian sample pairs
//! ```
//!
//! | Length | Pairs |
//! |---|---|
//! | 7  | 1 |
//! | 11 | 2 |
//! | 15 | 3 |
//! | 19 | 4 |
//!
//! Any other length is not a measurement frame.

use std::fmt::Write as _;

use crate::protocol::{
    HEADER_ERROR, HEADER_INNER_DEVICE_ID, HEADER_MEASUREMENT, HEADER_PROGRAM_END,
    HEADER_PROGRAM_START, INNER_DEVICE_ID_FRAME_LEN,
};
use crate::types::ElectrodeId;

// ── Router ────────────────────────────────────────────────────────────────────

/// An inbound frame classified by header byte.  Payload slices include the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame<'a> {
    ProgramStartAck(&'a [u8]),
    ProgramEndAck(&'a [u8]),
    Measurement(&'a [u8]),
    InnerDeviceId(&'a [u8]),
    Error(&'a [u8]),
    /// Header byte not used by the protocol.
    Unrecognized(u8),
}

/// Classify a frame by its header byte.  Returns `None` for an empty frame.
pub fn route_frame(frame: &[u8]) -> Option<Frame<'_>> {
    let header = *frame.first()?;
    Some(match header {
        HEADER_PROGRAM_START => Frame::ProgramStartAck(frame),
        HEADER_PROGRAM_END => Frame::ProgramEndAck(frame),
        HEADER_MEASUREMENT => Frame::Measurement(frame),
        HEADER_INNER_DEVICE_ID => Frame::InnerDeviceId(frame),
        HEADER_ERROR => Frame::Error(frame),
        other => Frame::Unrecognized(other),
    })
}

// ── Acknowledgements ──────────────────────────────────────────────────────────

/// Status byte of a program start/end acknowledgement (offset 1).
///
/// Returns `None` if the frame is too short to carry one.
pub fn parse_ack_status(frame: &[u8]) -> Option<u8> {
    frame.get(1).copied()
}

// ── Inner device id ───────────────────────────────────────────────────────────

/// Render the 4 id bytes of an inner-device-id response as 8 lowercase hex digits.
///
/// Returns `None` unless the frame is exactly 5 bytes long.
///
/// ```
/// # use bioz_rs::parse::parse_inner_device_id;
/// assert_eq!(
///     parse_inner_device_id(&[0x91, 0x0a, 0xbc, 0x00, 0xff]).as_deref(),
///     Some("0abc00ff"),
/// );
/// assert!(parse_inner_device_id(&[0x91, 0x0a, 0xbc, 0x00]).is_none());
/// ```
pub fn parse_inner_device_id(frame: &[u8]) -> Option<String> {
    if frame.len() != INNER_DEVICE_ID_FRAME_LEN {
        return None;
    }
    let mut id = String::with_capacity(8);
    for byte in &frame[1..] {
        // Writing into a String cannot fail.
        let _ = write!(id, "{byte:02x}");
    }
    Some(id)
}

// ── Measurement data ──────────────────────────────────────────────────────────

/// Byte offset of the first sample pair in a measurement frame.
const FIRST_PAIR_OFFSET: usize = 3;

/// Bytes per (narrow, wide) sample pair.
const PAIR_LEN: usize = 4;

/// Maximum sample pairs carried by one measurement frame.
pub const MAX_PAIRS_PER_FRAME: usize = 4;

/// One narrow-pulse and one wide-pulse raw sample for the same electrode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplePair {
    pub narrow: u16,
    pub wide: u16,
}

/// A decoded measurement frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementFrame {
    pub electrode: ElectrodeId,
    /// Pairs in arrival order.
    pub pairs: Vec<SamplePair>,
}

/// Number of sample pairs implied by a measurement frame length.
///
/// Only 7, 11, 15 and 19 are valid.
pub fn pair_count_for_len(len: usize) -> Option<usize> {
    match len {
        7 | 11 | 15 | 19 => Some((len - FIRST_PAIR_OFFSET) / PAIR_LEN),
        _ => None,
    }
}

/// Decode a `0x62` measurement frame.
///
/// Returns `None` for an invalid length or an electrode number outside 1–32;
/// such frames must be discarded without touching any buffer.
pub fn parse_measurement_frame(frame: &[u8]) -> Option<MeasurementFrame> {
    if frame.first() != Some(&HEADER_MEASUREMENT) {
        return None;
    }
    let count = pair_count_for_len(frame.len())?;
    let electrode = ElectrodeId::new(frame[2])?;
    let pairs = frame[FIRST_PAIR_OFFSET..]
        .chunks_exact(PAIR_LEN)
        .take(count)
        .map(|c| SamplePair {
            narrow: u16::from_be_bytes([c[0], c[1]]),
            wide: u16::from_be_bytes([c[2], c[3]]),
        })
        .collect();
    Some(MeasurementFrame { electrode, pairs })
}

/// Build a measurement frame as the device would send it.
///
/// Used by the [`crate::sim`] device.  Returns `None` unless
/// `pairs` holds 1–4 entries.
pub fn encode_measurement_frame(electrode: ElectrodeId, pairs: &[SamplePair]) -> Option<Vec<u8>> {
    if pairs.is_empty() || pairs.len() > MAX_PAIRS_PER_FRAME {
        return None;
    }
    let mut frame = Vec::with_capacity(FIRST_PAIR_OFFSET + pairs.len() * PAIR_LEN);
    frame.extend_from_slice(&[HEADER_MEASUREMENT, 0x00, electrode.get()]);
    for pair in pairs {
        frame.extend_from_slice(&pair.narrow.to_be_bytes());
        frame.extend_from_slice(&pair.wide.to_be_bytes());
    }
    Some(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn electrode(n: u8) -> ElectrodeId {
        ElectrodeId::new(n).unwrap()
    }

    #[test]
    fn test_route_by_header() {
        assert_eq!(route_frame(&[]), None);
        assert!(matches!(route_frame(&[0x60, 0x01]), Some(Frame::ProgramStartAck(_))));
        assert!(matches!(route_frame(&[0x61, 0x01]), Some(Frame::ProgramEndAck(_))));
        assert!(matches!(route_frame(&[0x62]), Some(Frame::Measurement(_))));
        assert!(matches!(route_frame(&[0x91]), Some(Frame::InnerDeviceId(_))));
        assert!(matches!(route_frame(&[0xF0]), Some(Frame::Error(_))));
        assert_eq!(route_frame(&[0x42, 0x00]), Some(Frame::Unrecognized(0x42)));
    }

    #[test]
    fn test_pair_count_table() {
        assert_eq!(pair_count_for_len(7), Some(1));
        assert_eq!(pair_count_for_len(11), Some(2));
        assert_eq!(pair_count_for_len(15), Some(3));
        assert_eq!(pair_count_for_len(19), Some(4));
        for len in [0, 3, 6, 8, 10, 12, 18, 20, 23] {
            assert_eq!(pair_count_for_len(len), None, "len {len}");
        }
    }

    #[test]
    fn test_offsets_match_length_table() {
        // Pair i occupies bytes 3+4i..=6+4i: narrow first, then wide.
        for count in 1..=MAX_PAIRS_PER_FRAME {
            let pairs: Vec<SamplePair> = (0..count as u16)
                .map(|i| SamplePair {
                    narrow: 0x1000 + i,
                    wide: 0x2000 + i,
                })
                .collect();
            let frame = encode_measurement_frame(electrode(5), &pairs).unwrap();
            assert_eq!(frame.len(), 3 + 4 * count);
            for (i, pair) in pairs.iter().enumerate() {
                let off = 3 + 4 * i;
                assert_eq!(frame[off..off + 2], pair.narrow.to_be_bytes());
                assert_eq!(frame[off + 2..off + 4], pair.wide.to_be_bytes());
            }
            let decoded = parse_measurement_frame(&frame).unwrap();
            assert_eq!(decoded.electrode, electrode(5));
            assert_eq!(decoded.pairs, pairs);
        }
    }

    #[test]
    fn test_measurement_big_endian() {
        let frame = [0x62, 0xaa, 0x20, 0x01, 0x02, 0xff, 0xfe];
        let decoded = parse_measurement_frame(&frame).unwrap();
        assert_eq!(decoded.electrode.get(), 32);
        assert_eq!(
            decoded.pairs,
            vec![SamplePair {
                narrow: 0x0102,
                wide: 0xfffe
            }]
        );
    }

    #[test]
    fn test_measurement_rejects_bad_electrode_and_length() {
        assert!(parse_measurement_frame(&[0x62, 0, 0, 0, 1, 0, 1]).is_none());
        assert!(parse_measurement_frame(&[0x62, 0, 33, 0, 1, 0, 1]).is_none());
        assert!(parse_measurement_frame(&[0x62, 0, 1, 0, 1, 0, 1, 0]).is_none());
        assert!(parse_measurement_frame(&[0x62, 0, 1]).is_none());
    }

    #[test]
    fn test_inner_device_id() {
        assert_eq!(
            parse_inner_device_id(&[0x91, 0xde, 0xad, 0xbe, 0xef]).as_deref(),
            Some("deadbeef")
        );
        assert!(parse_inner_device_id(&[0x91, 0xde, 0xad, 0xbe, 0xef, 0x00]).is_none());
        assert!(parse_inner_device_id(&[0x91]).is_none());
    }

    #[test]
    fn test_ack_status() {
        assert_eq!(parse_ack_status(&[0x60, 0x01]), Some(0x01));
        assert_eq!(parse_ack_status(&[0x60]), None);
    }
}

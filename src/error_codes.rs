//! Decoder for device-reported error frames (header `0xF0`).
//!
//! ```text
//! byte 0 : 0xF0
//! byte 1 : header category (command the error refers to)
//! byte 2 : error class     (subsystem that failed)
//! byte 3 : detail code     (looked up in the per-class table below)
//! ```
//!
//! Detail strings live in static tables keyed by class; adding a code is a
//! data change only.  Class `0x01` (CFX) carries no detail table.
//!
//! Only firmware-documented codes are listed.  Every other class/detail pair
//! resolves to [`UNKNOWN_DETAIL`] and keeps its raw `detail_code` in the
//! [`ErrorReport`].

use crate::protocol::{
    HEADER_ERROR, HEADER_MEASUREMENT, HEADER_PROGRAM_END, HEADER_PROGRAM_START,
};
use crate::types::{ErrorClass, ErrorReport, HeaderCategory};

/// Header byte of the stimulus-specific command family.
const HEADER_SPECIFIC_STIMULUS: u8 = 0x90;

/// Minimum length of a decodable error frame.
pub const ERROR_FRAME_MIN_LEN: usize = 4;

/// Detail text for codes missing from a class table.
pub const UNKNOWN_DETAIL: &str = "unknown detail";

/// Detail text for classes that define no detail codes.
pub const NO_DETAIL: &str = "no detail";

// ── Detail tables ─────────────────────────────────────────────────────────────

type DetailTable = &'static [(u8, &'static str)];

const DATA_PROCESSING_DETAILS: DetailTable = &[(0x01, "unavailable map data")];

/// Placeholder for classes whose detail codes are not yet documented.
const UNDOCUMENTED: DetailTable = &[];

/// Class code → (class, detail table).  `None` means the class has no table.
const CLASS_TABLE: &[(u8, ErrorClass, Option<DetailTable>)] = &[
    (0x01, ErrorClass::Cfx, None),
    (0x02, ErrorClass::DataProcessing, Some(DATA_PROCESSING_DETAILS)),
    (0x03, ErrorClass::Sensor, Some(UNDOCUMENTED)),
    (0x04, ErrorClass::RfPmic, Some(UNDOCUMENTED)),
    (0x05, ErrorClass::FpgaComm, Some(UNDOCUMENTED)),
    (0x06, ErrorClass::FpgaSetting, Some(UNDOCUMENTED)),
    (0x07, ErrorClass::InternalDevice, Some(UNDOCUMENTED)),
    (0x08, ErrorClass::Protocol, Some(UNDOCUMENTED)),
    (0x09, ErrorClass::Pcm, Some(UNDOCUMENTED)),
];

// ── Lookups ───────────────────────────────────────────────────────────────────

impl HeaderCategory {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            HEADER_PROGRAM_START => Self::ProgramStart,
            HEADER_PROGRAM_END => Self::ProgramEnd,
            HEADER_MEASUREMENT => Self::MeasurementCommand,
            HEADER_SPECIFIC_STIMULUS => Self::SpecificStimulus,
            _ => Self::Unknown,
        }
    }
}

impl ErrorClass {
    pub fn from_byte(byte: u8) -> Self {
        CLASS_TABLE
            .iter()
            .find(|(code, _, _)| *code == byte)
            .map_or(Self::Unknown, |(_, class, _)| *class)
    }
}

/// Resolve the detail text for a raw class byte and detail byte.
///
/// Unknown classes and unmapped codes yield [`UNKNOWN_DETAIL`]; classes
/// without a table yield [`NO_DETAIL`].
pub fn detail_text(class_code: u8, detail_code: u8) -> &'static str {
    match CLASS_TABLE.iter().find(|(code, _, _)| *code == class_code) {
        Some((_, _, None)) => NO_DETAIL,
        Some((_, _, Some(table))) => table
            .iter()
            .find(|(code, _)| *code == detail_code)
            .map_or(UNKNOWN_DETAIL, |(_, text)| *text),
        None => UNKNOWN_DETAIL,
    }
}

/// Decode an `0xF0` error frame.
///
/// Returns `None` when the frame is not an error frame or is shorter than
/// [`ERROR_FRAME_MIN_LEN`]; the caller reports that case as an
/// unrecognized error frame.  Bytes past offset 3 are ignored.
pub fn decode_error_frame(frame: &[u8]) -> Option<ErrorReport> {
    if frame.len() < ERROR_FRAME_MIN_LEN || frame[0] != HEADER_ERROR {
        return None;
    }
    Some(ErrorReport {
        header_category: HeaderCategory::from_byte(frame[1]),
        error_class: ErrorClass::from_byte(frame[2]),
        detail_code: frame[3],
        detail_text: detail_text(frame[2], frame[3]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_measurement_data_processing_error() {
        let report = decode_error_frame(&[0xF0, 0x62, 0x02, 0x01]).unwrap();
        assert_eq!(report.header_category, HeaderCategory::MeasurementCommand);
        assert_eq!(report.error_class, ErrorClass::DataProcessing);
        assert_eq!(report.detail_code, 0x01);
        assert_eq!(report.detail_text, "unavailable map data");
    }

    #[test]
    fn test_header_categories() {
        assert_eq!(HeaderCategory::from_byte(0x60), HeaderCategory::ProgramStart);
        assert_eq!(HeaderCategory::from_byte(0x61), HeaderCategory::ProgramEnd);
        assert_eq!(HeaderCategory::from_byte(0x90), HeaderCategory::SpecificStimulus);
        assert_eq!(HeaderCategory::from_byte(0x91), HeaderCategory::Unknown);
    }

    #[test]
    fn test_all_known_classes() {
        let expected = [
            ErrorClass::Cfx,
            ErrorClass::DataProcessing,
            ErrorClass::Sensor,
            ErrorClass::RfPmic,
            ErrorClass::FpgaComm,
            ErrorClass::FpgaSetting,
            ErrorClass::InternalDevice,
            ErrorClass::Protocol,
            ErrorClass::Pcm,
        ];
        for (code, class) in (0x01u8..=0x09).zip(expected) {
            assert_eq!(ErrorClass::from_byte(code), class);
        }
        assert_eq!(ErrorClass::from_byte(0x00), ErrorClass::Unknown);
        assert_eq!(ErrorClass::from_byte(0x0a), ErrorClass::Unknown);
    }

    #[test]
    fn test_cfx_always_no_detail() {
        for detail in [0x00, 0x01, 0x7f, 0xff] {
            let report = decode_error_frame(&[0xF0, 0x60, 0x01, detail]).unwrap();
            assert_eq!(report.error_class, ErrorClass::Cfx);
            assert_eq!(report.detail_text, NO_DETAIL);
        }
    }

    #[test]
    fn test_unmapped_detail() {
        let report = decode_error_frame(&[0xF0, 0x61, 0x03, 0xee]).unwrap();
        assert_eq!(report.error_class, ErrorClass::Sensor);
        assert_eq!(report.detail_text, UNKNOWN_DETAIL);

        let report = decode_error_frame(&[0xF0, 0x55, 0x42, 0x01]).unwrap();
        assert_eq!(report.header_category, HeaderCategory::Unknown);
        assert_eq!(report.error_class, ErrorClass::Unknown);
        assert_eq!(report.detail_text, UNKNOWN_DETAIL);
    }

    #[test]
    fn test_undocumented_details_stay_unknown() {
        for class in 0x03u8..=0x09 {
            let report = decode_error_frame(&[0xF0, 0x62, class, 0x01]).unwrap();
            assert_eq!(report.detail_text, UNKNOWN_DETAIL, "class 0x{class:02x}");
            assert_eq!(report.detail_code, 0x01);
        }
        assert_eq!(detail_text(0x02, 0x02), UNKNOWN_DETAIL);
    }

    #[test]
    fn test_short_frame_rejected() {
        assert!(decode_error_frame(&[0xF0, 0x62, 0x02]).is_none());
        assert!(decode_error_frame(&[0xF0]).is_none());
        assert!(decode_error_frame(&[0x62, 0x62, 0x02, 0x01]).is_none());
    }

    #[test]
    fn test_detail_tables_have_unique_codes() {
        for (_, class, table) in CLASS_TABLE {
            if let Some(table) = table {
                let mut codes: Vec<u8> = table.iter().map(|(c, _)| *c).collect();
                codes.sort_unstable();
                codes.dedup();
                assert_eq!(codes.len(), table.len(), "duplicate code in {class:?}");
            }
        }
    }
}

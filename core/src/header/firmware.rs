//! Firmware version string

use crate::layout::FIRMWARE_VERSION_LEN;

/// Decode the firmware version field
///
/// The field is NUL-terminated ASCII of at most 16 bytes. A missing
/// terminator is not an error: the string is cut at the field length.
/// Decoding also stops at the first non-printable byte.
pub fn parse_firmware_version(field: &[u8]) -> String {
    field
        .iter()
        .take(FIRMWARE_VERSION_LEN)
        .take_while(|&&b| b != 0 && (0x20..0x7F).contains(&b))
        .map(|&b| b as char)
        .collect()
}

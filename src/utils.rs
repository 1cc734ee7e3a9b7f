//! Utility functions for hex and UTF-16 conversion.

use byteorder::{LittleEndian, WriteBytesExt};
use encoding_rs::{Encoding, UTF_16LE};

/// UTF-16LE byte order mark.
pub const UTF16LE_BOM: [u8; 2] = [0xFF, 0xFE];

/// Parses a hexadecimal integer with an optional `0x` prefix.
pub fn parse_hex_integer(text: &str) -> Option<u64> {
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

/// Encodes a string as UTF-16LE bytes (no terminator, no BOM).
pub fn encode_utf16le(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2);
    for unit in s.encode_utf16() {
        // Writing to a Vec cannot fail.
        let _ = out.write_u16::<LittleEndian>(unit);
    }
    out
}

/// Encodes text as a UTF-16LE document with a leading BOM.
pub fn encode_utf16le_document(s: &str) -> Vec<u8> {
    let mut out = UTF16LE_BOM.to_vec();
    out.extend(encode_utf16le(s));
    out
}

/// Decodes a text file, sniffing a UTF-8/UTF-16 BOM and falling back to
/// UTF-16LE (what the export tool writes) when none is present.
///
/// Returns the decoded text and whether malformed sequences were replaced.
pub fn decode_document(data: &[u8]) -> (String, bool) {
    if let Some((encoding, bom_len)) = Encoding::for_bom(data) {
        let (decoded, had_errors) = encoding.decode_without_bom_handling(&data[bom_len..]);
        return (decoded.into_owned(), had_errors);
    }
    let (decoded, had_errors) = UTF_16LE.decode_without_bom_handling(data);
    (decoded.into_owned(), had_errors)
}

/// Decodes UTF-16LE bytes into a string, trimming trailing NUL terminators.
pub fn decode_utf16le(data: &[u8]) -> Option<String> {
    if data.len() % 2 != 0 {
        return None;
    }
    let (decoded, had_errors) = UTF_16LE.decode_without_bom_handling(data);
    if had_errors {
        return None;
    }
    Some(decoded.trim_end_matches('\0').to_string())
}

/// Formats bytes as lowercase comma-separated hex pairs (`0a,ff,00`).
pub fn comma_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(",")
}

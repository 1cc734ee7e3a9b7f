//! Registry export documents (`.reg` text format).
//!
//! ```text
//! Windows Registry Editor Version 5.00
//!
//! [-HKEY_CURRENT_USER\Old]
//!
//! [HKEY_CURRENT_USER\Foo]
//! "Name"="text"
//! @="default value"
//! "Count"=dword:00000005
//! "Big"=hex(b):05,00,00,00,00,00,00,00
//! "Gone"=-
//! ```
//!
//! Rendering is used to apply a plan through a single import; parsing reads
//! documents produced by the export tool. Files are UTF-16LE with a BOM.

use crate::error::{RegistryError, Result};
use crate::key::KeyPath;
use crate::plan::{ExecutionPlan, ExecutionStep};
use crate::state::RegistryStruct;
use crate::utils::{comma_hex, encode_utf16le, parse_hex_integer};
use crate::value::{is_default_name, RegistryValue, DEFAULT_VALUE_NAME};
use byteorder::{ByteOrder, LittleEndian};
use encoding_rs::UTF_16LE;

/// First line of a version 5 document.
pub const DOCUMENT_HEADER: &str = "Windows Registry Editor Version 5.00";

/// First line of a legacy (ANSI) document.
pub const LEGACY_HEADER: &str = "REGEDIT4";

const CRLF: &str = "\r\n";

/// A parsed document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedDocument {
    /// Keys and values the document sets.
    pub data: RegistryStruct,
    /// `[-key]` sections.
    pub deleted_keys: Vec<KeyPath>,
    /// `"name"=-` entries.
    pub deleted_values: Vec<(KeyPath, String)>,
}

/// One `[key]` or `[-key]` block.
struct Section {
    key: KeyPath,
    delete: bool,
    lines: Vec<String>,
}

/// Renders a plan as one document.
///
/// Steps are grouped into sections in plan order; consecutive steps on the
/// same key share a section, and a key deletion always starts a new one.
///
/// # Errors
///
/// Returns `InvalidSyntax` for names, key paths or strings the line format
/// cannot represent.
pub fn render_plan(plan: &ExecutionPlan) -> Result<String> {
    let mut sections: Vec<Section> = Vec::new();

    for step in plan.steps() {
        match step {
            ExecutionStep::Delete { key, value: None } => {
                sections.push(Section {
                    key: key.clone(),
                    delete: true,
                    lines: Vec::new(),
                });
            }
            ExecutionStep::Delete { key, value: Some(name) } => {
                let line = format!("{}=-", encode_name(name)?);
                section_for(&mut sections, key).push(line);
            }
            ExecutionStep::Add { key, value } => {
                let lines = section_for(&mut sections, key);
                if let Some((name, value)) = value {
                    lines.push(encode_value_line(name, value)?);
                }
            }
        }
    }

    render_sections(&sections)
}

/// Renders a whole structure as a document that creates every key and value.
pub fn render_struct(data: &RegistryStruct) -> Result<String> {
    let mut sections = Vec::with_capacity(data.len());
    for (key, values) in data {
        let lines = values
            .iter()
            .map(|(name, value)| encode_value_line(name, value))
            .collect::<Result<Vec<_>>>()?;
        sections.push(Section {
            key: key.clone(),
            delete: false,
            lines,
        });
    }
    render_sections(&sections)
}

fn section_for<'a>(sections: &'a mut Vec<Section>, key: &KeyPath) -> &'a mut Vec<String> {
    let reuse = matches!(sections.last(), Some(last) if !last.delete && last.key == *key);
    if !reuse {
        sections.push(Section {
            key: key.clone(),
            delete: false,
            lines: Vec::new(),
        });
    }
    let last = sections.len() - 1;
    &mut sections[last].lines
}

fn render_sections(sections: &[Section]) -> Result<String> {
    let mut out = String::from(DOCUMENT_HEADER);
    out.push_str(CRLF);
    out.push_str(CRLF);
    for section in sections {
        let marker = if section.delete { "-" } else { "" };
        out.push_str(&format!("[{}{}]", marker, encode_key(&section.key)?));
        out.push_str(CRLF);
        for line in &section.lines {
            out.push_str(line);
            out.push_str(CRLF);
        }
        out.push_str(CRLF);
    }
    Ok(out)
}

fn encode_key(key: &KeyPath) -> Result<&str> {
    let text = key.as_str();
    if text.contains(['\r', '\n']) {
        return Err(RegistryError::InvalidSyntax(format!(
            "key path {:?} cannot be written to a document",
            text
        )));
    }
    Ok(text)
}

fn encode_name(name: &str) -> Result<String> {
    if is_default_name(name) {
        Ok(String::from("@"))
    } else {
        quote(name)
    }
}

fn quote(s: &str) -> Result<String> {
    if s.contains(['\r', '\n']) {
        return Err(RegistryError::InvalidSyntax(format!(
            "{:?} contains a line break",
            s
        )));
    }
    Ok(format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")))
}

/// Encodes one `name=data` line.
pub fn encode_value_line(name: &str, value: &RegistryValue) -> Result<String> {
    let data = match value {
        RegistryValue::String(s) => quote(s)?,
        RegistryValue::Dword(n) => format!("dword:{:08x}", n),
        RegistryValue::Qword(n) => format!("hex(b):{}", comma_hex(&n.to_le_bytes())),
        RegistryValue::ExpandString(s) => {
            let mut bytes = encode_utf16le(s);
            bytes.extend([0, 0]);
            format!("hex(2):{}", comma_hex(&bytes))
        }
        RegistryValue::MultiString(items) => {
            let mut bytes = Vec::new();
            for item in items {
                bytes.extend(encode_utf16le(item));
                bytes.extend([0, 0]);
            }
            bytes.extend([0, 0]);
            format!("hex(7):{}", comma_hex(&bytes))
        }
        RegistryValue::Binary(bytes) => format!("hex:{}", comma_hex(bytes)),
        RegistryValue::None(bytes) => format!("hex(0):{}", comma_hex(bytes)),
    };
    Ok(format!("{}={}", encode_name(name)?, data))
}

/// Returns true once `text` is a complete document: it starts with a known
/// header and ends with the blank line that closes the last section.
pub fn is_complete_document(text: &str) -> bool {
    let body = text.trim_start_matches('\u{feff}');
    (body.starts_with(DOCUMENT_HEADER) || body.starts_with(LEGACY_HEADER))
        && (body.ends_with("\r\n\r\n") || body.ends_with("\n\n"))
}

/// Parses a document.
///
/// # Errors
///
/// Returns `MalformedLine` for a missing header, a value line outside of a
/// section, or data that does not decode, and `UnknownValueType` for
/// unsupported `hex(N)` types.
pub fn parse_document(text: &str) -> Result<ParsedDocument> {
    let body = text.trim_start_matches('\u{feff}');
    let mut lines = logical_lines(body).into_iter();

    match lines.next() {
        Some(header) if matches!(header.trim(), DOCUMENT_HEADER | LEGACY_HEADER) => {}
        Some(other) => return Err(RegistryError::malformed_line(&other, "missing document header")),
        None => return Err(RegistryError::malformed_line("", "empty document")),
    }

    let mut doc = ParsedDocument::default();
    let mut current: Option<KeyPath> = None;

    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(';') {
            continue;
        }
        if let Some(inner) = trimmed.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            if let Some(deleted) = inner.strip_prefix('-') {
                doc.deleted_keys.push(KeyPath::new(deleted));
                current = None;
            } else {
                let key = KeyPath::new(inner);
                doc.data.insert_key(key.clone());
                current = Some(key);
            }
            continue;
        }

        let key = current
            .clone()
            .ok_or_else(|| RegistryError::malformed_line(&line, "value outside of a key section"))?;
        let (name, data) = split_value_line(trimmed)?;
        if data == "-" {
            doc.deleted_values.push((key, name));
        } else {
            let value = decode_data(data, trimmed)?;
            doc.data.insert_value(key, name, value);
        }
    }

    Ok(doc)
}

/// Splits text into lines and joins `\`-continued hex data.
fn logical_lines(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut pending: Option<String> = None;

    for raw in text.lines() {
        let piece = match pending.take() {
            Some(mut acc) => {
                acc.push_str(raw.trim_start());
                acc
            }
            None => raw.to_string(),
        };
        let continues = !piece.trim_start().starts_with('[') && piece.trim_end().ends_with('\\');
        if continues {
            let trimmed = piece.trim_end();
            pending = Some(trimmed[..trimmed.len() - 1].to_string());
        } else {
            out.push(piece);
        }
    }
    if let Some(rest) = pending {
        out.push(rest);
    }
    out
}

fn split_value_line(line: &str) -> Result<(String, &str)> {
    if let Some(rest) = line.strip_prefix('@') {
        let data = rest
            .strip_prefix('=')
            .ok_or_else(|| RegistryError::malformed_line(line, "expected '=' after '@'"))?;
        return Ok((DEFAULT_VALUE_NAME.to_string(), data));
    }
    let (name, rest) = read_quoted(line)?;
    let data = rest
        .strip_prefix('=')
        .ok_or_else(|| RegistryError::malformed_line(line, "expected '=' after value name"))?;
    Ok((name, data))
}

/// Reads a leading quoted string, returning it unescaped and the remainder.
fn read_quoted(s: &str) -> Result<(String, &str)> {
    let body = s
        .strip_prefix('"')
        .ok_or_else(|| RegistryError::malformed_line(s, "expected '\"'"))?;
    let mut out = String::new();
    let mut chars = body.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some((_, escaped)) => out.push(escaped),
                None => break,
            },
            '"' => return Ok((out, &body[i + 1..])),
            other => out.push(other),
        }
    }
    Err(RegistryError::malformed_line(s, "unterminated string"))
}

fn decode_data(data: &str, line: &str) -> Result<RegistryValue> {
    if data.starts_with('"') {
        let (s, rest) = read_quoted(data)?;
        if !rest.trim().is_empty() {
            return Err(RegistryError::malformed_line(line, "trailing text after string"));
        }
        return Ok(RegistryValue::String(s));
    }
    if let Some(hex) = data.strip_prefix("dword:") {
        let n = parse_hex_integer(hex)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| RegistryError::malformed_line(line, "invalid dword"))?;
        return Ok(RegistryValue::Dword(n));
    }
    let (type_tag, list) = if let Some(list) = data.strip_prefix("hex:") {
        ("3", list)
    } else if let Some(rest) = data.strip_prefix("hex(") {
        rest.split_once("):")
            .ok_or_else(|| RegistryError::malformed_line(line, "unterminated hex type"))?
    } else {
        return Err(RegistryError::malformed_line(line, "unrecognised value data"));
    };

    let bytes = parse_comma_hex(list).ok_or_else(|| RegistryError::malformed_line(line, "invalid hex byte list"))?;
    match type_tag.to_ascii_lowercase().as_str() {
        "0" => Ok(RegistryValue::None(bytes)),
        "1" => Ok(RegistryValue::String(utf16_text(&bytes, line)?.trim_end_matches('\0').to_string())),
        "2" => Ok(RegistryValue::ExpandString(
            utf16_text(&bytes, line)?.trim_end_matches('\0').to_string(),
        )),
        "3" => Ok(RegistryValue::Binary(bytes)),
        "4" => {
            if bytes.len() != 4 {
                return Err(RegistryError::malformed_line(line, "hex(4) needs 4 bytes"));
            }
            Ok(RegistryValue::Dword(LittleEndian::read_u32(&bytes)))
        }
        "7" => Ok(RegistryValue::MultiString(decode_multi_string(&utf16_text(&bytes, line)?))),
        "b" => {
            if bytes.len() != 8 {
                return Err(RegistryError::malformed_line(line, "hex(b) needs 8 bytes"));
            }
            Ok(RegistryValue::Qword(LittleEndian::read_u64(&bytes)))
        }
        other => Err(RegistryError::UnknownValueType {
            type_name: format!("hex({})", other),
            line: line.to_string(),
        }),
    }
}

fn parse_comma_hex(list: &str) -> Option<Vec<u8>> {
    let list = list.trim();
    if list.is_empty() {
        return Some(Vec::new());
    }
    list.split(',')
        .map(|b| u8::from_str_radix(b.trim(), 16).ok())
        .collect()
}

fn utf16_text(bytes: &[u8], line: &str) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(RegistryError::malformed_line(line, "odd UTF-16 byte count"));
    }
    let (text, had_errors) = UTF_16LE.decode_without_bom_handling(bytes);
    if had_errors {
        return Err(RegistryError::malformed_line(line, "invalid UTF-16 data"));
    }
    Ok(text.into_owned())
}

/// Splits `item\0item\0\0`; a lone terminator is the empty list.
fn decode_multi_string(text: &str) -> Vec<String> {
    if text.is_empty() || text == "\0" {
        return Vec::new();
    }
    let body = text.strip_suffix('\0').unwrap_or(text);
    let body = body.strip_suffix('\0').unwrap_or(body);
    body.split('\0').map(str::to_string).collect()
}

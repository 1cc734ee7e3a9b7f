//! Registry value types and decoding of `reg query` value payloads.

use crate::error::{RegistryError, Result};
use crate::utils::parse_hex_integer;

/// Name reserved for a key's default (unnamed) value.
pub const DEFAULT_VALUE_NAME: &str = "(Default)";

/// Payload `reg query` prints for a default value that was never assigned.
pub const VALUE_NOT_SET: &str = "(value not set)";

/// Registry value data types supported by the tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ValueType {
    /// No value type.
    #[cfg_attr(feature = "serde", serde(rename = "REG_NONE"))]
    None,

    /// String.
    #[cfg_attr(feature = "serde", serde(rename = "REG_SZ"))]
    String,

    /// String with environment variables.
    #[cfg_attr(feature = "serde", serde(rename = "REG_EXPAND_SZ"))]
    ExpandString,

    /// Binary data.
    #[cfg_attr(feature = "serde", serde(rename = "REG_BINARY"))]
    Binary,

    /// 32-bit integer.
    #[cfg_attr(feature = "serde", serde(rename = "REG_DWORD"))]
    Dword,

    /// Multiple strings.
    #[cfg_attr(feature = "serde", serde(rename = "REG_MULTI_SZ"))]
    MultiString,

    /// 64-bit integer.
    #[cfg_attr(feature = "serde", serde(rename = "REG_QWORD"))]
    Qword,
}

impl ValueType {
    /// All supported types, in registry type-number order.
    pub const ALL: [ValueType; 7] = [
        ValueType::None,
        ValueType::String,
        ValueType::ExpandString,
        ValueType::Binary,
        ValueType::Dword,
        ValueType::MultiString,
        ValueType::Qword,
    ];

    /// Returns the name of this value type as the tool prints it.
    pub fn name(&self) -> &'static str {
        match self {
            ValueType::None => "REG_NONE",
            ValueType::String => "REG_SZ",
            ValueType::ExpandString => "REG_EXPAND_SZ",
            ValueType::Binary => "REG_BINARY",
            ValueType::Dword => "REG_DWORD",
            ValueType::MultiString => "REG_MULTI_SZ",
            ValueType::Qword => "REG_QWORD",
        }
    }

    /// Parses a type name such as `REG_DWORD`.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.name() == name)
    }
}

/// A typed registry value. Each variant carries exactly its kind's payload.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", content = "data"))]
pub enum RegistryValue {
    /// REG_SZ.
    #[cfg_attr(feature = "serde", serde(rename = "REG_SZ"))]
    String(String),

    /// REG_EXPAND_SZ.
    #[cfg_attr(feature = "serde", serde(rename = "REG_EXPAND_SZ"))]
    ExpandString(String),

    /// REG_DWORD.
    #[cfg_attr(feature = "serde", serde(rename = "REG_DWORD"))]
    Dword(u32),

    /// REG_QWORD.
    #[cfg_attr(feature = "serde", serde(rename = "REG_QWORD"))]
    Qword(u64),

    /// REG_MULTI_SZ.
    #[cfg_attr(feature = "serde", serde(rename = "REG_MULTI_SZ"))]
    MultiString(Vec<String>),

    /// REG_BINARY.
    #[cfg_attr(feature = "serde", serde(rename = "REG_BINARY"))]
    Binary(Vec<u8>),

    /// REG_NONE. Values read back from `reg query` never carry bytes; an
    /// empty vector means "no payload".
    #[cfg_attr(feature = "serde", serde(rename = "REG_NONE"))]
    None(Vec<u8>),
}

impl RegistryValue {
    /// Returns the declared type of this value.
    pub fn value_type(&self) -> ValueType {
        match self {
            RegistryValue::String(_) => ValueType::String,
            RegistryValue::ExpandString(_) => ValueType::ExpandString,
            RegistryValue::Dword(_) => ValueType::Dword,
            RegistryValue::Qword(_) => ValueType::Qword,
            RegistryValue::MultiString(_) => ValueType::MultiString,
            RegistryValue::Binary(_) => ValueType::Binary,
            RegistryValue::None(_) => ValueType::None,
        }
    }

    /// Returns true for a REG_NONE value that carries bytes.
    pub fn is_none_with_payload(&self) -> bool {
        matches!(self, RegistryValue::None(bytes) if !bytes.is_empty())
    }

    /// Decodes a `reg query` payload of the declared type.
    ///
    /// # Arguments
    ///
    /// * `type_name` - Declared type token, e.g. `REG_DWORD`.
    /// * `payload` - Text after the type column, `None` when absent.
    /// * `separator` - Multi-string separator; `'\0'` selects the tool's
    ///   default two-character `\0` token.
    /// * `line` - The whole logical line, for error context.
    ///
    /// # Errors
    ///
    /// Returns `UnknownValueType` for undeclared types and `MalformedLine`
    /// for payloads that do not decode.
    pub fn decode_query_payload(
        type_name: &str,
        payload: Option<&str>,
        separator: char,
        line: &str,
    ) -> Result<Self> {
        let value_type =
            ValueType::from_name(type_name).ok_or_else(|| RegistryError::UnknownValueType {
                type_name: type_name.to_string(),
                line: line.to_string(),
            })?;

        match value_type {
            ValueType::Dword => {
                let text = payload.ok_or_else(|| RegistryError::malformed_line(line, "missing REG_DWORD data"))?;
                let n = parse_hex_integer(text)
                    .ok_or_else(|| RegistryError::malformed_line(line, "invalid hexadecimal integer"))?;
                u32::try_from(n)
                    .map(RegistryValue::Dword)
                    .map_err(|_| RegistryError::malformed_line(line, "REG_DWORD out of range"))
            }
            ValueType::Qword => {
                let text = payload.ok_or_else(|| RegistryError::malformed_line(line, "missing REG_QWORD data"))?;
                parse_hex_integer(text)
                    .map(RegistryValue::Qword)
                    .ok_or_else(|| RegistryError::malformed_line(line, "invalid hexadecimal integer"))
            }
            ValueType::String => Ok(RegistryValue::String(payload.unwrap_or_default().to_string())),
            ValueType::ExpandString => {
                Ok(RegistryValue::ExpandString(payload.unwrap_or_default().to_string()))
            }
            ValueType::MultiString => Ok(RegistryValue::MultiString(split_multi_string(
                payload.unwrap_or_default(),
                separator,
            ))),
            ValueType::Binary => {
                let text = payload.unwrap_or_default();
                if text.len() % 2 != 0 {
                    return Err(RegistryError::malformed_line(line, "odd-length hexadecimal payload"));
                }
                hex::decode(text)
                    .map(RegistryValue::Binary)
                    .map_err(|e| RegistryError::malformed_line(line, e.to_string()))
            }
            ValueType::None => Ok(RegistryValue::None(Vec::new())),
        }
    }

    /// Renders the value as the `/d` argument of `reg add`, `None` when the
    /// type takes no data argument.
    pub fn reg_add_data(&self, separator: char) -> Option<String> {
        match self {
            RegistryValue::String(s) | RegistryValue::ExpandString(s) => Some(s.clone()),
            RegistryValue::Dword(n) => Some(n.to_string()),
            RegistryValue::Qword(n) => Some(n.to_string()),
            RegistryValue::MultiString(items) => Some(join_multi_string(items, separator)),
            RegistryValue::Binary(bytes) => Some(hex::encode_upper(bytes)),
            RegistryValue::None(_) => None,
        }
    }

    /// Converts the value data to a display string.
    pub fn to_display_string(&self) -> String {
        match self {
            RegistryValue::None(b) if b.is_empty() => String::from("(none)"),
            RegistryValue::String(s) | RegistryValue::ExpandString(s) => s.clone(),
            RegistryValue::Binary(b) | RegistryValue::None(b) => format!("{:02X?}", b),
            RegistryValue::Dword(d) => format!("{} (0x{:08X})", d, d),
            RegistryValue::Qword(q) => format!("{} (0x{:016X})", q, q),
            RegistryValue::MultiString(strings) => strings.join(", "),
        }
    }
}

/// Splits a multi-string payload; an empty payload is an empty list.
pub fn split_multi_string(payload: &str, separator: char) -> Vec<String> {
    if payload.is_empty() {
        return Vec::new();
    }
    if separator == '\0' {
        payload.split("\\0").map(str::to_string).collect()
    } else {
        payload.split(separator).map(str::to_string).collect()
    }
}

/// Joins multi-string items the way [`split_multi_string`] splits them.
pub fn join_multi_string(items: &[String], separator: char) -> String {
    if separator == '\0' {
        items.join("\\0")
    } else {
        items.join(&separator.to_string())
    }
}

/// Returns true if `name` designates the default value.
pub fn is_default_name(name: &str) -> bool {
    name.eq_ignore_ascii_case(DEFAULT_VALUE_NAME) || name.is_empty()
}

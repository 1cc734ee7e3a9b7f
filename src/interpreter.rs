//! Interpretation of logical lines into registry keys and values.
//!
//! Lines are consumed strictly in arrival order. The interpreter carries the
//! "current key" cursor: a header line opens a key, indented value rows are
//! attributed to it, and a blank line closes it.

use crate::config::ParseMode;
use crate::error::{RegistryError, Result};
use crate::key::KeyPath;
use crate::reassembler::{LineReassembler, VALUE_INDENT};
use crate::state::{QueryResult, RegistryStruct};
use crate::value::{is_default_name, RegistryValue, VALUE_NOT_SET};
use regex::Regex;
use std::sync::OnceLock;
use tracing::warn;

/// Prefix of the trailer `reg query /f` prints after its listing.
pub const END_OF_SEARCH_PREFIX: &str = "End of search:";

fn value_row_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?s)^ {4}(.*?) {4}(REG_[A-Z0-9_]+)(?: {4}(.*))?$")
            .expect("value row pattern compiles")
    })
}

/// Classification of one logical line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// Empty line: closes the current key.
    Blank,
    /// Key path header.
    Header,
    /// Indented value row.
    Value,
    /// The find-mode `End of search:` trailer.
    Trailer,
}

impl LineKind {
    /// Classifies a logical line.
    pub fn of(line: &str) -> Self {
        if line.is_empty() {
            LineKind::Blank
        } else if line.starts_with(VALUE_INDENT) {
            LineKind::Value
        } else if line.starts_with(END_OF_SEARCH_PREFIX) {
            LineKind::Trailer
        } else {
            LineKind::Header
        }
    }
}

/// Converts logical lines into a [`RegistryStruct`].
#[derive(Debug)]
pub struct RecordInterpreter {
    mode: ParseMode,
    separator: char,
    current_key: Option<KeyPath>,
    data: RegistryStruct,
    had_errors: bool,
}

impl RecordInterpreter {
    /// Creates an interpreter.
    ///
    /// # Arguments
    ///
    /// * `mode` - Whether malformed lines abort or are skipped.
    /// * `separator` - Multi-string separator; `'\0'` is the tool default.
    pub fn new(mode: ParseMode, separator: char) -> Self {
        Self {
            mode,
            separator,
            current_key: None,
            data: RegistryStruct::new(),
            had_errors: false,
        }
    }

    /// Processes one logical line.
    ///
    /// # Errors
    ///
    /// In strict mode, returns the first decoding or structural error. In
    /// best-effort mode such errors set [`had_errors`](Self::had_errors) and
    /// the line is skipped.
    pub fn push_line(&mut self, line: &str) -> Result<()> {
        match self.interpret(line) {
            Err(e) if self.mode == ParseMode::BestEffort && e.is_recoverable_parse_error() => {
                warn!(error = %e, "Skipping malformed line");
                self.had_errors = true;
                Ok(())
            }
            other => other,
        }
    }

    /// Processes lines in order, stopping at the first fatal error.
    pub fn push_lines<I, S>(&mut self, lines: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        lines
            .into_iter()
            .try_for_each(|line| self.push_line(line.as_ref()))
    }

    /// The structure accumulated so far.
    pub fn data(&self) -> &RegistryStruct {
        &self.data
    }

    /// Returns true if any line was skipped.
    pub fn had_errors(&self) -> bool {
        self.had_errors
    }

    /// The key value rows are currently attributed to.
    pub fn current_key(&self) -> Option<&KeyPath> {
        self.current_key.as_ref()
    }

    /// Finishes interpretation and freezes the result.
    pub fn finish(self) -> QueryResult {
        QueryResult::found(self.data, self.had_errors)
    }

    fn interpret(&mut self, line: &str) -> Result<()> {
        match LineKind::of(line) {
            LineKind::Blank => {
                self.current_key = None;
                Ok(())
            }
            LineKind::Trailer => Ok(()),
            LineKind::Header => {
                let key = KeyPath::new(line);
                if !key.has_known_root() {
                    self.current_key = None;
                    return Err(RegistryError::malformed_line(line, "key header without a registry root"));
                }
                // A key listed without value rows still exists.
                self.data.insert_key(key.clone());
                self.current_key = Some(key);
                Ok(())
            }
            LineKind::Value => {
                let key = self
                    .current_key
                    .clone()
                    .ok_or_else(|| RegistryError::malformed_line(line, "value row outside of a key"))?;
                let caps = value_row_pattern()
                    .captures(line)
                    .ok_or_else(|| RegistryError::malformed_line(line, "value row without a type column"))?;
                let name = caps.get(1).map_or("", |m| m.as_str());
                let type_name = caps.get(2).map_or("", |m| m.as_str());
                let payload = caps.get(3).map(|m| m.as_str());

                if is_default_name(name) && payload == Some(VALUE_NOT_SET) {
                    return Ok(());
                }

                let value =
                    RegistryValue::decode_query_payload(type_name, payload, self.separator, line)?;
                self.data.insert_value(key, name, value);
                Ok(())
            }
        }
    }
}

/// Parses a complete `reg query` text dump anchored on `anchor`.
///
/// This is the streaming pipeline run over a single chunk.
pub fn parse_query_output(
    text: &str,
    anchor: &KeyPath,
    mode: ParseMode,
    separator: char,
) -> Result<QueryResult> {
    let mut reassembler = LineReassembler::new(anchor)?;
    let mut interpreter = RecordInterpreter::new(mode, separator);
    interpreter.push_lines(reassembler.feed(text))?;
    interpreter.push_lines(reassembler.finish())?;
    Ok(interpreter.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> KeyPath {
        KeyPath::new(s)
    }

    #[test]
    fn test_line_kinds() {
        assert_eq!(LineKind::of(""), LineKind::Blank);
        assert_eq!(LineKind::of("    A    REG_SZ    x"), LineKind::Value);
        assert_eq!(LineKind::of("HKEY_CURRENT_USER\\A"), LineKind::Header);
        assert_eq!(LineKind::of("End of search: 2 match(es) found."), LineKind::Trailer);
    }

    #[test]
    fn test_header_and_values() {
        let mut i = RecordInterpreter::new(ParseMode::Strict, '\0');
        i.push_lines([
            "HKEY_CURRENT_USER\\A",
            "    Name With  Spaces    REG_SZ    hello    world",
            "    (Default)    REG_DWORD    0x10",
            "",
            "HKEY_CURRENT_USER\\A\\Empty",
        ])
        .unwrap();
        let result = i.finish();

        assert_eq!(
            result.data.value(&key("HKCU\\A"), "Name With  Spaces"),
            Some(&RegistryValue::String("hello    world".into()))
        );
        assert_eq!(
            result.data.value(&key("HKCU\\A"), "(Default)"),
            Some(&RegistryValue::Dword(16))
        );
        assert_eq!(result.data.get(&key("HKCU\\A\\Empty")).map(|v| v.len()), Some(0));
        assert!(!result.had_errors);
    }

    #[test]
    fn test_empty_payload_and_missing_payload() {
        let mut i = RecordInterpreter::new(ParseMode::Strict, '\0');
        i.push_lines([
            "HKEY_CURRENT_USER\\A",
            "    Empty    REG_SZ    ",
            "    Bare    REG_NONE",
            "    List    REG_MULTI_SZ    ",
        ])
        .unwrap();
        let data = i.finish().data;
        assert_eq!(data.value(&key("HKCU\\A"), "Empty"), Some(&RegistryValue::String(String::new())));
        assert_eq!(data.value(&key("HKCU\\A"), "Bare"), Some(&RegistryValue::None(vec![])));
        assert_eq!(data.value(&key("HKCU\\A"), "List"), Some(&RegistryValue::MultiString(vec![])));
    }

    #[test]
    fn test_unset_default_is_absent() {
        let mut i = RecordInterpreter::new(ParseMode::Strict, '\0');
        i.push_lines(["HKEY_CURRENT_USER\\A", "    (Default)    REG_SZ    (value not set)"])
            .unwrap();
        let data = i.finish().data;
        assert!(data.contains_key(&key("HKCU\\A")));
        assert_eq!(data.value(&key("HKCU\\A"), "(Default)"), None);
    }

    #[test]
    fn test_odd_binary_strict_and_best_effort() {
        let lines = ["HKEY_CURRENT_USER\\A", "    Bad    REG_BINARY    0A1", "    Ok    REG_DWORD    0x1"];

        let mut strict = RecordInterpreter::new(ParseMode::Strict, '\0');
        assert!(matches!(
            strict.push_lines(lines),
            Err(RegistryError::MalformedLine { .. })
        ));

        let mut lenient = RecordInterpreter::new(ParseMode::BestEffort, '\0');
        lenient.push_lines(lines).unwrap();
        let result = lenient.finish();
        assert!(result.had_errors);
        assert_eq!(result.data.value(&key("HKCU\\A"), "Bad"), None);
        assert_eq!(result.data.value(&key("HKCU\\A"), "Ok"), Some(&RegistryValue::Dword(1)));
    }

    #[test]
    fn test_value_after_blank_is_malformed() {
        let mut i = RecordInterpreter::new(ParseMode::Strict, '\0');
        i.push_line("HKEY_CURRENT_USER\\A").unwrap();
        i.push_line("").unwrap();
        assert!(i.current_key().is_none());
        assert!(i.push_line("    X    REG_SZ    y").is_err());
    }

    #[test]
    fn test_malformed_header_best_effort_skips_its_rows() {
        let mut i = RecordInterpreter::new(ParseMode::BestEffort, '\0');
        i.push_lines([
            "NotARegistryPath",
            "    X    REG_SZ    y",
            "",
            "HKEY_CURRENT_USER\\B",
            "    Y    REG_SZ    z",
        ])
        .unwrap();
        let result = i.finish();
        assert!(result.had_errors);
        assert_eq!(result.data.len(), 1);
        assert_eq!(result.data.value(&key("HKCU\\B"), "Y"), Some(&RegistryValue::String("z".into())));
    }

    #[test]
    fn test_malformed_header_strict_fails() {
        let mut i = RecordInterpreter::new(ParseMode::Strict, '\0');
        assert!(matches!(
            i.push_line("NotARegistryPath"),
            Err(RegistryError::MalformedLine { .. })
        ));
    }

    #[test]
    fn test_trailer_ignored() {
        let result = parse_query_output(
            "\r\nHKEY_CURRENT_USER\\A\r\n    X    REG_SZ    y\r\n\r\nEnd of search: 1 match(es) found.\r\n",
            &key("HKCU\\A"),
            ParseMode::Strict,
            '\0',
        )
        .unwrap();
        assert_eq!(result.data.len(), 1);
    }

    #[test]
    fn test_subkey_listing_without_values() {
        let result = parse_query_output(
            "\r\nHKEY_CURRENT_USER\\A\r\n    X    REG_SZ    y\r\n\r\nHKEY_CURRENT_USER\\A\\Child\r\nHKEY_CURRENT_USER\\A\\Empty\r\n",
            &key("HKCU\\A"),
            ParseMode::Strict,
            '\0',
        )
        .unwrap();
        let keys: Vec<&str> = result.data.keys().map(KeyPath::as_str).collect();
        assert_eq!(
            keys,
            vec!["HKEY_CURRENT_USER\\A", "HKEY_CURRENT_USER\\A\\Child", "HKEY_CURRENT_USER\\A\\Empty"]
        );
        assert_eq!(result.data.get(&key("HKCU\\A\\Child")).map(|v| v.len()), Some(0));
        assert_eq!(result.data.get(&key("HKCU\\A\\Empty")).map(|v| v.len()), Some(0));
    }
}

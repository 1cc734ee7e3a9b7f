//! Reassembly of logical lines from chunked `reg query` output.
//!
//! `reg query` prints one header line per key, one indented row per value,
//! and a blank line after each key's listing. Value payloads may themselves
//! contain newlines, so splitting on every newline would cut legitimate data.
//! Instead the reassembler only splits where a structural delimiter is
//! recognisable:
//!
//! ```text
//! <line>\r\n\r\n<anchor key...>   key ended, next key header follows
//! <line>\r\n<anchor key...>       header directly after a header (subkey
//!                                  listings, `/f /k` results)
//! <line>\r\n    <value row...>    next value row follows
//! ```
//!
//! The earliest delimiter in the buffer wins; at equal offsets a key boundary
//! is preferred, then a header boundary. Unmatched text stays buffered until the next chunk or
//! [`LineReassembler::finish`].

use crate::error::{RegistryError, Result};
use crate::interpreter::END_OF_SEARCH_PREFIX;
use crate::key::KeyPath;
use regex::Regex;
use tracing::trace;

/// Indentation that introduces a value row.
pub const VALUE_INDENT: &str = "    ";

/// Splits a growing text buffer into logical lines.
///
/// Emitted lines never contain the delimiting newline. An empty string is
/// emitted after the last line of a key's listing to mark "no current key".
#[derive(Debug)]
pub struct LineReassembler {
    buffer: String,
    started: bool,
    key_boundary: Regex,
    header_boundary: Regex,
    value_boundary: Regex,
}

/// A delimiter found in the buffer: emitted text ends at `start`, the buffer
/// resumes at `resume`.
struct Boundary {
    start: usize,
    resume: usize,
    ends_key: bool,
}

impl LineReassembler {
    /// Creates a reassembler anchored on the queried key path.
    ///
    /// Only blank lines followed by a header under `anchor` (matched
    /// case-insensitively) end a key; this keeps value text that merely looks
    /// like a blank line from being split.
    ///
    /// # Errors
    ///
    /// Returns `InvalidKeyName` if the anchor is too large to compile into a
    /// search pattern.
    pub fn new(anchor: &KeyPath) -> Result<Self> {
        let anchor = regex::escape(anchor.as_str());
        let key_boundary = Regex::new(&format!(r"(\r?\n\r?\n)(?i:{})", anchor))
            .map_err(|_| RegistryError::InvalidKeyName)?;
        let header_boundary = Regex::new(&format!(r"(\r?\n)(?i:{})", anchor))
            .map_err(|_| RegistryError::InvalidKeyName)?;
        let value_boundary = Regex::new(&format!(r"\r?\n{}", VALUE_INDENT))
            .map_err(|_| RegistryError::InvalidKeyName)?;

        Ok(Self {
            buffer: String::new(),
            started: false,
            key_boundary,
            header_boundary,
            value_boundary,
        })
    }

    /// Appends a chunk and returns every logical line it completes.
    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);

        if !self.started {
            let content_start = self
                .buffer
                .find(|c| c != '\r' && c != '\n')
                .unwrap_or(self.buffer.len());
            self.buffer.drain(..content_start);
            if self.buffer.is_empty() {
                return Vec::new();
            }
            self.started = true;
        }

        let mut lines = Vec::new();
        let mut consumed = 0;

        while let Some(boundary) = self.next_boundary(consumed) {
            let rest = &self.buffer[consumed..];
            lines.push(rest[..boundary.start].to_string());
            if boundary.ends_key {
                lines.push(String::new());
            }
            consumed += boundary.resume;
        }

        if consumed > 0 {
            self.buffer.drain(..consumed);
        }
        trace!(emitted = lines.len(), buffered = self.buffer.len(), "Reassembled chunk");
        lines
    }

    /// Flushes the remaining buffer at end of stream.
    ///
    /// The remainder is the last logical line, optionally followed by the
    /// find-mode trailer; trailing newlines are dropped.
    pub fn finish(&mut self) -> Vec<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim_end_matches(['\r', '\n']);
        if rest.is_empty() {
            return Vec::new();
        }

        let trailer_start = if rest.starts_with(END_OF_SEARCH_PREFIX) {
            Some(0)
        } else {
            rest.rfind(&format!("\n{}", END_OF_SEARCH_PREFIX)).map(|i| i + 1)
        };
        match trailer_start {
            Some(start) => {
                let body = rest[..start].trim_end_matches(['\r', '\n']);
                let mut lines = Vec::with_capacity(3);
                if !body.is_empty() {
                    lines.push(body.to_string());
                    lines.push(String::new());
                }
                lines.push(rest[start..].to_string());
                lines
            }
            None => vec![rest.to_string()],
        }
    }

    /// Bytes currently buffered.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    fn next_boundary(&self, from: usize) -> Option<Boundary> {
        let rest = &self.buffer[from..];

        let before_anchor = |pattern: &Regex, ends_key: bool| {
            pattern.captures(rest).and_then(|caps| {
                let newlines = caps.get(1)?;
                Some(Boundary {
                    start: newlines.start(),
                    resume: newlines.end(),
                    ends_key,
                })
            })
        };
        let key = before_anchor(&self.key_boundary, true);
        let header = before_anchor(&self.header_boundary, false);
        let value = self.value_boundary.find(rest).map(|m| Boundary {
            start: m.start(),
            resume: m.end() - VALUE_INDENT.len(),
            ends_key: false,
        });

        // Candidates in preference order; `min_by_key` keeps the first on ties.
        [key, header, value]
            .into_iter()
            .flatten()
            .min_by_key(|b| b.start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTPUT: &str = "\r\nHKEY_CURRENT_USER\\Foo\r\n    A    REG_SZ    x\r\n    B    REG_DWORD    0x1\r\n\r\nHKEY_CURRENT_USER\\Foo\\Sub\r\n\r\n";

    fn all_lines(chunks: &[&str]) -> Vec<String> {
        let mut r = LineReassembler::new(&KeyPath::new("HKCU\\Foo")).unwrap();
        let mut lines = Vec::new();
        for chunk in chunks {
            lines.extend(r.feed(chunk));
        }
        lines.extend(r.finish());
        lines
    }

    #[test]
    fn test_single_chunk() {
        assert_eq!(
            all_lines(&[OUTPUT]),
            vec![
                "HKEY_CURRENT_USER\\Foo",
                "    A    REG_SZ    x",
                "    B    REG_DWORD    0x1",
                "",
                "HKEY_CURRENT_USER\\Foo\\Sub",
            ]
        );
    }

    #[test]
    fn test_every_split_point_is_equivalent() {
        let whole = all_lines(&[OUTPUT]);
        for split in 0..=OUTPUT.len() {
            let (a, b) = OUTPUT.split_at(split);
            assert_eq!(all_lines(&[a, b]), whole, "split at {}", split);
        }
    }

    #[test]
    fn test_anchor_is_case_insensitive() {
        let text = "HKEY_CURRENT_USER\\Foo\r\n    A    REG_SZ    x\r\n\r\nhkey_current_user\\foo\\Sub\r\n    B    REG_SZ    y\r\n";
        let lines = all_lines(&[text]);
        assert_eq!(lines[2], "");
        assert_eq!(lines[3], "hkey_current_user\\foo\\Sub");
    }

    #[test]
    fn test_blank_line_inside_payload_is_kept() {
        // Payload contains a blank line not followed by the anchor key.
        let text = "HKEY_CURRENT_USER\\Foo\r\n    A    REG_SZ    one\r\n\r\ntwo\r\n    B    REG_SZ    y\r\n";
        let lines = all_lines(&[text]);
        assert_eq!(lines[1], "    A    REG_SZ    one\r\n\r\ntwo");
        assert_eq!(lines[2], "    B    REG_SZ    y");
    }

    #[test]
    fn test_incomplete_tail_stays_buffered() {
        let mut r = LineReassembler::new(&KeyPath::new("HKCU\\Foo")).unwrap();
        assert_eq!(
            r.feed("HKEY_CURRENT_USER\\Foo\r\n    A    REG"),
            vec!["HKEY_CURRENT_USER\\Foo"]
        );
        assert!(r.buffered_len() > 0);
        assert!(r.feed("_SZ    x").is_empty());
        assert_eq!(r.finish(), vec!["    A    REG_SZ    x"]);
    }

    #[test]
    fn test_finish_keeps_multiline_last_payload() {
        let text = "HKEY_CURRENT_USER\\Foo\r\n    A    REG_SZ    one\r\n\r\ntwo\r\n\r\n";
        let lines = all_lines(&[text]);
        assert_eq!(lines, vec!["HKEY_CURRENT_USER\\Foo", "    A    REG_SZ    one\r\n\r\ntwo"]);
    }

    #[test]
    fn test_subkey_listing_splits_each_header() {
        let text = "\r\nHKEY_CURRENT_USER\\Foo\r\n    A    REG_SZ    x\r\n\r\nHKEY_CURRENT_USER\\Foo\\Child\r\nHKEY_CURRENT_USER\\Foo\\Empty\r\n";
        let expected = vec![
            "HKEY_CURRENT_USER\\Foo",
            "    A    REG_SZ    x",
            "",
            "HKEY_CURRENT_USER\\Foo\\Child",
            "HKEY_CURRENT_USER\\Foo\\Empty",
        ];
        assert_eq!(all_lines(&[text]), expected);
        for split in 0..=text.len() {
            let (a, b) = text.split_at(split);
            assert_eq!(all_lines(&[a, b]), expected, "split at {}", split);
        }
    }

    #[test]
    fn test_find_keys_only_results() {
        let text = "\r\nHKEY_CURRENT_USER\\Foo\\A\r\nHKEY_CURRENT_USER\\Foo\\B\r\n\r\nEnd of search: 2 match(es) found.\r\n";
        assert_eq!(
            all_lines(&[text]),
            vec![
                "HKEY_CURRENT_USER\\Foo\\A",
                "HKEY_CURRENT_USER\\Foo\\B",
                "",
                "End of search: 2 match(es) found.",
            ]
        );
    }

    #[test]
    fn test_finish_splits_trailer() {
        let text = "HKEY_CURRENT_USER\\Foo\r\n    A    REG_SZ    x\r\n\r\nEnd of search: 1 match(es) found.\r\n";
        assert_eq!(
            all_lines(&[text]),
            vec![
                "HKEY_CURRENT_USER\\Foo",
                "    A    REG_SZ    x",
                "",
                "End of search: 1 match(es) found.",
            ]
        );
        assert_eq!(
            all_lines(&["\r\nEnd of search: 0 match(es) found.\r\n"]),
            vec!["End of search: 0 match(es) found."]
        );
    }
}

//! Client configuration.
//!
//! [`RegConfig`] is threaded explicitly through every entry point; there is no
//! process-wide state.

use encoding_rs::{Encoding, UTF_8};
use std::path::PathBuf;
use std::time::Duration;

/// Default per-operation timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Default bound on the bytes a single read may produce before it is killed.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 64 * 1024 * 1024;

/// Default interval between re-reads of an export file.
pub const DEFAULT_EXPORT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How the record interpreter reacts to malformed lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum ParseMode {
    /// Any malformed line aborts the operation.
    #[default]
    Strict,
    /// Malformed lines are skipped and a sticky flag is raised.
    BestEffort,
}

/// Configuration shared by queries and reconciliation.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RegConfig {
    /// Path or name of the registry tool.
    pub reg_path: PathBuf,

    /// Per-operation timeout; `None` disables it.
    pub timeout: Option<Duration>,

    /// Output bytes a read may produce before the tool is killed.
    pub max_output_bytes: usize,

    /// Text encoding of the tool's standard output.
    #[cfg_attr(feature = "serde", serde(skip, default = "default_encoding"))]
    pub output_encoding: &'static Encoding,

    /// Multi-string separator; `'\0'` means the tool's `\0` token.
    pub separator: char,

    /// Default parse mode for queries.
    pub parse_mode: ParseMode,

    /// Interval between re-reads of an export file.
    pub export_poll_interval: Duration,

    /// Prefix for generated temporary files.
    pub temp_prefix: String,
}

#[cfg(feature = "serde")]
fn default_encoding() -> &'static Encoding {
    UTF_8
}

impl Default for RegConfig {
    fn default() -> Self {
        Self {
            reg_path: PathBuf::from("reg"),
            timeout: Some(DEFAULT_TIMEOUT),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            output_encoding: UTF_8,
            separator: '\0',
            parse_mode: ParseMode::Strict,
            export_poll_interval: DEFAULT_EXPORT_POLL_INTERVAL,
            temp_prefix: String::from("reg-shell-"),
        }
    }
}

impl RegConfig {
    /// Sets the registry tool path.
    pub fn with_reg_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.reg_path = path.into();
        self
    }

    /// Sets the per-operation timeout.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the output safety bound.
    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    /// Sets the stdout encoding (e.g. the console code page).
    pub fn with_output_encoding(mut self, encoding: &'static Encoding) -> Self {
        self.output_encoding = encoding;
        self
    }

    /// Sets the multi-string separator.
    pub fn with_separator(mut self, separator: char) -> Self {
        self.separator = separator;
        self
    }

    /// Sets the default parse mode.
    pub fn with_parse_mode(mut self, mode: ParseMode) -> Self {
        self.parse_mode = mode;
        self
    }

    /// Sets the export poll interval.
    pub fn with_export_poll_interval(mut self, interval: Duration) -> Self {
        self.export_poll_interval = interval;
        self
    }

    /// Sets the prefix of generated temporary files.
    pub fn with_temp_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.temp_prefix = prefix.into();
        self
    }
}

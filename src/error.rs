//! Error types for registry queries and reconciliation.
//!
//! Every public operation either resolves with a typed result or fails with
//! exactly one [`RegistryError`]. Failures reported by the external `reg`
//! tool are classified from their stderr text by
//! [`RegistryError::from_stderr`].

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Exact stderr signature printed when the queried key or value is absent.
pub const NOT_FOUND_TEXT: &str =
    "ERROR: The system was unable to find the specified registry key or value.";

/// Stderr signature for malformed command lines.
pub const INVALID_SYNTAX_TEXT: &str = "ERROR: Invalid syntax.";

/// Stderr signature for permission failures.
pub const ACCESS_DENIED_TEXT: &str = "ERROR: Access is denied.";

/// Stderr signature for unparseable key paths.
pub const INVALID_KEY_NAME_TEXT: &str = "ERROR: Invalid key name.";

/// Stderr signature printed by `reg import` when the document cannot be read.
pub const IMPORT_FILE_OPEN_TEXT: &str = "ERROR: Error opening the file.";

/// Success message. `reg import` prints it on stderr.
pub const SUCCESS_TEXT: &str = "The operation completed successfully.";

/// Errors that can occur while driving the registry tool.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The tool refused the operation for lack of permissions.
    #[error("Access denied")]
    AccessDenied,

    /// The tool rejected the command line, or a value could not be encoded.
    #[error("Invalid syntax: {0}")]
    InvalidSyntax(String),

    /// The key path is not a valid registry path.
    #[error("Invalid key name")]
    InvalidKeyName,

    /// Catch-all for tool failures with an unrecognised signature.
    #[error("Registry tool failed (exit code {code:?}): {stderr}")]
    UnknownFailure {
        /// Exit code, `None` when the process was terminated.
        code: Option<i32>,
        /// Verbatim stderr text.
        stderr: String,
    },

    /// A line of tool output violates the expected structure.
    #[error("Malformed line {line:?}: {reason}")]
    MalformedLine {
        /// The offending logical line.
        line: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A value line declared a type this crate does not know.
    #[error("Unknown value type {type_name:?} in line {line:?}")]
    UnknownValueType {
        /// Declared type token.
        type_name: String,
        /// The offending logical line.
        line: String,
    },

    /// The read produced more output than the configured safety bound and the
    /// tool was killed.
    #[error("Registry read output exceeded the safety bound and was truncated")]
    ReadTooWide,

    /// The operation did not settle before its deadline.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// The import tool could not open the generated document.
    #[error("Import failed to open file: {0}")]
    ImportFileOpen(String),

    /// I/O error while spawning a process or handling a temporary file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RegistryError {
    /// Creates a malformed-line error with context.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use reg_shell::error::RegistryError;
    /// let err = RegistryError::malformed_line("    Bad    REG_BINARY    0A1", "odd hex length");
    /// assert!(matches!(err, RegistryError::MalformedLine { .. }));
    /// ```
    pub fn malformed_line(line: &str, reason: impl Into<String>) -> Self {
        Self::MalformedLine {
            line: line.to_string(),
            reason: reason.into(),
        }
    }

    /// Creates an unknown-failure error carrying the tool's stderr.
    pub fn unknown_failure(code: Option<i32>, stderr: &str) -> Self {
        Self::UnknownFailure {
            code,
            stderr: stderr.trim().to_string(),
        }
    }

    /// Maps a known stderr signature onto its typed error.
    ///
    /// Returns `None` when the text matches none of the known signatures
    /// (including the not-found signature, which callers treat as success).
    pub fn from_stderr(stderr: &str) -> Option<Self> {
        let text = stderr.trim();
        if text.starts_with(INVALID_SYNTAX_TEXT) {
            Some(Self::InvalidSyntax(text.to_string()))
        } else if text.starts_with(ACCESS_DENIED_TEXT) {
            Some(Self::AccessDenied)
        } else if text.starts_with(INVALID_KEY_NAME_TEXT) {
            Some(Self::InvalidKeyName)
        } else if text.starts_with(IMPORT_FILE_OPEN_TEXT) {
            Some(Self::ImportFileOpen(text.to_string()))
        } else {
            None
        }
    }

    /// Returns true for parse-time errors that best-effort mode may skip.
    pub fn is_recoverable_parse_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedLine { .. } | Self::UnknownValueType { .. }
        )
    }
}

/// Returns true if stderr is empty or only carries the success message.
pub fn is_quiet_success(stderr: &str) -> bool {
    let text = stderr.trim();
    text.is_empty() || text == SUCCESS_TEXT
}

/// Returns true if stderr carries the key/value not-found signature.
pub fn is_not_found(stderr: &str) -> bool {
    stderr.trim().starts_with(NOT_FOUND_TEXT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_stderr_signatures() {
        assert!(matches!(
            RegistryError::from_stderr("ERROR: Access is denied.\r\n"),
            Some(RegistryError::AccessDenied)
        ));
        assert!(matches!(
            RegistryError::from_stderr("ERROR: Invalid key name.\r\nType \"REG QUERY /?\" for usage.\r\n"),
            Some(RegistryError::InvalidKeyName)
        ));
        assert!(matches!(
            RegistryError::from_stderr("ERROR: Invalid syntax.\r\n"),
            Some(RegistryError::InvalidSyntax(_))
        ));
        assert!(RegistryError::from_stderr("something else").is_none());
    }

    #[test]
    fn test_not_found_is_not_an_error_signature() {
        assert!(is_not_found(&format!("{}\r\n", NOT_FOUND_TEXT)));
        assert!(RegistryError::from_stderr(NOT_FOUND_TEXT).is_none());
    }

    #[test]
    fn test_recoverable() {
        assert!(RegistryError::malformed_line("x", "y").is_recoverable_parse_error());
        assert!(!RegistryError::AccessDenied.is_recoverable_parse_error());
    }
}

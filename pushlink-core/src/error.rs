use thiserror::Error;

/// Failure to decode a line or a request frame.
///
/// All protocol errors are recoverable from the session's point of view: a
/// line that fails to decode is reported and skipped, it never tears the
/// connection down by itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The directive name is not one the client knows.
    #[error("unknown directive in line {0:?}")]
    UnknownDirective(String),
    /// The directive is known but its fields do not parse.
    #[error("malformed {directive}: {reason} in {line:?}")]
    Malformed {
        directive: &'static str,
        reason: &'static str,
        line: String,
    },
    /// A percent escape did not decode to UTF-8, or was truncated.
    #[error("bad escape sequence in {0:?}")]
    BadEscape(String),
}

impl ProtocolError {
    pub(crate) fn malformed(
        directive: &'static str,
        reason: &'static str,
        line: &str,
    ) -> ProtocolError {
        ProtocolError::Malformed {
            directive,
            reason,
            line: line.to_string(),
        }
    }
}

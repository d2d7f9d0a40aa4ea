//! Driver error types.

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by driver operations.
#[derive(Debug)]
pub enum Error {
    /// A command slot or a receive wait exceeded its deadline.
    Timeout,
    /// The modem reported a failure (`ERROR`, `+CME ERROR: …`, `+CMS ERROR: …`).
    ///
    /// Carries the verbose error text when the modem provided one.
    Modem(String),
    /// A response did not match the expected shape.
    Parse(ParseError),
    /// Serial write failure or read fault.
    Io(std::io::Error),
    /// Operation attempted in a state that cannot honor it (driver not
    /// running, socket not acquired, TLS slot already in use, …).
    InvalidState(&'static str),
    /// Configuration file could not be loaded or parsed.
    Config(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Timeout => write!(f, "operation timed out"),
            Error::Modem(msg) if msg.is_empty() => write!(f, "modem error"),
            Error::Modem(msg) => write!(f, "modem error: {msg}"),
            Error::Parse(e) => write!(f, "response parse error: {e}"),
            Error::Io(e) => write!(f, "serial I/O error: {e}"),
            Error::InvalidState(what) => write!(f, "invalid state: {what}"),
            Error::Config(msg) => write!(f, "configuration error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        match e {
            ParseError::ReadTimeout => Error::Timeout,
            other => Error::Parse(other),
        }
    }
}

/// Fine-grained failure codes reported by the response parser.
///
/// Matchers record the first failure and short-circuit the rest of the
/// sequence, so the code always identifies the earliest mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Internal buffer filled up before the match completed.
    Overflow,
    /// The byte source timed out mid-match.
    ReadTimeout,
    /// Expected character not found.
    Char,
    /// No character matched the class pattern.
    CharClass,
    /// Neither an empty line nor an `AT` echo line was found.
    Echo,
    /// Expected `\r\n`.
    Eol,
    /// Terminal line was `ABORT`.
    FinalAbort,
    /// Terminal line was `+CME ERROR: <code>`.
    FinalCme,
    /// Terminal line was `+CMS ERROR: <code>`.
    FinalCms,
    /// Terminal line was `ERROR`.
    FinalError,
    /// Terminal line was none of the recognized result codes.
    FinalUnknown,
    /// Expected a hexadecimal number.
    Hex,
    /// Expected a signed integer.
    Int,
    /// Expected an unsigned integer.
    Uint,
    /// Expected string not found.
    Str,
    /// No characters matched the class run.
    StrClass,
    /// Expected a fixed line.
    Line,
    /// Line discard never reached an end of line.
    LineDump,
    /// Expected `<name>: <int>`.
    Query,
    /// Opening quote not found.
    QuoteBegin,
    /// Closing quote not found.
    QuoteEnd,
    /// Quote characters were not provided.
    NoQuotes,
    /// Table lookup read no token at all.
    TableNone,
    /// Token not present in the lookup table.
    TableMiss,
    /// Reply payload had fewer or malformed fields.
    Args,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ParseError::Overflow => "buffer overflow",
            ParseError::ReadTimeout => "read timeout",
            ParseError::Char => "character mismatch",
            ParseError::CharClass => "character class mismatch",
            ParseError::Echo => "echo line expected",
            ParseError::Eol => "end of line expected",
            ParseError::FinalAbort => "final result: ABORT",
            ParseError::FinalCme => "final result: +CME ERROR",
            ParseError::FinalCms => "final result: +CMS ERROR",
            ParseError::FinalError => "final result: ERROR",
            ParseError::FinalUnknown => "unrecognized final result",
            ParseError::Hex => "hexadecimal number expected",
            ParseError::Int => "integer expected",
            ParseError::Uint => "unsigned integer expected",
            ParseError::Str => "string mismatch",
            ParseError::StrClass => "string class mismatch",
            ParseError::Line => "line mismatch",
            ParseError::LineDump => "unterminated line",
            ParseError::Query => "query response expected",
            ParseError::QuoteBegin => "opening quote expected",
            ParseError::QuoteEnd => "closing quote expected",
            ParseError::NoQuotes => "quote characters missing",
            ParseError::TableNone => "no token to look up",
            ParseError::TableMiss => "token not in table",
            ParseError::Args => "malformed reply arguments",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_modem_with_text() {
        let e = Error::Modem("operation not allowed".into());
        assert_eq!(e.to_string(), "modem error: operation not allowed");
    }

    #[test]
    fn test_display_modem_bare() {
        assert_eq!(Error::Modem(String::new()).to_string(), "modem error");
    }

    #[test]
    fn test_read_timeout_folds_into_timeout() {
        assert!(matches!(Error::from(ParseError::ReadTimeout), Error::Timeout));
        assert!(matches!(Error::from(ParseError::Echo), Error::Parse(ParseError::Echo)));
    }
}

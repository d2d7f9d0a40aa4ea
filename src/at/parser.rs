//! Streaming AT response parsing.
//!
//! Instead of reading an entire response line and splitting it afterwards,
//! [`RspParser`] tentatively matches the input stream against expected data,
//! buffering intermediate bytes internally. When a match succeeds the
//! corresponding value is returned and the bytes are consumed; when it
//! fails the bytes are left in place for another attempt.
//!
//! The buffer invariant is `0 <= index <= count <= MAX_BUF`: bytes in
//! `[0, index)` are the current speculative match. [`RspParser::res_ok`]
//! consumes them, [`RspParser::res_abort`] rewinds `index` to 0 and records
//! the first error; after an abort the next matcher sees exactly the bytes
//! the failed attempt saw.
//!
//! ## Patterns
//!
//! Class matchers take a tiny pattern syntax: an optional leading `^`
//! negates the class, `a-z` is an inclusive range, any other character
//! matches itself. `"0-9"`, `"A-Fa-f0-9"` and `"^\""` are typical.

use std::time::Duration;

use crate::error::ParseError;
use crate::transport::Transport;

/// Canonical maximum for response buffers and line buffers.
pub const MAX_BUF: usize = 1024;

/// One read attempt from a byte source.
pub enum SourceRead {
    Byte(u8),
    /// No byte within the allowed time (or the source is exhausted).
    Timeout,
}

/// Where response bytes come from.
pub trait ByteSource {
    fn next_byte(&mut self, timeout_ms: u32) -> SourceRead;
}

/// In-memory source, used to re-parse buffered reply payloads.
pub struct SliceSource<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceSource<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        SliceSource { data, pos: 0 }
    }
}

impl ByteSource for SliceSource<'_> {
    fn next_byte(&mut self, _timeout_ms: u32) -> SourceRead {
        match self.data.get(self.pos) {
            Some(&b) => {
                self.pos += 1;
                SourceRead::Byte(b)
            }
            None => SourceRead::Timeout,
        }
    }
}

/// Live source over the serial transport, used during startup when the
/// reader loop is not yet running.
pub struct TransportSource<'a> {
    transport: &'a dyn Transport,
}

impl<'a> TransportSource<'a> {
    pub fn new(transport: &'a dyn Transport) -> Self {
        TransportSource { transport }
    }
}

impl ByteSource for TransportSource<'_> {
    fn next_byte(&mut self, timeout_ms: u32) -> SourceRead {
        match self
            .transport
            .read_byte(Duration::from_millis(u64::from(timeout_ms)))
        {
            Ok(Some(b)) => SourceRead::Byte(b),
            Ok(None) => SourceRead::Timeout,
            Err(e) => {
                tracing::warn!("serial read failed: {e}");
                SourceRead::Timeout
            }
        }
    }
}

/// Incremental response parser with commit/rollback.
///
/// `match_*` functions only advance the speculative cursor and return the
/// number of matching bytes. The committing variants additionally consume
/// the match (or roll back and record an error) and return a final value;
/// after the first error every committing call is a no-op, so a parse
/// sequence needs a single [`RspParser::status`] check at the end.
pub struct RspParser<S> {
    src: S,
    buf: Vec<u8>,
    index: usize,
    buf_max: usize,
    timeout_ms: u32,
    err: Option<ParseError>,
    cm_err: i32,
}

impl<S: ByteSource> RspParser<S> {
    pub fn new(src: S) -> Self {
        Self::with_capacity(src, MAX_BUF)
    }

    pub fn with_capacity(src: S, buf_max: usize) -> Self {
        RspParser {
            src,
            buf: Vec::new(),
            index: 0,
            buf_max,
            timeout_ms: 100,
            err: None,
            cm_err: 0,
        }
    }

    /// Per-byte read timeout used when the buffer runs dry.
    pub fn set_timeout(&mut self, ms: u32) {
        self.timeout_ms = ms;
    }

    /// First recorded error, if any.
    pub fn error(&self) -> Option<ParseError> {
        self.err
    }

    /// `Ok` when no matcher has failed so far.
    pub fn status(&self) -> Result<(), ParseError> {
        match self.err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Numeric code captured from `+CME ERROR` / `+CMS ERROR`.
    pub fn cm_err(&self) -> i32 {
        self.cm_err
    }

    /// Drop the sticky error so parsing can continue past a recoverable
    /// mismatch (e.g. skimming lines until a terminal).
    pub fn clear_error(&mut self) {
        self.err = None;
    }

    /// Speculative cursor position (test hook).
    #[cfg(test)]
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Buffered byte count (test hook).
    #[cfg(test)]
    pub(crate) fn count(&self) -> usize {
        self.buf.len()
    }

    fn read_more(&mut self) -> Option<u8> {
        if self.buf.len() == self.buf_max {
            self.err = Some(ParseError::Overflow);
            return None;
        }
        match self.src.next_byte(self.timeout_ms) {
            SourceRead::Byte(b) => {
                self.buf.push(b);
                Some(b)
            }
            SourceRead::Timeout => {
                self.err = Some(ParseError::ReadTimeout);
                None
            }
        }
    }

    fn get(&mut self) -> Option<u8> {
        if self.index == self.buf_max {
            self.err = Some(ParseError::Overflow);
            return None;
        }
        let c = if self.index == self.buf.len() {
            self.read_more()?
        } else {
            self.buf[self.index]
        };
        self.index += 1;
        Some(c)
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.index = 0;
        self.err = None;
    }

    // ── Match results ────────────────────────────────────────────────

    /// Commit the speculative match: consume `[0, index)` and return its
    /// length. Unmatched bytes become the new buffer prefix.
    pub fn res_ok(&mut self) -> usize {
        let n = self.index;
        self.buf.drain(..n);
        self.index = 0;
        n
    }

    /// Commit and hand back the matched bytes.
    pub fn res_ok_bytes(&mut self) -> Vec<u8> {
        let out = self.buf[..self.index].to_vec();
        self.res_ok();
        out
    }

    /// Roll the cursor back, keeping the buffered bytes for a retry, and
    /// record `error` unless an earlier one (e.g. a read timeout) is
    /// already pending.
    pub fn res_abort(&mut self, error: ParseError) -> usize {
        if self.err.is_none() {
            self.err = Some(error);
        }
        self.index = 0;
        0
    }

    // ── Speculative matchers ─────────────────────────────────────────

    pub fn match_char(&mut self, c: u8) -> usize {
        match self.get() {
            Some(b) if b == c => 1,
            Some(_) => {
                self.index -= 1;
                0
            }
            None => 0,
        }
    }

    pub fn match_class(&mut self, pattern: &str) -> usize {
        let Some(c) = self.get() else { return 0 };
        if class_matches(pattern.as_bytes(), c) {
            1
        } else {
            self.index -= 1;
            0
        }
    }

    pub fn match_str(&mut self, s: &[u8]) -> usize {
        let start = self.index;
        for &c in s {
            if self.match_char(c) == 0 {
                self.index = start;
                return 0;
            }
        }
        self.index - start
    }

    /// Match up to `n` consecutive bytes of the class.
    pub fn match_class_run_n(&mut self, pattern: &str, n: usize) -> usize {
        let mut count = 0;
        while count < n {
            if self.match_class(pattern) == 0 {
                break;
            }
            count += 1;
        }
        count
    }

    /// Match as many consecutive bytes of the class as possible.
    pub fn match_class_run(&mut self, pattern: &str) -> usize {
        self.match_class_run_n(pattern, usize::MAX)
    }

    pub fn match_eol(&mut self) -> usize {
        self.match_str(b"\r\n")
    }

    /// Optional `+`/`-` sign followed by one or more digits.
    pub fn match_int(&mut self) -> usize {
        let start = self.index;
        self.match_class("+-");
        if self.match_class_run("0-9") == 0 {
            self.index = start;
        }
        self.index - start
    }

    pub fn match_uint(&mut self) -> usize {
        self.match_class_run("0-9")
    }

    pub fn match_hex(&mut self) -> usize {
        self.match_class_run("A-Fa-f0-9")
    }

    /// Match `<str>: <int>` and return the integer.
    pub fn match_query(&mut self, s: &[u8]) -> Option<i32> {
        let start = self.index;
        if self.match_str(s) == 0 || self.match_str(b": ") == 0 {
            self.index = start;
            return None;
        }
        let num_start = self.index;
        if self.match_int() == 0 {
            self.index = start;
            return None;
        }
        Some(buf2int(&self.buf[num_start..self.index]) as i32)
    }

    /// Match a whole `<str>\r\n` line.
    pub fn match_line(&mut self, s: &[u8]) -> usize {
        let start = self.index;
        if self.match_str(s) == 0 || self.match_eol() == 0 {
            self.index = start;
            return 0;
        }
        self.index - start
    }

    /// Match a whole `<str>: <int>\r\n` line and return the integer.
    pub fn match_line_query(&mut self, s: &[u8]) -> Option<i32> {
        let start = self.index;
        let val = self.match_query(s)?;
        if self.match_eol() == 0 {
            self.index = start;
            return None;
        }
        Some(val)
    }

    // ── Committing readers ───────────────────────────────────────────

    pub fn char_(&mut self, c: u8) -> usize {
        if self.err.is_some() {
            return 0;
        }
        if self.match_char(c) > 0 {
            self.res_ok()
        } else {
            self.res_abort(ParseError::Char)
        }
    }

    pub fn class(&mut self, pattern: &str) -> usize {
        if self.err.is_some() {
            return 0;
        }
        if self.match_class(pattern) > 0 {
            self.res_ok()
        } else {
            self.res_abort(ParseError::CharClass)
        }
    }

    pub fn str_(&mut self, s: &[u8]) -> usize {
        if self.err.is_some() {
            return 0;
        }
        if self.match_str(s) > 0 {
            self.res_ok()
        } else {
            self.res_abort(ParseError::Str)
        }
    }

    /// Read a non-empty class run and return it.
    pub fn class_run(&mut self, pattern: &str) -> Vec<u8> {
        if self.err.is_some() {
            return Vec::new();
        }
        if self.match_class_run(pattern) > 0 {
            self.res_ok_bytes()
        } else {
            self.res_abort(ParseError::StrClass);
            Vec::new()
        }
    }

    pub fn eol(&mut self) -> usize {
        if self.err.is_some() {
            return 0;
        }
        if self.match_eol() > 0 {
            self.res_ok()
        } else {
            self.res_abort(ParseError::Eol)
        }
    }

    pub fn int(&mut self) -> i32 {
        if self.err.is_some() {
            return 0;
        }
        if self.match_int() == 0 {
            self.res_abort(ParseError::Int);
            return 0;
        }
        let v = buf2int(&self.buf[..self.index]) as i32;
        self.res_ok();
        v
    }

    pub fn uint(&mut self) -> u32 {
        if self.err.is_some() {
            return 0;
        }
        if self.match_uint() == 0 {
            self.res_abort(ParseError::Uint);
            return 0;
        }
        let v = buf2int(&self.buf[..self.index]) as u32;
        self.res_ok();
        v
    }

    pub fn hex(&mut self) -> u32 {
        if self.err.is_some() {
            return 0;
        }
        if self.match_hex() == 0 {
            self.res_abort(ParseError::Hex);
            return 0;
        }
        let mut v: u32 = 0;
        for &c in &self.buf[..self.index] {
            let d = match c {
                b'0'..=b'9' => c - b'0',
                b'A'..=b'F' => c - b'A' + 10,
                b'a'..=b'f' => c - b'a' + 10,
                _ => continue,
            };
            v = v.wrapping_mul(16).wrapping_add(u32::from(d));
        }
        self.res_ok();
        v
    }

    /// Read a quoted string. The returned bytes exclude the quotes but keep
    /// any escape characters.
    pub fn quoted(&mut self, open: u8, close: u8, escape: Option<u8>) -> Vec<u8> {
        if self.err.is_some() {
            return Vec::new();
        }
        if open == 0 || close == 0 {
            self.res_abort(ParseError::NoQuotes);
            return Vec::new();
        }
        if self.match_char(open) == 0 {
            self.res_abort(ParseError::QuoteBegin);
            return Vec::new();
        }
        let not_close = [b'^', close];
        let pattern = std::str::from_utf8(&not_close).unwrap_or("^\"");
        loop {
            let n = self.match_class_run(pattern);
            match escape {
                // A run ending in the escape character means the closing
                // quote it precedes is literal: swallow it and keep going.
                Some(esc) if n > 0 && self.buf[self.index - 1] == esc => {
                    if self.get().is_none() {
                        break;
                    }
                }
                _ => break,
            }
        }
        if self.match_char(close) == 0 {
            self.res_abort(ParseError::QuoteEnd);
            return Vec::new();
        }
        let out = self.buf[1..self.index - 1].to_vec();
        self.res_ok();
        out
    }

    /// Read a whole `<str>\r\n` line.
    pub fn line(&mut self, s: &[u8]) -> usize {
        if self.err.is_some() {
            return 0;
        }
        if self.match_line(s) > 0 {
            self.res_ok()
        } else {
            self.res_abort(ParseError::Line)
        }
    }

    /// Discard one line of arbitrary content, including its terminator.
    pub fn line_dump(&mut self) -> usize {
        if self.err.is_some() {
            return 0;
        }
        loop {
            match self.get() {
                Some(b'\r') => {
                    if self.match_char(b'\n') > 0 {
                        return self.res_ok();
                    }
                }
                Some(_) => {}
                None => return self.res_abort(ParseError::LineDump),
            }
        }
    }

    /// Consume the echo at the start of a command response: either an empty
    /// line (echo off) or a line starting with `AT` (echo on).
    pub fn echo(&mut self, timeout_ms: u32) -> usize {
        if self.err.is_some() {
            return 0;
        }
        self.reset();
        self.timeout_ms = timeout_ms;
        if self.match_eol() > 0 {
            self.res_ok()
        } else if self.match_str(b"AT") > 0 {
            self.line_dump()
        } else {
            self.res_abort(ParseError::Echo)
        }
    }

    /// Read the final result line: `OK`, `ERROR`, `ABORT`,
    /// `+CME ERROR: <int>` or `+CMS ERROR: <int>`. Anything but `OK`
    /// records the corresponding error; the CME/CMS code lands in
    /// [`RspParser::cm_err`].
    pub fn final_result(&mut self) -> usize {
        if self.err.is_some() {
            return 0;
        }
        let outcome = if self.match_line(b"OK") > 0 {
            None
        } else if self.match_line(b"ERROR") > 0 {
            Some(ParseError::FinalError)
        } else if self.match_line(b"ABORT") > 0 {
            Some(ParseError::FinalAbort)
        } else if let Some(code) = self.match_line_query(b"+CME ERROR") {
            self.cm_err = code;
            Some(ParseError::FinalCme)
        } else if let Some(code) = self.match_line_query(b"+CMS ERROR") {
            self.cm_err = code;
            Some(ParseError::FinalCms)
        } else {
            return self.res_abort(ParseError::FinalUnknown);
        };
        let n = self.res_ok();
        if let Some(e) = outcome {
            self.err = Some(e);
        }
        n
    }

    /// Read a token of `pattern` characters and binary-search it in a
    /// sorted table, returning the matching index. Used for URC and
    /// command-response classification.
    pub fn lookup<T>(
        &mut self,
        pattern: &str,
        table: &[T],
        name: impl Fn(&T) -> &[u8],
    ) -> Option<usize> {
        self.reset();
        if self.match_class_run(pattern) == 0 {
            self.res_abort(ParseError::TableNone);
            return None;
        }
        let token = &self.buf[..self.index];
        let found = table.binary_search_by(|t| name(t).cmp(token));
        match found {
            Ok(i) => {
                self.res_ok();
                Some(i)
            }
            Err(_) => {
                self.res_abort(ParseError::TableMiss);
                None
            }
        }
    }

    /// Drop buffered bytes and drain whatever the source can still deliver
    /// immediately. Returns the number of discarded bytes.
    pub fn flush(&mut self) -> usize {
        let mut n = self.buf.len();
        self.reset();
        while let SourceRead::Byte(_) = self.src.next_byte(1) {
            n += 1;
        }
        n
    }
}

/// True when `c` belongs to the class described by `pat`.
fn class_matches(pat: &[u8], c: u8) -> bool {
    let (neg, pat) = match pat.first() {
        Some(b'^') if pat.len() > 1 => (true, &pat[1..]),
        _ => (false, pat),
    };
    let mut hit = false;
    let mut i = 0;
    while i < pat.len() {
        if i + 2 < pat.len() && pat[i + 1] == b'-' {
            if pat[i] <= c && c <= pat[i + 2] {
                hit = true;
                break;
            }
            i += 3;
        } else {
            if c == pat[i] {
                hit = true;
                break;
            }
            i += 1;
        }
    }
    hit ^ neg
}

/// Parse an optionally signed decimal integer from raw digits.
fn buf2int(b: &[u8]) -> i64 {
    let (neg, digits) = match b.first() {
        Some(b'-') => (true, &b[1..]),
        Some(b'+') => (false, &b[1..]),
        _ => (false, b),
    };
    let mut v: i64 = 0;
    for &c in digits {
        if c.is_ascii_digit() {
            v = v.wrapping_mul(10).wrapping_add(i64::from(c - b'0'));
        }
    }
    if neg {
        -v
    } else {
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser(input: &[u8]) -> RspParser<SliceSource<'_>> {
        RspParser::new(SliceSource::new(input))
    }

    #[test]
    fn test_cursor_invariants_on_commit() {
        let mut p = parser(b"+CSQ: 15,99\r\n");
        assert!(p.match_str(b"+CSQ") > 0);
        assert_eq!(p.index(), 4);
        assert_eq!(p.res_ok(), 4);
        assert_eq!(p.index(), 0);
        // The unmatched remainder became the new prefix.
        assert!(p.match_str(b": ") > 0);
    }

    #[test]
    fn test_abort_restores_input() {
        let mut p = parser(b"ERROR\r\n");
        assert_eq!(p.match_str(b"OK"), 0);
        p.res_abort(ParseError::Str);
        assert_eq!(p.index(), 0);
        // Bytes are still there for the next attempt.
        let before = p.count();
        assert!(p.match_str(b"ERROR") > 0);
        assert!(p.count() >= before);
    }

    #[test]
    fn test_class_patterns() {
        assert!(class_matches(b"0-9", b'5'));
        assert!(class_matches(b"0-9", b'0'));
        assert!(class_matches(b"0-9", b'9'));
        assert!(!class_matches(b"0-9", b'a'));
        assert!(class_matches(b"A-Fa-f0-9", b'c'));
        assert!(class_matches(b"+-", b'-'));
        assert!(class_matches(b"^:", b'x'));
        assert!(!class_matches(b"^:", b':'));
        assert!(class_matches(b"+A-Z", b'+'));
        assert!(class_matches(b"+A-Z", b'Q'));
    }

    #[test]
    fn test_int_forms() {
        let mut p = parser(b"-42,");
        assert_eq!(p.int(), -42);
        assert!(p.status().is_ok());

        let mut p = parser(b"+7\r\n");
        assert_eq!(p.int(), 7);

        let mut p = parser(b"abc");
        assert_eq!(p.int(), 0);
        assert_eq!(p.error(), Some(ParseError::Int));
    }

    #[test]
    fn test_sign_without_digits_rolls_back() {
        let mut p = parser(b"+,");
        assert_eq!(p.match_int(), 0);
        assert_eq!(p.index(), 0);
    }

    #[test]
    fn test_hex_parse() {
        let mut p = parser(b"1A2b\r\n");
        assert_eq!(p.hex(), 0x1A2B);
    }

    #[test]
    fn test_quoted_plain_and_escaped() {
        let mut p = parser(b"\"93.184.216.34\"\r\n");
        assert_eq!(p.quoted(b'"', b'"', None), b"93.184.216.34");

        let mut p = parser(b"\"a\\\"b\"X");
        assert_eq!(p.quoted(b'"', b'"', Some(b'\\')), b"a\\\"b");
        assert!(p.match_char(b'X') > 0);

        let mut p = parser(b"\"\"rest");
        assert_eq!(p.quoted(b'"', b'"', Some(b'\\')), b"");
    }

    #[test]
    fn test_quoted_missing_close() {
        let mut p = parser(b"\"unterminated");
        p.quoted(b'"', b'"', None);
        assert!(p.error().is_some());
    }

    #[test]
    fn test_echo_empty_line() {
        let mut p = parser(b"\r\nOK\r\n");
        assert!(p.echo(10) > 0);
        assert!(p.final_result() > 0);
        assert!(p.status().is_ok());
    }

    #[test]
    fn test_echo_with_command() {
        let mut p = parser(b"ATE0\r\nOK\r\n");
        assert!(p.echo(10) > 0);
        assert!(p.final_result() > 0);
        assert!(p.status().is_ok());
    }

    #[test]
    fn test_echo_mismatch() {
        let mut p = parser(b"+CREG: 1\r\n");
        assert_eq!(p.echo(10), 0);
        assert_eq!(p.error(), Some(ParseError::Echo));
    }

    #[test]
    fn test_final_error_kinds() {
        let mut p = parser(b"ERROR\r\n");
        assert!(p.final_result() > 0);
        assert_eq!(p.error(), Some(ParseError::FinalError));

        let mut p = parser(b"+CME ERROR: 100\r\n");
        assert!(p.final_result() > 0);
        assert_eq!(p.error(), Some(ParseError::FinalCme));
        assert_eq!(p.cm_err(), 100);

        let mut p = parser(b"+CMS ERROR: 321\r\n");
        assert!(p.final_result() > 0);
        assert_eq!(p.error(), Some(ParseError::FinalCms));
        assert_eq!(p.cm_err(), 321);

        let mut p = parser(b"WAT\r\n");
        assert_eq!(p.final_result(), 0);
        assert_eq!(p.error(), Some(ParseError::FinalUnknown));
    }

    #[test]
    fn test_timeout_mid_match_is_distinct_and_rolled_back() {
        // Source ends mid-line: the matcher must report a read timeout and
        // leave the partial bytes unconsumed.
        let mut p = parser(b"+CRE");
        assert_eq!(p.match_str(b"+CREG"), 0);
        assert_eq!(p.error(), Some(ParseError::ReadTimeout));
        p.res_abort(ParseError::Str);
        // The earlier timeout wins over the later protocol error.
        assert_eq!(p.error(), Some(ParseError::ReadTimeout));
        assert_eq!(p.index(), 0);
        assert_eq!(p.count(), 4);
    }

    #[test]
    fn test_overflow_on_tiny_buffer() {
        let mut p = RspParser::with_capacity(SliceSource::new(b"0123456789"), 4);
        assert_eq!(p.match_str(b"0123456789"), 0);
        assert_eq!(p.error(), Some(ParseError::Overflow));
    }

    #[test]
    fn test_lookup_sorted_table() {
        let table: [&[u8]; 4] = [b"+CGREG", b"+CREG", b"+UUSORD", b"+UUSORF"];
        let mut p = parser(b"+UUSORD: 0,4\r\n");
        assert_eq!(p.lookup("+A-Z", &table, |t| *t), Some(2));
        // Token consumed; remainder available.
        assert!(p.match_str(b": ") > 0);

        let mut p = parser(b"+XYZ: 1\r\n");
        assert_eq!(p.lookup("+A-Z", &table, |t| *t), None);
        assert_eq!(p.error(), Some(ParseError::TableMiss));
    }

    #[test]
    fn test_line_dump_skips_arbitrary_content() {
        let mut p = parser(b"garbage with \" quotes\r\nOK\r\n");
        assert!(p.line_dump() > 0);
        assert!(p.final_result() > 0);
        assert!(p.status().is_ok());
    }

    #[test]
    fn test_flush_discards_everything() {
        let mut p = parser(b"stale bytes\r\n");
        assert!(p.match_str(b"stale") > 0);
        let n = p.flush();
        assert_eq!(n, 13);
        assert_eq!(p.count(), 0);
        assert_eq!(p.index(), 0);
    }

    #[test]
    fn test_match_query() {
        let mut p = parser(b"+CME ERROR: -3\r\n");
        assert_eq!(p.match_query(b"+CME ERROR"), Some(-3));
    }

    #[test]
    fn test_sticky_error_short_circuits_sequence() {
        let mut p = parser(b"1,2\r\n");
        assert_eq!(p.int(), 1);
        p.char_(b';'); // wrong delimiter
        assert_eq!(p.error(), Some(ParseError::Char));
        // Everything downstream is a no-op now.
        assert_eq!(p.int(), 0);
        assert_eq!(p.eol(), 0);
        assert_eq!(p.error(), Some(ParseError::Char));
    }
}

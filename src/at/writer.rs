//! AT request generation.
//!
//! [`CmdWriter`] formats commands incrementally into a byte sink: literal
//! bytes, signed/unsigned/hex integers with optional width and sign, plain
//! and quoted strings, the `AT` prefix, the `\r\n` terminator. Every
//! primitive honors a sticky error: once a write fails (or a format
//! argument is missing), all following primitives are no-ops returning 0,
//! so command construction needs no per-call error checking — the first
//! error is surfaced once by [`CmdWriter::finish`].

use std::io;

/// Destination for generated request bytes.
pub trait Sink {
    fn put(&mut self, bytes: &[u8]) -> io::Result<()>;
}

impl Sink for Vec<u8> {
    fn put(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

impl<S: Sink + ?Sized> Sink for &mut S {
    fn put(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).put(bytes)
    }
}

/// A format argument for [`CmdWriter::fmt`].
#[derive(Debug, Clone, Copy)]
pub enum Arg<'a> {
    Int(i64),
    Uint(u64),
    Str(&'a [u8]),
    Char(u8),
}

/// Incremental AT command writer with fail-stop semantics.
///
/// All primitives return the number of bytes written, 0 after the first
/// error.
pub struct CmdWriter<S> {
    sink: S,
    err: Option<io::Error>,
}

impl<S: Sink> CmdWriter<S> {
    pub fn new(sink: S) -> Self {
        CmdWriter { sink, err: None }
    }

    /// True once any primitive has failed.
    pub fn failed(&self) -> bool {
        self.err.is_some()
    }

    /// Surface the first error, or hand the sink back.
    pub fn finish(self) -> io::Result<S> {
        match self.err {
            Some(e) => Err(e),
            None => Ok(self.sink),
        }
    }

    fn put(&mut self, bytes: &[u8]) -> usize {
        if self.err.is_some() {
            return 0;
        }
        match self.sink.put(bytes) {
            Ok(()) => bytes.len(),
            Err(e) => {
                self.err = Some(e);
                0
            }
        }
    }

    fn fail(&mut self, why: &str) -> usize {
        if self.err.is_none() {
            self.err = Some(io::Error::new(io::ErrorKind::InvalidInput, why.to_string()));
        }
        0
    }

    /// Write a single byte.
    pub fn chr(&mut self, c: u8) -> usize {
        self.put(&[c])
    }

    /// Write a byte buffer verbatim.
    pub fn bytes(&mut self, buf: &[u8]) -> usize {
        self.put(buf)
    }

    /// Write the end-of-line `\r\n`.
    pub fn eol(&mut self) -> usize {
        self.put(b"\r\n")
    }

    /// Write the command prefix `AT`.
    pub fn at(&mut self) -> usize {
        self.put(b"AT")
    }

    /// Write `AT` followed by a command body.
    pub fn atc(&mut self, cmd: &str) -> usize {
        let n = self.at();
        if n == 0 {
            return 0;
        }
        let m = self.put(cmd.as_bytes());
        if m == 0 && !cmd.is_empty() {
            return 0;
        }
        n + m
    }

    /// Write `AT`, a command body and an operator character (`?` or `=`).
    pub fn atco(&mut self, cmd: &str, op: u8) -> usize {
        let n = self.atc(cmd);
        if n == 0 {
            return 0;
        }
        let m = self.chr(op);
        if m == 0 {
            return 0;
        }
        n + m
    }

    /// Write a query command `AT<CMD>?` with terminator.
    pub fn query(&mut self, cmd: &str) -> usize {
        let n = self.atco(cmd, b'?');
        if n == 0 {
            return 0;
        }
        let m = self.eol();
        if m == 0 {
            return 0;
        }
        n + m
    }

    /// Write a setting prefix `AT<CMD>=`.
    pub fn set(&mut self, cmd: &str) -> usize {
        self.atco(cmd, b'=')
    }

    /// Write a string.
    pub fn str_(&mut self, s: &[u8]) -> usize {
        self.put(s)
    }

    /// Write at most `n` bytes of a string.
    pub fn strn(&mut self, s: &[u8], n: usize) -> usize {
        let take = n.min(s.len());
        self.put(&s[..take])
    }

    /// Write a string surrounded by `open`/`close`, escaping the delimiters
    /// and the escape character itself when `escape` is given.
    pub fn strqqe(&mut self, s: &[u8], open: u8, close: u8, escape: Option<u8>) -> usize {
        let mut count = self.chr(open);
        if count == 0 {
            return 0;
        }
        for &c in s {
            if let Some(esc) = escape {
                if c == esc || c == open || c == close {
                    if self.chr(esc) == 0 {
                        return 0;
                    }
                    count += 1;
                }
            }
            if self.chr(c) == 0 {
                return 0;
            }
            count += 1;
        }
        if self.chr(close) == 0 {
            return 0;
        }
        count + 1
    }

    /// Write a string surrounded by `quote`, escaped with `escape`.
    pub fn strqe(&mut self, s: &[u8], quote: u8, escape: u8) -> usize {
        self.strqqe(s, quote, quote, Some(escape))
    }

    /// Write a string surrounded by `quote`, no escaping.
    pub fn strq(&mut self, s: &[u8], quote: u8) -> usize {
        self.strqqe(s, quote, quote, None)
    }

    /// Write a signed decimal integer.
    pub fn int(&mut self, i: i64) -> usize {
        self.number(i.unsigned_abs(), 10, i < 0, false, 0)
    }

    /// Write a signed decimal integer with an explicit leading `+`.
    pub fn int_plus(&mut self, i: i64) -> usize {
        self.number(i.unsigned_abs(), 10, i < 0, true, 0)
    }

    /// Write a signed decimal integer zero-padded to `width` digits.
    pub fn int_width(&mut self, i: i64, width: usize) -> usize {
        self.number(i.unsigned_abs(), 10, i < 0, false, width)
    }

    /// Write a signed decimal integer with `+` and zero padding.
    pub fn int_plus_width(&mut self, i: i64, width: usize) -> usize {
        self.number(i.unsigned_abs(), 10, i < 0, true, width)
    }

    /// Write an unsigned decimal integer.
    pub fn uint(&mut self, u: u64) -> usize {
        self.number(u, 10, false, false, 0)
    }

    /// Write an unsigned uppercase hexadecimal integer.
    pub fn hex(&mut self, x: u64) -> usize {
        self.number(x, 16, false, false, 0)
    }

    /// Write an unsigned uppercase hexadecimal integer zero-padded to `width`.
    pub fn hex_width(&mut self, x: u64, width: usize) -> usize {
        self.number(x, 16, false, false, width)
    }

    fn number(&mut self, value: u64, base: u64, neg: bool, plus: bool, width: usize) -> usize {
        // 20 digits cover u64 in base 10; the width cap keeps the scratch
        // buffer bounded.
        let mut digits = [0u8; 24];
        let width = width.min(digits.len());
        let mut pos = digits.len();
        let mut v = value;
        loop {
            pos -= 1;
            let d = (v % base) as u8;
            digits[pos] = if d < 10 { b'0' + d } else { b'A' + d - 10 };
            v /= base;
            if v == 0 {
                break;
            }
        }
        while digits.len() - pos < width {
            pos -= 1;
            digits[pos] = b'0';
        }
        let sign: &[u8] = if neg {
            b"-"
        } else if plus {
            b"+"
        } else {
            b""
        };
        let n = self.put(sign);
        if n == 0 && !sign.is_empty() {
            return 0;
        }
        let m = self.put(&digits[pos..]);
        if m == 0 {
            return 0;
        }
        n + m
    }

    /// Printf-like convenience mapping a specifier string onto the
    /// primitives, consuming arguments from `args` in order.
    ///
    /// Specifiers: `%%` literal percent, `%$` end-of-line, `%A` `AT` plus a
    /// string argument, `%c` a character (with width: a fixed-length byte
    /// run), `%d` signed integer (`+` forces the sign, a width zero-pads),
    /// `%u` unsigned, `%x` uppercase hex (width zero-pads), `%s` a string —
    /// `%"s` double-quotes it with backslash escaping, `'`/`|`/`<`/`>`
    /// flags take quote/escape characters from the argument list. Every
    /// other byte is written verbatim.
    pub fn fmt(&mut self, spec: &str, args: &[Arg<'_>]) -> usize {
        if self.err.is_some() {
            return 0;
        }
        let mut count = 0;
        let mut next = 0usize;
        let mut take = |w: &mut Self| {
            let a = args.get(next).copied();
            if a.is_none() {
                w.fail("missing format argument");
            }
            next += 1;
            a
        };

        let bytes = spec.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            let c = bytes[i];
            i += 1;
            if c != b'%' {
                if self.chr(c) == 0 {
                    return 0;
                }
                count += 1;
                continue;
            }

            let mut dquote = false;
            let mut plus = false;
            let mut squote = None;
            let mut escape = None;
            let mut open = None;
            let mut close = None;
            let mut width = 0usize;
            loop {
                let f = match bytes.get(i) {
                    Some(&f) => f,
                    None => return self.fail("truncated format specifier"),
                };
                match f {
                    b'"' => dquote = true,
                    b'+' => plus = true,
                    b'\'' => match take(self) {
                        Some(Arg::Char(q)) => squote = Some(q),
                        _ => return self.fail("quote flag needs a char argument"),
                    },
                    b'|' => match take(self) {
                        Some(Arg::Char(e)) => escape = Some(e),
                        _ => return self.fail("escape flag needs a char argument"),
                    },
                    b'<' => match take(self) {
                        Some(Arg::Char(q)) => open = Some(q),
                        _ => return self.fail("open-quote flag needs a char argument"),
                    },
                    b'>' => match take(self) {
                        Some(Arg::Char(q)) => close = Some(q),
                        _ => return self.fail("close-quote flag needs a char argument"),
                    },
                    b'*' => match take(self) {
                        Some(Arg::Int(w)) if w >= 0 => width = w as usize,
                        Some(Arg::Uint(w)) => width = w as usize,
                        _ => return self.fail("width flag needs an integer argument"),
                    },
                    b'0'..=b'9' => {
                        width = width * 10 + (f - b'0') as usize;
                    }
                    _ => break,
                }
                i += 1;
            }

            let specifier = bytes[i];
            i += 1;
            let n = match specifier {
                b'%' => self.chr(b'%'),
                b'$' => self.eol(),
                b'A' => match take(self) {
                    Some(Arg::Str(s)) => {
                        match std::str::from_utf8(s) {
                            Ok(cmd) => self.atc(cmd),
                            Err(_) => return self.fail("command body is not ASCII"),
                        }
                    }
                    _ => return self.fail("%A needs a string argument"),
                },
                b'c' => match take(self) {
                    Some(Arg::Char(c)) if width == 0 => self.chr(c),
                    Some(Arg::Str(s)) if width > 0 => self.strn(s, width),
                    _ => return self.fail("%c argument mismatch"),
                },
                b'd' => match take(self) {
                    Some(Arg::Int(v)) => match (plus, width) {
                        (false, 0) => self.int(v),
                        (true, 0) => self.int_plus(v),
                        (false, w) => self.int_width(v, w),
                        (true, w) => self.int_plus_width(v, w),
                    },
                    _ => return self.fail("%d needs an integer argument"),
                },
                b'u' => match take(self) {
                    Some(Arg::Uint(v)) => self.uint(v),
                    Some(Arg::Int(v)) if v >= 0 => self.uint(v as u64),
                    _ => return self.fail("%u needs an unsigned argument"),
                },
                b'x' => match take(self) {
                    Some(Arg::Uint(v)) => {
                        if width > 0 {
                            self.hex_width(v, width)
                        } else {
                            self.hex(v)
                        }
                    }
                    Some(Arg::Int(v)) if v >= 0 => {
                        if width > 0 {
                            self.hex_width(v as u64, width)
                        } else {
                            self.hex(v as u64)
                        }
                    }
                    _ => return self.fail("%x needs an unsigned argument"),
                },
                b's' => match take(self) {
                    Some(Arg::Str(s)) => {
                        if width > 0 {
                            self.strn(s, width)
                        } else if dquote {
                            self.strqe(s, b'"', b'\\')
                        } else if let Some(q) = squote {
                            match escape {
                                Some(e) => self.strqe(s, q, e),
                                None => self.strq(s, q),
                            }
                        } else if let (Some(o), Some(c)) = (open, close) {
                            self.strqqe(s, o, c, escape)
                        } else {
                            self.str_(s)
                        }
                    }
                    _ => return self.fail("%s needs a string argument"),
                },
                _ => return self.fail("unknown format specifier"),
            };
            if n == 0 && self.err.is_some() {
                return 0;
            }
            count += n;
        }
        count
    }
}

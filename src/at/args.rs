//! Reply payload splitting.
//!
//! Information lines arrive as `<body>: <arg>,<arg>,…`. After the reader
//! has stored the argument portion in the slot, callers split it with
//! [`split`], typing each field through a one-letter specifier:
//!
//! - `i` — decimal integer (interspersed spaces tolerated, empty is 0)
//! - `S` — string with one surrounding quote pair stripped
//! - `s` — raw string
//!
//! Fields are delimited by `,`, `\r` or `\n`; delimiters inside a quoted
//! field do not split (SMS timestamps carry a comma).

use crate::error::ParseError;

/// One typed reply field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Val<'a> {
    Int(i64),
    Bytes(&'a [u8]),
}

impl<'a> Val<'a> {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Val::Int(v) => Some(*v),
            Val::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&'a [u8]> {
        match self {
            Val::Bytes(b) => Some(b),
            Val::Int(_) => None,
        }
    }

    /// Lossy UTF-8 view of a string field.
    pub fn to_text(&self) -> Option<String> {
        self.as_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }
}

/// Split `buf` according to `fmt`, returning as many fields as matched.
/// Parsing stops at the first field that cannot be typed, so the returned
/// length tells the caller how far it got (trailing fields are optional in
/// several responses).
pub fn split<'a>(buf: &'a [u8], fmt: &str) -> Vec<Val<'a>> {
    let mut out = Vec::with_capacity(fmt.len());
    let mut pos = 0usize;
    for spec in fmt.chars() {
        let Some(field) = next_field(buf, &mut pos) else {
            break;
        };
        match spec {
            'i' => match field_int(field) {
                Some(v) => out.push(Val::Int(v)),
                None => break,
            },
            'S' => out.push(Val::Bytes(strip_quotes(field))),
            's' => out.push(Val::Bytes(field)),
            _ => break,
        }
    }
    out
}

/// Like [`split`], but every specifier must match.
pub fn require<'a>(buf: &'a [u8], fmt: &str) -> Result<Vec<Val<'a>>, ParseError> {
    let vals = split(buf, fmt);
    if vals.len() == fmt.len() {
        Ok(vals)
    } else {
        Err(ParseError::Args)
    }
}

fn next_field<'a>(buf: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    if *pos >= buf.len() {
        return None;
    }
    let start = *pos;
    let mut i = start;
    let mut in_quotes = false;
    while i < buf.len() {
        let c = buf[i];
        if c == b'"' {
            in_quotes = !in_quotes;
        } else if !in_quotes && (c == b',' || c == b'\r' || c == b'\n') {
            break;
        }
        i += 1;
    }
    *pos = i + 1;
    Some(&buf[start..i])
}

fn field_int(field: &[u8]) -> Option<i64> {
    let mut v: i64 = 0;
    for &c in field {
        match c {
            b'0'..=b'9' => v = v.wrapping_mul(10).wrapping_add(i64::from(c - b'0')),
            b' ' => {}
            _ => return None,
        }
    }
    Some(v)
}

/// Strip one surrounding quote pair, if present.
pub(crate) fn strip_quotes(field: &[u8]) -> &[u8] {
    let field = match field.first() {
        Some(b'"') => &field[1..],
        _ => field,
    };
    match field.last() {
        Some(b'"') => &field[..field.len() - 1],
        _ => field,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ints_and_strings() {
        let vals = split(b"0,4,\"1.2.3.4\",9999", "iiSi");
        assert_eq!(
            vals,
            vec![
                Val::Int(0),
                Val::Int(4),
                Val::Bytes(b"1.2.3.4"),
                Val::Int(9999)
            ]
        );
    }

    #[test]
    fn test_quoted_field_keeps_embedded_comma() {
        let vals = split(
            b"1,\"REC UNREAD\",\"+15551234567\",,\"21/03/23,10:30:00+04\"",
            "issss",
        );
        assert_eq!(vals.len(), 5);
        assert_eq!(vals[0], Val::Int(1));
        assert_eq!(vals[1], Val::Bytes(b"\"REC UNREAD\""));
        assert_eq!(vals[3], Val::Bytes(b""));
        assert_eq!(vals[4], Val::Bytes(b"\"21/03/23,10:30:00+04\""));
    }

    #[test]
    fn test_quote_stripping() {
        let vals = split(b"\"example.com\"", "S");
        assert_eq!(vals[0], Val::Bytes(b"example.com"));
        // `s` keeps the quotes.
        let vals = split(b"\"example.com\"", "s");
        assert_eq!(vals[0], Val::Bytes(b"\"example.com\""));
    }

    #[test]
    fn test_empty_int_field_is_zero() {
        let vals = split(b",5", "ii");
        assert_eq!(vals, vec![Val::Int(0), Val::Int(5)]);
    }

    #[test]
    fn test_spaces_inside_numbers() {
        let vals = split(b" 12 3,4", "ii");
        assert_eq!(vals, vec![Val::Int(123), Val::Int(4)]);
    }

    #[test]
    fn test_stop_at_untypable_field() {
        let vals = split(b"7,abc,9", "iii");
        assert_eq!(vals, vec![Val::Int(7)]);
        assert!(require(b"7,abc,9", "iii").is_err());
    }

    #[test]
    fn test_require_exact() {
        assert!(require(b"0,4", "ii").is_ok());
        assert!(require(b"0", "ii").is_err());
    }
}

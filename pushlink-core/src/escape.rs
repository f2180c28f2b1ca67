//! Percent escaping and update-field framing.
//!
//! The server reserves `% & = , | # $ +` plus CR/LF inside parameter values
//! and update fields. Reserved bytes are written as `%XX` (uppercase hex),
//! one escape per UTF-8 byte. Compatibility with the server is bit-exact on
//! this set: escaping a character outside it would change the line the
//! server compares against.

use std::borrow::Cow;

use crate::ProtocolError;

fn is_reserved(b: u8) -> bool {
    matches!(b, b'%' | b'&' | b'=' | b',' | b'|' | b'#' | b'$' | b'+') || b < 0x20
}

/// Escape a value for use in a request parameter or a directive field.
pub fn escape(s: &str) -> Cow<'_, str> {
    if !s.bytes().any(is_reserved) {
        return Cow::Borrowed(s);
    }
    let mut out = String::with_capacity(s.len() + 8);
    for c in s.chars() {
        // Reserved characters are all single-byte ASCII.
        if c.is_ascii() && is_reserved(c as u8) {
            out.push_str(&format!("%{:02X}", c as u32));
        } else {
            out.push(c);
        }
    }
    Cow::Owned(out)
}

/// Reverse of [`escape`]. Accepts any `%XX` sequence, not only the reserved
/// set, so it also tolerates over-escaping servers.
pub fn unescape(s: &str) -> Result<String, ProtocolError> {
    if !s.contains('%') {
        return Ok(s.to_string());
    }
    let mut out = Vec::with_capacity(s.len());
    let mut bytes = s.bytes();
    while let Some(b) = bytes.next() {
        if b == b'%' {
            let hi = bytes.next().and_then(|c| (c as char).to_digit(16));
            let lo = bytes.next().and_then(|c| (c as char).to_digit(16));
            match (hi, lo) {
                (Some(hi), Some(lo)) => out.push(((hi << 4) | lo) as u8),
                _ => return Err(ProtocolError::BadEscape(s.to_string())),
            }
        } else {
            out.push(b);
        }
    }
    String::from_utf8(out).map_err(|_| ProtocolError::BadEscape(s.to_string()))
}

/// One field of an update notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// The field did not change since the previous update of this item/key.
    Unchanged,
    /// The field is null.
    Null,
    /// The field is the empty string.
    Empty,
    /// An actual value.
    Value(String),
}

impl FieldValue {
    /// The value as an optional string, resolving `Unchanged` to `None`
    /// only makes sense at the subscription layer; here `Unchanged` is an
    /// error to resolve, so this is limited to the three terminal forms.
    pub fn as_option(&self) -> Option<Option<&str>> {
        match self {
            FieldValue::Unchanged => None,
            FieldValue::Null => Some(None),
            FieldValue::Empty => Some(Some("")),
            FieldValue::Value(v) => Some(Some(v)),
        }
    }
}

/// Split the `|`-separated field part of an update line.
///
/// Empty field = unchanged, `#` = null, `$` = empty string, anything else is
/// an escaped value.
pub fn split_update_fields(s: &str) -> Result<Vec<FieldValue>, ProtocolError> {
    s.split('|')
        .map(|f| match f {
            "" => Ok(FieldValue::Unchanged),
            "#" => Ok(FieldValue::Null),
            "$" => Ok(FieldValue::Empty),
            v => Ok(FieldValue::Value(unescape(v)?)),
        })
        .collect()
}

/// Reverse of [`split_update_fields`]; used by the encoder and by test
/// servers.
pub fn join_update_fields(fields: &[FieldValue]) -> String {
    let mut out = String::new();
    for (i, f) in fields.iter().enumerate() {
        if i > 0 {
            out.push('|');
        }
        match f {
            FieldValue::Unchanged => {}
            FieldValue::Null => out.push('#'),
            FieldValue::Empty => out.push('$'),
            FieldValue::Value(v) => out.push_str(&escape(v)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_reserved() {
        assert_eq!(escape("plain"), "plain");
        assert_eq!(escape("a,b|c"), "a%2Cb%7Cc");
        assert_eq!(escape("100%"), "100%25");
        assert_eq!(escape("x\r\ny"), "x%0D%0Ay");
    }

    #[test]
    fn unescape_round_trip() {
        for s in ["", "plain", "a,b|c#d$e", "100% & more = yes", "crlf\r\n"] {
            assert_eq!(unescape(&escape(s)).unwrap(), s);
        }
    }

    #[test]
    fn unescape_rejects_truncated() {
        assert!(unescape("abc%2").is_err());
        assert!(unescape("abc%zz").is_err());
    }

    #[test]
    fn fields_markers() {
        let fields = split_update_fields("|#|$|v%7C1").unwrap();
        assert_eq!(
            fields,
            vec![
                FieldValue::Unchanged,
                FieldValue::Null,
                FieldValue::Empty,
                FieldValue::Value("v|1".into())
            ]
        );
        assert_eq!(join_update_fields(&fields), "|#|$|v%7C1");
    }

    #[test]
    fn literal_markers_stay_distinct() {
        // A real "#" value must not collapse into the null marker.
        let enc = join_update_fields(&[FieldValue::Value("#".into())]);
        assert_eq!(enc, "%23");
        assert_eq!(
            split_update_fields(&enc).unwrap(),
            vec![FieldValue::Value("#".into())]
        );
    }
}

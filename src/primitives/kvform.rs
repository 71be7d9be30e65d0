//! The key-value form used by direct responses and stored associations.
//!
//! A form is a sequence of `key:value\n` lines in UTF-8. There is no terminating blank line. The
//! same encoding, applied to an ordered selection of message fields, is the base string over which
//! association signatures are computed.
use std::collections::HashMap;

use crate::channel::error::ProtocolError;

/// How strictly a key-value form is checked.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Conformance {
    /// Whitespace around keys and values is trimmed, lines without a colon are skipped.
    Loose,

    /// Whitespace around keys and values is an error, as is a line without a colon or a missing
    /// newline after the last line.
    Strict,
}

/// Encode the pairs, in order, into the key-value form.
///
/// Keys must not contain `:` or a newline and values must not contain a newline, regardless of
/// the conformance level.
pub fn encode<I, K, V>(pairs: I, conformance: Conformance) -> Result<Vec<u8>, ProtocolError>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut form = String::new();

    for (key, value) in pairs {
        let (key, value) = (key.as_ref(), value.as_ref());
        if key.contains(|c| c == '\n' || c == ':') {
            return Err(ProtocolError::Malformed(format!(
                "illegal character in key-value form key {:?}",
                key
            )));
        }

        if value.contains('\n') {
            return Err(ProtocolError::Malformed(format!(
                "illegal newline in key-value form value of {:?}",
                key
            )));
        }

        let (key, value) = match conformance {
            Conformance::Loose => (key.trim(), value.trim()),
            Conformance::Strict => {
                if key.trim() != key || value.trim() != value {
                    return Err(ProtocolError::Malformed(format!(
                        "whitespace around key-value form pair {:?}",
                        key
                    )));
                }
                (key, value)
            }
        };

        form.push_str(key);
        form.push(':');
        form.push_str(value);
        form.push('\n');
    }

    Ok(form.into_bytes())
}

/// Decode a key-value form into its pairs, preserving their order.
///
/// A key appearing twice is always rejected.
pub fn decode(
    data: &[u8],
    conformance: Conformance,
) -> Result<Vec<(String, String)>, ProtocolError> {
    let text = std::str::from_utf8(data)
        .map_err(|_| ProtocolError::Malformed("key-value form is not valid UTF-8".into()))?;

    if conformance == Conformance::Strict && !text.is_empty() && !text.ends_with('\n') {
        return Err(ProtocolError::Malformed(
            "key-value form does not end with a newline".into(),
        ));
    }

    let mut pairs: Vec<(String, String)> = Vec::new();
    for (number, line) in text.split('\n').enumerate() {
        let line = match conformance {
            Conformance::Loose => line.trim(),
            Conformance::Strict => line,
        };

        if line.is_empty() {
            continue;
        }

        let (key, value) = match line.find(':') {
            Some(idx) => (&line[..idx], &line[idx + 1..]),
            None if conformance == Conformance::Loose => {
                warn!("Skipping line {} of key-value form, no ':' found", number + 1);
                continue;
            }
            None => {
                return Err(ProtocolError::Malformed(format!(
                    "line {} of key-value form has no ':'",
                    number + 1
                )))
            }
        };

        let (key, value) = match conformance {
            Conformance::Loose => (key.trim(), value.trim()),
            Conformance::Strict => {
                if key.ends_with(char::is_whitespace) || value.starts_with(char::is_whitespace) {
                    return Err(ProtocolError::Malformed(format!(
                        "line {} of key-value form has whitespace around ':'",
                        number + 1
                    )));
                }
                (key, value)
            }
        };

        if pairs.iter().any(|(existing, _)| existing == key) {
            return Err(ProtocolError::DuplicateParameter(key.to_string()));
        }

        pairs.push((key.to_string(), value.to_string()));
    }

    Ok(pairs)
}

/// Decode into an unordered map, for callers that only look up keys.
pub fn decode_map(
    data: &[u8],
    conformance: Conformance,
) -> Result<HashMap<String, String>, ProtocolError> {
    decode(data, conformance).map(|pairs| pairs.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_form() {
        let map = decode_map(b"handle:abc\nsecret:AAAA\n", Conformance::Loose).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map["handle"], "abc");
        assert_eq!(map["secret"], "AAAA");
    }

    #[test]
    fn skips_line_without_colon() {
        let map = decode_map(b"bad line without colon\n", Conformance::Loose).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn value_may_contain_colon() {
        let pairs = decode(b"return_to:http://example/cb\n", Conformance::Strict).unwrap();
        assert_eq!(pairs, vec![("return_to".to_string(), "http://example/cb".to_string())]);
    }

    #[test]
    fn strict_rejects_sloppy_forms() {
        assert!(decode(b"bad line\n", Conformance::Strict).is_err());
        assert!(decode(b"key : value\n", Conformance::Strict).is_err());
        assert!(decode(b"key:value", Conformance::Strict).is_err());
        assert!(decode(b"key:value", Conformance::Loose).is_ok());
    }

    #[test]
    fn duplicate_keys_rejected() {
        match decode(b"a:1\na:2\n", Conformance::Loose) {
            Err(ProtocolError::DuplicateParameter(key)) => assert_eq!(key, "a"),
            other => panic!("Expected duplicate parameter error, got {:?}", other),
        }
    }

    #[test]
    fn encoding_order_and_format() {
        let encoded = encode(
            vec![("mode", "id_res"), ("return_to", "http://example/cb")],
            Conformance::Strict,
        )
        .unwrap();
        assert_eq!(encoded, b"mode:id_res\nreturn_to:http://example/cb\n".to_vec());
    }

    #[test]
    fn encoding_rejects_illegal_characters() {
        assert!(encode(vec![("a:b", "c")], Conformance::Loose).is_err());
        assert!(encode(vec![("a", "b\nc")], Conformance::Loose).is_err());
        assert!(encode(vec![(" a", "b")], Conformance::Strict).is_err());
        assert_eq!(
            encode(vec![(" a", "b ")], Conformance::Loose).unwrap(),
            b"a:b\n".to_vec()
        );
    }
}

//! DER encoding of entitlements for slot -7.
//!
//! The layout is the one `codesign --generate-entitlement-der` produces:
//!
//! ```text
//! [APPLICATION 16] {
//!     INTEGER 1,
//!     [CONTEXT 16] {                 -- dictionary
//!         SEQUENCE { UTF8String key, value }, ...   -- keys sorted
//!     }
//! }
//! ```
//!
//! Arrays are SEQUENCEs, strings UTF8String, booleans BOOLEAN (true = 0xff)
//! and integers minimal two's complement INTEGER.

use crate::{Error, Result};
use plist::Value;
use std::collections::BTreeMap;

const DER_TAG_BOOLEAN: u8 = 0x01;
const DER_TAG_INTEGER: u8 = 0x02;
const DER_TAG_UTF8STRING: u8 = 0x0c;
const DER_TAG_SEQUENCE: u8 = 0x30;

/// `[CONTEXT 16]` constructed, used for dictionaries
const DER_TAG_DICTIONARY: u8 = 0xb0;

/// `[APPLICATION 16]` constructed, the outer envelope
const DER_TAG_ENVELOPE: u8 = 0x70;

/// Encode a length value in DER format.
fn encode_length(output: &mut Vec<u8>, length: usize) {
    if length < 128 {
        output.push(length as u8);
    } else {
        let bytes_needed = (64 - (length as u64).leading_zeros() as usize).div_ceil(8);
        output.push(0x80 | bytes_needed as u8);
        for i in (0..bytes_needed).rev() {
            output.push(((length >> (i * 8)) & 0xff) as u8);
        }
    }
}

fn encode_tlv(output: &mut Vec<u8>, tag: u8, content: &[u8]) {
    output.push(tag);
    encode_length(output, content.len());
    output.extend(content);
}

/// Minimal two's complement bytes of `value`.
fn signed_bytes(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 7 {
        let (b, next) = (bytes[start], bytes[start + 1]);
        let redundant = (b == 0x00 && next & 0x80 == 0) || (b == 0xff && next & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

fn encode_integer(output: &mut Vec<u8>, integer: &plist::Integer) -> Result<()> {
    let content = if let Some(v) = integer.as_signed() {
        signed_bytes(v)
    } else if let Some(v) = integer.as_unsigned() {
        // above i64::MAX, needs a leading zero
        let mut content = vec![0u8];
        content.extend(v.to_be_bytes());
        content
    } else {
        return Err(Error::Format("unrepresentable integer entitlement".into()));
    };
    encode_tlv(output, DER_TAG_INTEGER, &content);
    Ok(())
}

fn encode_value(output: &mut Vec<u8>, value: &Value) -> Result<()> {
    match value {
        Value::Boolean(b) => encode_tlv(output, DER_TAG_BOOLEAN, &[if *b { 0xff } else { 0x00 }]),
        Value::Integer(i) => encode_integer(output, i)?,
        Value::String(s) => encode_tlv(output, DER_TAG_UTF8STRING, s.as_bytes()),
        Value::Array(arr) => {
            let mut content = Vec::new();
            for item in arr {
                encode_value(&mut content, item)?;
            }
            encode_tlv(output, DER_TAG_SEQUENCE, &content);
        }
        Value::Dictionary(dict) => {
            let sorted: BTreeMap<&str, &Value> =
                dict.iter().map(|(k, v)| (k.as_str(), v)).collect();
            let mut content = Vec::new();
            for (key, val) in sorted {
                let mut pair = Vec::new();
                encode_tlv(&mut pair, DER_TAG_UTF8STRING, key.as_bytes());
                encode_value(&mut pair, val)?;
                encode_tlv(&mut content, DER_TAG_SEQUENCE, &pair);
            }
            encode_tlv(output, DER_TAG_DICTIONARY, &content);
        }
        Value::Data(_) => return Err(unsupported("data")),
        Value::Date(_) => return Err(unsupported("date")),
        Value::Real(_) => return Err(unsupported("real")),
        _ => return Err(unsupported("unknown")),
    }
    Ok(())
}

fn unsupported(kind: &str) -> Error {
    Error::Format(format!("{kind} values cannot be DER encoded in entitlements"))
}

/// Encodes an entitlements plist value.
pub fn der_encode_entitlements(value: &Value) -> Result<Vec<u8>> {
    let mut content = Vec::new();
    encode_tlv(&mut content, DER_TAG_INTEGER, &[1]);
    encode_value(&mut content, value)?;
    let mut output = Vec::with_capacity(content.len() + 4);
    encode_tlv(&mut output, DER_TAG_ENVELOPE, &content);
    Ok(output)
}

/// Parses plist entitlements (XML or binary) and encodes them.
pub fn plist_to_der(plist_data: &[u8]) -> Result<Vec<u8>> {
    let value = Value::from_reader(std::io::Cursor::new(plist_data))?;
    der_encode_entitlements(&value)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DER_EMPTY_DICT: &[u8] = &[112, 5, 2, 1, 1, 176, 0];
    const DER_BOOL_TRUE: &[u8] = &[
        112, 15, 2, 1, 1, 176, 10, 48, 8, 12, 3, 107, 101, 121, 1, 1, 255,
    ];
    const DER_INTEGER_NEG1: &[u8] = &[
        112, 15, 2, 1, 1, 176, 10, 48, 8, 12, 3, 107, 101, 121, 2, 1, 255,
    ];
    const DER_STRING_VALUE: &[u8] = &[
        112, 19, 2, 1, 1, 176, 14, 48, 12, 12, 3, 107, 101, 121, 12, 5, 118, 97, 108, 117, 101,
    ];
    const DER_ARRAY_TRUE_FOO: &[u8] = &[
        112, 22, 2, 1, 1, 176, 17, 48, 15, 12, 3, 107, 101, 121, 48, 8, 1, 1, 255, 12, 3, 102, 111,
        111,
    ];
    const DER_MULTIPLE_KEYS: &[u8] = &[
        112, 37, 2, 1, 1, 176, 32, 48, 8, 12, 3, 107, 101, 121, 1, 1, 0, 48, 9, 12, 4, 107, 101,
        121, 50, 1, 1, 255, 48, 9, 12, 4, 107, 101, 121, 51, 2, 1, 42,
    ];

    fn single(value: Value) -> Vec<u8> {
        let mut dict = plist::Dictionary::new();
        dict.insert("key".into(), value);
        der_encode_entitlements(&Value::Dictionary(dict)).unwrap()
    }

    #[test]
    fn test_encode_length() {
        let mut buf = Vec::new();
        encode_length(&mut buf, 10);
        assert_eq!(buf, vec![10]);
        buf.clear();
        encode_length(&mut buf, 256);
        assert_eq!(buf, vec![0x82, 0x01, 0x00]);
    }

    #[test]
    fn test_known_vectors() {
        assert_eq!(
            der_encode_entitlements(&Value::Dictionary(plist::Dictionary::new())).unwrap(),
            DER_EMPTY_DICT
        );
        assert_eq!(single(Value::Boolean(true)), DER_BOOL_TRUE);
        assert_eq!(single(Value::Integer((-1).into())), DER_INTEGER_NEG1);
        assert_eq!(single(Value::String("value".into())), DER_STRING_VALUE);
        assert_eq!(
            single(Value::Array(vec![Value::Boolean(true), Value::String("foo".into())])),
            DER_ARRAY_TRUE_FOO
        );
    }

    #[test]
    fn test_keys_sorted() {
        // inserted out of order
        let mut dict = plist::Dictionary::new();
        dict.insert("key3".into(), Value::Integer(42.into()));
        dict.insert("key".into(), Value::Boolean(false));
        dict.insert("key2".into(), Value::Boolean(true));
        assert_eq!(
            der_encode_entitlements(&Value::Dictionary(dict)).unwrap(),
            DER_MULTIPLE_KEYS
        );
    }

    #[test]
    fn test_signed_integers() {
        assert_eq!(signed_bytes(0), vec![0x00]);
        assert_eq!(signed_bytes(127), vec![0x7f]);
        assert_eq!(signed_bytes(128), vec![0x00, 0x80]);
        assert_eq!(signed_bytes(256), vec![0x01, 0x00]);
        assert_eq!(signed_bytes(-128), vec![0x80]);
        assert_eq!(signed_bytes(-129), vec![0xff, 0x7f]);
    }

    #[test]
    fn test_plist_to_der() {
        let xml = br#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>key</key>
    <true/>
</dict>
</plist>"#;
        assert_eq!(plist_to_der(xml).unwrap(), DER_BOOL_TRUE);
    }

    #[test]
    fn test_rejects_data_values() {
        assert!(matches!(
            der_encode_entitlements(&Value::Data(vec![1])),
            Err(Error::Format(_))
        ));
    }
}

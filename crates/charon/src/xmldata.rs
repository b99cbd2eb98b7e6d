//! Binary-safe payload encoding for XML child elements.
//!
//! A payload byte string is stored below a wrapper element as a sequence of
//! `<raw>`, `<base64>` and `<zlib>` children.  Plain printable data goes in
//! as `<raw>` character data, anything binary is base64-encoded, and large
//! payloads are zlib-compressed when that actually saves space.  Decoding
//! concatenates the decoded bytes of all children in document order.

use std::io::Read;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use minidom::Element;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Hard cap on the number of decoded bytes produced by a single payload
/// decode.  Last-resort sanity check against memory exhaustion through
/// highly compressed data.
pub const MAX_PAYLOAD_SIZE: usize = 64 << 20;

/// Payloads shorter than this are never worth compressing.
const COMPRESSION_THRESHOLD: usize = 128;

/// Compressed data is kept only if compressed * 100 <= raw * KEEP_PERCENT.
const KEEP_PERCENT: usize = 70;

#[derive(Debug, Error, PartialEq)]
pub enum PayloadError {
    #[error("unknown payload child element <{0}/>")]
    UnknownChild(String),

    #[error("invalid base64 data: {0}")]
    Base64(String),

    #[error("invalid zlib data: {0}")]
    Zlib(String),

    #[error("decoded payload exceeds maximum size")]
    TooLarge,

    #[error("payload is not valid UTF-8")]
    Utf8,

    #[error("invalid JSON payload: {0}")]
    Json(String),
}

/// Returns true if the payload can be stored as literal character data:
/// only `\n` and printable ASCII, nothing that XML or the wire would
/// mangle silently.
fn can_store_raw(payload: &[u8]) -> bool {
    payload
        .iter()
        .all(|&b| b == b'\n' || (0x20..0x80).contains(&b))
}

/// Appends the encoded children for `payload` to `elem`, choosing among
/// the three encodings.
fn append_payload_children(elem: &mut Element, ns: &str, payload: &[u8]) {
    if payload.is_empty() {
        return;
    }

    if payload.len() >= COMPRESSION_THRESHOLD {
        if let Some(child) = try_compress(ns, payload) {
            elem.append_child(child);
            return;
        }
    }

    if can_store_raw(payload) {
        let text = std::str::from_utf8(payload).expect("raw payloads are ASCII");
        let child = Element::builder("raw", ns).append(text).build();
        elem.append_child(child);
    } else {
        let child = Element::builder("base64", ns)
            .append(BASE64_STANDARD.encode(payload))
            .build();
        elem.append_child(child);
    }
}

/// Attempts zlib compression, returning the `<zlib>` child only when the
/// result is small enough to be worth it.
fn try_compress(ns: &str, payload: &[u8]) -> Option<Element> {
    use std::io::Write;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload).ok()?;
    let compressed = encoder.finish().ok()?;

    if compressed.len() * 100 > payload.len() * KEEP_PERCENT {
        return None;
    }

    let mut child = Element::builder("zlib", ns)
        .attr("size", payload.len().to_string())
        .build();
    append_payload_children(&mut child, ns, &compressed);
    Some(child)
}

/// Encodes a payload byte string into a new element of the given name.
pub fn encode_payload(name: &str, ns: &str, payload: &[u8]) -> Element {
    let mut elem = Element::builder(name, ns).build();
    append_payload_children(&mut elem, ns, payload);
    elem
}

/// Decodes the payload stored below the given element.  The children are
/// decoded in document order and concatenated.
pub fn decode_payload(elem: &Element) -> Result<Vec<u8>, PayloadError> {
    let mut budget = MAX_PAYLOAD_SIZE;
    decode_children(elem, &mut budget)
}

fn decode_children(elem: &Element, budget: &mut usize) -> Result<Vec<u8>, PayloadError> {
    let mut out = Vec::new();
    for child in elem.children() {
        let piece = decode_child(child, budget)?;
        out.extend_from_slice(&piece);
    }
    Ok(out)
}

fn decode_child(child: &Element, budget: &mut usize) -> Result<Vec<u8>, PayloadError> {
    let decoded = match child.name() {
        "raw" => child.text().into_bytes(),
        "base64" => decode_base64(&child.text())?,
        "zlib" => return decode_zlib(child, budget),
        other => {
            warn!(child = other, "invalid payload child element");
            return Err(PayloadError::UnknownChild(other.to_string()));
        }
    };

    if decoded.len() > *budget {
        warn!("payload exceeds the maximum decoded size");
        return Err(PayloadError::TooLarge);
    }
    *budget -= decoded.len();

    Ok(decoded)
}

/// Strict base64 decoding: embedded whitespace is tolerated, but padding
/// must be trailing and everything else must be from the standard
/// alphabet.
fn decode_base64(text: &str) -> Result<Vec<u8>, PayloadError> {
    let stripped: String = text
        .chars()
        .filter(|c| !matches!(c, ' ' | '\n' | '\r' | '\t'))
        .collect();

    BASE64_STANDARD
        .decode(stripped.as_bytes())
        .map_err(|e| PayloadError::Base64(e.to_string()))
}

fn decode_zlib(child: &Element, budget: &mut usize) -> Result<Vec<u8>, PayloadError> {
    let size: usize = child
        .attr("size")
        .ok_or_else(|| PayloadError::Zlib("missing size attribute".to_string()))?
        .parse()
        .map_err(|_| PayloadError::Zlib("malformed size attribute".to_string()))?;

    if size > *budget {
        warn!(size, "zlib payload declares a size beyond the maximum");
        return Err(PayloadError::TooLarge);
    }

    let compressed = decode_children(child, budget)?;
    // Only the inflated bytes count against the budget; the compressed
    // intermediate is refunded once consumed.
    *budget += compressed.len();

    let mut inflated = Vec::new();
    ZlibDecoder::new(&compressed[..])
        .take(size as u64 + 1)
        .read_to_end(&mut inflated)
        .map_err(|e| PayloadError::Zlib(e.to_string()))?;

    if inflated.len() != size {
        warn!(
            declared = size,
            actual = inflated.len(),
            "zlib payload size mismatch"
        );
        return Err(PayloadError::Zlib("size mismatch".to_string()));
    }

    *budget -= inflated.len();
    Ok(inflated)
}

/// Serializes a JSON value with the canonical writer and stores it as
/// payload of a new element.
pub fn encode_json(name: &str, ns: &str, value: &Value) -> Element {
    let serialised = serde_json::to_string(value).expect("JSON serialization cannot fail");
    encode_payload(name, ns, serialised.as_bytes())
}

/// Decodes a JSON value from the payload of the given element.  Parsing is
/// strict: no trailing content and no duplicate object keys.
pub fn decode_json(elem: &Element) -> Result<Value, PayloadError> {
    let payload = decode_payload(elem)?;
    let text = std::str::from_utf8(&payload).map_err(|_| PayloadError::Utf8)?;
    parse_json_strict(text)
}

/// Strict JSON parsing on top of serde_json, which by itself accepts
/// duplicate object keys (last one wins).  The wire contract rejects them,
/// so a second pass scans the already-validated text for repeats.
pub fn parse_json_strict(text: &str) -> Result<Value, PayloadError> {
    let value: Value = serde_json::from_str(text).map_err(|e| {
        warn!(error = %e, "failed parsing JSON payload");
        PayloadError::Json(e.to_string())
    })?;

    check_duplicate_keys(text)?;
    Ok(value)
}

enum JsonCtx {
    Object {
        keys: std::collections::HashSet<String>,
        expect_key: bool,
    },
    Array,
}

/// Decodes the escape sequences of a scanned string body.  The input is a
/// slice of text that serde_json has already validated, so decoding cannot
/// fail in practice; the raw form is kept as a fallback.
fn decode_json_string(raw: &str) -> String {
    serde_json::from_str(&format!("\"{raw}\"")).unwrap_or_else(|_| raw.to_string())
}

/// Scans serde-validated JSON text for duplicate keys within one object.
fn check_duplicate_keys(text: &str) -> Result<(), PayloadError> {
    let mut stack: Vec<JsonCtx> = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' => stack.push(JsonCtx::Object {
                keys: Default::default(),
                expect_key: true,
            }),
            '[' => stack.push(JsonCtx::Array),
            '}' | ']' => {
                stack.pop();
            }
            ',' => {
                if let Some(JsonCtx::Object { expect_key, .. }) = stack.last_mut() {
                    *expect_key = true;
                }
            }
            '"' => {
                let mut raw = String::new();
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            raw.push(c);
                            if let Some(next) = chars.next() {
                                raw.push(next);
                            }
                        }
                        '"' => break,
                        _ => raw.push(c),
                    }
                }

                if let Some(JsonCtx::Object { keys, expect_key }) = stack.last_mut() {
                    if *expect_key {
                        *expect_key = false;
                        // Member names are compared after escape
                        // decoding, so differently-escaped spellings of
                        // the same name collide.
                        if !keys.insert(decode_json_string(&raw)) {
                            warn!("rejecting JSON payload with duplicate object key");
                            return Err(PayloadError::Json("duplicate object key".to_string()));
                        }
                    }
                }
            }
            _ => (),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const NS: &str = "https://xaya.io/charon/";

    fn roundtrip(payload: &[u8]) -> Vec<u8> {
        let elem = encode_payload("foo", NS, payload);
        decode_payload(&elem).expect("decode should succeed")
    }

    #[test]
    fn encoded_element_name() {
        let elem = encode_payload("mytag", NS, b"foo");
        assert_eq!(elem.name(), "mytag");
    }

    #[test]
    fn payload_roundtrips() {
        let large: Vec<u8> = b"abcdef".iter().cycle().take(1 << 20).copied().collect();
        let cases: Vec<Vec<u8>> = vec![
            b"".to_vec(),
            b"foobar".to_vec(),
            b"abc\ndef<>&".to_vec(),
            vec![0x00, 0x01, 0xFF, 0x80],
            b"with \x00 NUL and \xc3\xa4 bytes".to_vec(),
            large,
        ];

        for payload in cases {
            assert_eq!(roundtrip(&payload), payload);
        }
    }

    #[test]
    fn small_printable_payload_uses_raw() {
        let elem = encode_payload("foo", NS, b"plain text");
        let children: Vec<_> = elem.children().collect();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name(), "raw");
    }

    #[test]
    fn binary_payload_uses_base64() {
        let elem = encode_payload("foo", NS, &[0x00, 0xFF]);
        let children: Vec<_> = elem.children().collect();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name(), "base64");
    }

    #[test]
    fn compressible_payload_uses_zlib() {
        let payload: Vec<u8> = std::iter::repeat(b'x').take(4096).collect();
        let elem = encode_payload("foo", NS, &payload);
        let children: Vec<_> = elem.children().collect();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name(), "zlib");
        assert_eq!(children[0].attr("size"), Some("4096"));

        assert_eq!(decode_payload(&elem).unwrap(), payload);
    }

    #[test]
    fn incompressible_payload_stays_uncompressed() {
        // Pseudo-random bytes do not reach the 70 % ratio.
        let mut payload = Vec::new();
        let mut x: u32 = 12345;
        for _ in 0..4096 {
            x = x.wrapping_mul(1103515245).wrapping_add(12345);
            payload.push((x >> 16) as u8);
        }

        let elem = encode_payload("foo", NS, &payload);
        let children: Vec<_> = elem.children().collect();
        assert_eq!(children[0].name(), "base64");
    }

    #[test]
    fn split_children_concatenate_in_order() {
        let mut elem = Element::builder("foo", NS).build();
        for piece in ["foo", " ", "bar"] {
            elem.append_child(Element::builder("raw", NS).append(piece).build());
        }

        assert_eq!(decode_payload(&elem).unwrap(), b"foo bar");
    }

    #[test]
    fn unknown_child_fails_decode() {
        let mut elem = Element::builder("foo", NS).build();
        elem.append_child(Element::builder("invalid", NS).append("data").build());

        assert_eq!(
            decode_payload(&elem),
            Err(PayloadError::UnknownChild("invalid".to_string()))
        );
    }

    #[test]
    fn base64_tolerates_embedded_whitespace() {
        let mut elem = Element::builder("foo", NS).build();
        elem.append_child(
            Element::builder("base64", NS)
                .append("Zm9v\nYmFy \t\r\n")
                .build(),
        );

        assert_eq!(decode_payload(&elem).unwrap(), b"foobar");
    }

    #[test]
    fn base64_rejects_malformed_input() {
        for bad in ["Zm9=v", "Zm9v====", "Zm!v", "AAA"] {
            let mut elem = Element::builder("foo", NS).build();
            elem.append_child(Element::builder("base64", NS).append(bad).build());
            assert!(
                matches!(decode_payload(&elem), Err(PayloadError::Base64(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn oversized_zlib_declaration_fails_decode() {
        let mut elem = Element::builder("foo", NS).build();
        elem.append_child(
            Element::builder("zlib", NS)
                .attr("size", (MAX_PAYLOAD_SIZE + 1).to_string())
                .build(),
        );

        assert_eq!(decode_payload(&elem), Err(PayloadError::TooLarge));
    }

    #[test]
    fn zlib_size_mismatch_fails_decode() {
        let payload: Vec<u8> = std::iter::repeat(b'y').take(1024).collect();
        let elem = encode_payload("foo", NS, &payload);
        let zlib = elem.children().next().unwrap();
        assert_eq!(zlib.name(), "zlib");

        let mut forged = Element::builder("zlib", NS).attr("size", "1023").build();
        for child in zlib.children() {
            forged.append_child(child.clone());
        }
        let mut wrapper = Element::builder("foo", NS).build();
        wrapper.append_child(forged);

        assert!(matches!(
            decode_payload(&wrapper),
            Err(PayloadError::Zlib(_))
        ));
    }

    #[test]
    fn json_roundtrips() {
        let cases = [
            "42",
            "false",
            "null",
            "-1.5",
            r#""this is a JSON string\nwith newlines""#,
            "[1, 2, 3]",
            r#"{"some": "field", "int": 100, "obj": {}, "arr": [1, {}, false]}"#,
        ];

        for text in cases {
            let value: Value = serde_json::from_str(text).unwrap();
            let elem = encode_json("foo", NS, &value);
            assert_eq!(decode_json(&elem).unwrap(), value);
        }
    }

    #[test]
    fn json_decode_rejects_invalid_payloads() {
        for bad in ["", "invalid JSON", "{} junk"] {
            let elem = encode_payload("foo", NS, bad.as_bytes());
            assert!(matches!(decode_json(&elem), Err(PayloadError::Json(_))));
        }
    }

    #[test]
    fn json_decode_rejects_duplicate_keys() {
        let elem = encode_payload("foo", NS, br#"{"a": 1, "a": 2}"#);
        assert!(matches!(decode_json(&elem), Err(PayloadError::Json(_))));

        // The same key in sibling objects is fine.
        let elem = encode_payload("foo", NS, br#"[{"a": 1}, {"a": 2}]"#);
        assert!(decode_json(&elem).is_ok());
    }

    #[test]
    fn duplicate_scanner_ignores_string_values() {
        assert!(parse_json_strict(r#"{"a": "a", "b": "a"}"#).is_ok());
        assert!(parse_json_strict(r#"{"a": {"a": 1}}"#).is_ok());
    }

    #[test]
    fn duplicate_scanner_decodes_escaped_keys() {
        // Differently-escaped spellings of the same member name are still
        // duplicates.
        assert!(parse_json_strict("{\"caf\\u0065\": 1, \"cafe\": 2}").is_err());
        assert!(parse_json_strict("{\"caf\\u00e9\": 1, \"caf\u{e9}\": 2}").is_err());

        // Escaped keys that decode to distinct names are fine.
        assert!(parse_json_strict("{\"a\\u0062c\": 1, \"abd\": 2}").is_ok());
    }
}

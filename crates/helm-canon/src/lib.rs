//! RFC 8785 (JSON Canonicalization Scheme) bytes and SHA-256 hashing for
//! every hashable value in the governance kernel.
//!
//! Determinism is the only contract: the same logical value always produces
//! the same canonical bytes, regardless of field insertion order, on any
//! platform. Unsupported values (non-finite numbers, anything that cannot
//! be expressed as a JSON object/array/string/number/bool/null) fail with
//! [`CanonError::Unsupported`].

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod codes {
    pub const ERR_CANON_UNSUPPORTED: &str = "ERR_CANON_UNSUPPORTED";
}

#[derive(Debug, Error)]
pub enum CanonError {
    #[error("value could not be represented as JSON: {0}")]
    NotSerializable(String),
    #[error("{code}: {detail}", code = codes::ERR_CANON_UNSUPPORTED)]
    Unsupported { detail: String },
}

/// Canonical bytes for any value serializable as a JSON object, array,
/// string, number, bool, or null, per RFC 8785.
pub fn to_jcs_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CanonError> {
    let v = serde_json::to_value(value).map_err(|e| CanonError::NotSerializable(e.to_string()))?;
    let mut out = String::new();
    write_canonical(&v, &mut out)?;
    Ok(out.into_bytes())
}

/// `sha256:`-prefixed lowercase hex digest of the JCS bytes of `value`.
pub fn canonical_hash<T: Serialize>(value: &T) -> Result<String, CanonError> {
    let bytes = to_jcs_bytes(value)?;
    Ok(sha256_hex(&bytes))
}

/// `sha256:`-prefixed lowercase hex digest of raw bytes (no canonicalization).
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

fn write_canonical(value: &Value, out: &mut String) -> Result<(), CanonError> {
    match value {
        Value::Null => {
            out.push_str("null");
            Ok(())
        }
        Value::Bool(b) => {
            out.push_str(if *b { "true" } else { "false" });
            Ok(())
        }
        Value::Number(n) => write_number(n, out),
        Value::String(s) => {
            write_json_string(s, out);
            Ok(())
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
            Ok(())
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_by(|a, b| utf16_cmp(a, b));
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json_string(key, out);
                out.push(':');
                write_canonical(&map[*key], out)?;
            }
            out.push('}');
            Ok(())
        }
    }
}

/// RFC 8785 §3.2.3: object keys are ordered by comparing their UTF-16 code
/// unit sequences, not their UTF-8 byte sequences (these differ only for
/// codepoints outside the Basic Multilingual Plane).
fn utf16_cmp(a: &str, b: &str) -> std::cmp::Ordering {
    a.encode_utf16().cmp(b.encode_utf16())
}

fn write_number(n: &serde_json::Number, out: &mut String) -> Result<(), CanonError> {
    if let Some(i) = n.as_i64() {
        out.push_str(&i.to_string());
        return Ok(());
    }
    if let Some(u) = n.as_u64() {
        out.push_str(&u.to_string());
        return Ok(());
    }
    let f = n.as_f64().ok_or_else(|| CanonError::Unsupported {
        detail: "number is neither integral nor representable as f64".into(),
    })?;
    if !f.is_finite() {
        return Err(CanonError::Unsupported {
            detail: format!("non-finite number {f}"),
        });
    }
    out.push_str(&format_jcs_float(f));
    Ok(())
}

/// Minimal ECMA-262 `Number::toString` style formatting: integral floats are
/// printed without a decimal point or exponent, matching the common case
/// produced by JSON encoders for whole-number floats; other floats fall
/// back to Rust's shortest round-trippable `Display` representation, which
/// already avoids trailing zeros.
fn format_jcs_float(f: f64) -> String {
    if f == f.trunc() && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        format!("{f}")
    }
}

fn write_json_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000C}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
}

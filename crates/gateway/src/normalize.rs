//! Base64-aware payload normalization.
//!
//! Protocol payloads carry many binary fields (media keys, hashes, nested
//! protobuf blobs) as base64 strings. Sinks get them decoded: every string
//! leaf that is valid standard base64 is replaced by the decoded JSON value
//! when the bytes parse as JSON, or by the decoded text otherwise.
//!
//! Any word that happens to be valid base64 (`"test"`, `"abcd"`) is decoded
//! too. There is no plausibility check.

use base64::Engine;
use base64::alphabet;
use base64::engine::{GeneralPurpose, GeneralPurposeConfig};
use serde_json::{Map, Value};

/// Standard alphabet with padding, tolerant of non-zero trailing bits.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

/// Returns a normalized copy of `value`. The input is never modified.
pub fn normalize(value: &Value) -> Value {
    match value {
        Value::String(s) => decode_leaf(s),
        Value::Array(items) => Value::Array(items.iter().map(normalize).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), normalize(item)))
                .collect::<Map<String, Value>>(),
        ),
        other => other.clone(),
    }
}

/// Decodes one string leaf. Decoded JSON is inserted as-is, one pass only.
///
/// Line breaks inside the encoded text are ignored.
fn decode_leaf(s: &str) -> Value {
    let compact: String = s.chars().filter(|c| !matches!(c, '\r' | '\n')).collect();
    let Ok(bytes) = LENIENT.decode(&compact) else {
        return Value::String(s.to_string());
    };
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(parsed) => parsed,
        Err(_) => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
    }
}

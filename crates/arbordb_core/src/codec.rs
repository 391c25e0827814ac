//! JSON wire helpers: pretty descriptors, flat-file records, the
//! reversible date encoding, and binary property payloads.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Serialize;
use serde_json::ser::{PrettyFormatter, Serializer};
use serde_json::{Map, Value};

use crate::error::{StoreError, StoreResult};

/// Key of the reversible date encoding.
pub(crate) const DATE_FIELD: &str = "$$date";

/// Serializes with a four-space indent, the descriptor house style.
pub(crate) fn to_pretty_json(value: &Value) -> StoreResult<String> {
    let mut out = Vec::new();
    let formatter = PrettyFormatter::with_indent(b"    ");
    let mut serializer = Serializer::with_formatter(&mut out, formatter);
    value
        .serialize(&mut serializer)
        .map_err(|err| StoreError::invalid_operation(format!("descriptor serialization: {err}")))?;
    Ok(String::from_utf8_lossy(&out).into_owned())
}

/// Compact single-line serialization used for flat-file records.
pub(crate) fn to_line_json(value: &Value) -> StoreResult<String> {
    serde_json::to_string(value)
        .map_err(|err| StoreError::invalid_operation(format!("record serialization: {err}")))
}

/// Wraps epoch milliseconds in the reversible `{"$$date": ms}` shape.
#[must_use]
pub fn encode_date(epoch_millis: i64) -> Value {
    let mut map = Map::new();
    map.insert(DATE_FIELD.to_string(), Value::from(epoch_millis));
    Value::Object(map)
}

/// Unwraps a `{"$$date": ms}` object. `None` for anything else, including
/// objects that merely contain a `$$date` field among others.
#[must_use]
pub fn decode_date(value: &Value) -> Option<i64> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    map.get(DATE_FIELD)?.as_i64()
}

/// Encodes raw bytes for holding inside a document body.
#[must_use]
pub fn encode_binary(bytes: &[u8]) -> Value {
    Value::String(BASE64.encode(bytes))
}

/// Decodes a binary property value back to raw bytes. Non-string or
/// invalid base64 input yields `None`.
#[must_use]
pub fn decode_binary(value: &Value) -> Option<Vec<u8>> {
    BASE64.decode(value.as_str()?).ok()
}

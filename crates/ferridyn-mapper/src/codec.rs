//! Conversion between native values and the store's attribute representation.
//!
//! Everything goes through [`serde_json::Value`]: a native value is serialized
//! to JSON first and then mapped onto [`AttributeValue`]s, and the reverse on
//! the way back.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Number, Value};

use crate::error::CodecError;
use crate::types::{AttributeMap, AttributeValue, KeyDescriptor};

/// Encode a serializable value as a single attribute value.
pub fn to_attribute_value<T: Serialize + ?Sized>(value: &T) -> Result<AttributeValue, CodecError> {
    let json = serde_json::to_value(value)?;
    Ok(json_to_attribute(json))
}

/// Decode a single attribute value into a native value.
pub fn from_attribute_value<T: DeserializeOwned>(attr: &AttributeValue) -> Result<T, CodecError> {
    let json = attribute_to_json(attr)?;
    Ok(serde_json::from_value(json)?)
}

/// Encode a record as an attribute map. The record must serialize to a JSON object.
pub fn to_attribute_map<T: Serialize + ?Sized>(value: &T) -> Result<AttributeMap, CodecError> {
    match serde_json::to_value(value)? {
        Value::Object(obj) => Ok(object_to_map(obj)),
        other => Err(CodecError::NotAMap(json_kind(&other))),
    }
}

/// Decode an attribute map into a record.
pub fn from_attribute_map<T: DeserializeOwned>(map: &AttributeMap) -> Result<T, CodecError> {
    let json = map_to_json(map)?;
    Ok(serde_json::from_value(json)?)
}

/// Convert an attribute map into a plain JSON object.
pub fn map_to_json(map: &AttributeMap) -> Result<Value, CodecError> {
    let mut obj = Map::with_capacity(map.len());
    for (name, attr) in map {
        obj.insert(name.clone(), attribute_to_json(attr)?);
    }
    Ok(Value::Object(obj))
}

fn object_to_map(obj: Map<String, Value>) -> AttributeMap {
    obj.into_iter()
        .map(|(k, v)| (k, json_to_attribute(v)))
        .collect()
}

fn json_to_attribute(value: Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(b),
        Value::Number(n) => AttributeValue::Number(n.to_string()),
        Value::String(s) => AttributeValue::String(s),
        Value::Array(items) => {
            AttributeValue::List(items.into_iter().map(json_to_attribute).collect())
        }
        Value::Object(obj) => AttributeValue::Map(object_to_map(obj)),
    }
}

fn attribute_to_json(attr: &AttributeValue) -> Result<Value, CodecError> {
    Ok(match attr {
        AttributeValue::String(s) => Value::String(s.clone()),
        AttributeValue::Number(n) => Value::Number(parse_number(n)?),
        AttributeValue::Binary(bytes) => bytes_to_json(bytes),
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::Null(_) => Value::Null,
        AttributeValue::Map(map) => map_to_json(map)?,
        AttributeValue::List(items) => Value::Array(
            items
                .iter()
                .map(attribute_to_json)
                .collect::<Result<_, _>>()?,
        ),
        AttributeValue::StringSet(items) => {
            Value::Array(items.iter().cloned().map(Value::String).collect())
        }
        AttributeValue::NumberSet(items) => Value::Array(
            items
                .iter()
                .map(|n| parse_number(n).map(Value::Number))
                .collect::<Result<_, _>>()?,
        ),
        AttributeValue::BinarySet(items) => {
            Value::Array(items.iter().map(|b| bytes_to_json(b)).collect())
        }
    })
}

fn bytes_to_json(bytes: &[u8]) -> Value {
    Value::Array(bytes.iter().map(|b| Value::from(*b)).collect())
}

/// Parse a decimal string as the narrowest JSON number that holds it.
fn parse_number(s: &str) -> Result<Number, CodecError> {
    if let Ok(i) = s.parse::<i64>() {
        return Ok(Number::from(i));
    }
    if let Ok(u) = s.parse::<u64>() {
        return Ok(Number::from(u));
    }
    s.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .ok_or_else(|| CodecError::InvalidNumber(s.to_string()))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Whether a value counts as "unset" for key resolution.
///
/// NULL, empty strings, zero numbers, `false` and empty binaries, lists, maps
/// and sets are all zero.
pub fn is_zero(attr: &AttributeValue) -> bool {
    match attr {
        AttributeValue::String(s) => s.is_empty(),
        AttributeValue::Number(n) => n.parse::<f64>().map(|f| f == 0.0).unwrap_or(false),
        AttributeValue::Binary(b) => b.is_empty(),
        AttributeValue::Bool(b) => !b,
        AttributeValue::Null(_) => true,
        AttributeValue::Map(m) => m.is_empty(),
        AttributeValue::List(l) => l.is_empty(),
        AttributeValue::StringSet(s) => s.is_empty(),
        AttributeValue::NumberSet(s) => s.is_empty(),
        AttributeValue::BinarySet(s) => s.is_empty(),
    }
}

/// Strip empty strings and NULLs, descending into nested maps.
///
/// The store rejects empty string attributes, so writes pass through here first.
pub fn remove_empty_attributes(map: AttributeMap) -> AttributeMap {
    map.into_iter()
        .filter_map(|(name, attr)| match attr {
            AttributeValue::Null(_) => None,
            AttributeValue::String(s) if s.is_empty() => None,
            AttributeValue::Map(inner) => {
                Some((name, AttributeValue::Map(remove_empty_attributes(inner))))
            }
            other => Some((name, other)),
        })
        .collect()
}

/// Identity of a key within one batch: MessagePack of the table name and the
/// key values in descriptor order.
pub(crate) fn encode_index_key(
    table: &str,
    key: &KeyDescriptor,
    values: &AttributeMap,
) -> Result<Vec<u8>, CodecError> {
    let ordered: Vec<Option<&AttributeValue>> = key.names().map(|n| values.get(n)).collect();
    rmp_serde::to_vec(&(table, ordered)).map_err(|e| CodecError::KeyEncoding(e.to_string()))
}

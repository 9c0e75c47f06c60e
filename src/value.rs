//! Cell values exchanged with backends and clients.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Binary or character large object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LobKind {
    Binary,
    Character,
}

/// Backend-side reference to a large object. Only meaningful on the connection family
/// that produced it; the memory backend keeps them database-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LobLocator {
    pub id: u64,
    pub kind: LobKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(#[serde(with = "b64")] Vec<u8>),
    Lob(LobLocator),
}

pub type Row = Vec<Value>;

impl Value {
    pub fn is_null(&self) -> bool { matches!(self, Value::Null) }

    /// Payload size used for the inline-transfer decision.
    pub fn byte_len(&self) -> usize {
        match self {
            Value::Text(s) => s.len(),
            Value::Bytes(b) => b.len(),
            _ => 0,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(*b as i64),
            Value::Float(f) => Some(*f as i64),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Lob(l) => match l.kind {
                LobKind::Binary => "blob",
                LobKind::Character => "clob",
            },
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => f.write_str(s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Lob(l) => write!(f, "<lob {}>", l.id),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self { Value::Int(v) }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self { Value::Text(v.to_string()) }
}
impl From<String> for Value {
    fn from(v: String) -> Self { Value::Text(v) }
}
impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self { Value::Bytes(v) }
}
impl From<bool> for Value {
    fn from(v: bool) -> Self { Value::Bool(v) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub type_name: String,
    /// Column holds values that may need the chunked stream interface (BLOB, CLOB, BYTEA, TEXT ...).
    #[serde(default)]
    pub large: bool,
}

impl Column {
    pub fn new<S: Into<String>>(name: S, type_name: S) -> Self {
        let type_name = type_name.into();
        let large = is_large_type(&type_name);
        Self { name: name.into(), type_name, large }
    }
}

pub fn is_large_type(type_name: &str) -> bool {
    matches!(
        type_name.to_ascii_uppercase().as_str(),
        "BLOB" | "CLOB" | "NCLOB" | "BYTEA" | "TEXT" | "LONGTEXT" | "MEDIUMTEXT" | "LONGBLOB" | "MEDIUMBLOB" | "VARBINARY" | "IMAGE" | "OID"
    )
}

/// Base64 encoding for binary payloads inside JSON.
pub mod b64 {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_travel_as_base64() {
        let v = Value::Bytes(vec![0, 1, 2, 255]);
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, r#"{"type":"bytes","value":"AAEC/w=="}"#);
        assert_eq!(serde_json::from_str::<Value>(&json).unwrap(), v);
    }

    #[test]
    fn large_type_detection() {
        assert!(Column::new("data", "blob").large);
        assert!(Column::new("body", "TEXT").large);
        assert!(!Column::new("id", "INT").large);
    }

    #[test]
    fn byte_len_counts_payload_only() {
        assert_eq!(Value::Text("héllo".into()).byte_len(), 6);
        assert_eq!(Value::Int(12345).byte_len(), 0);
        assert_eq!(Value::Null.byte_len(), 0);
    }
}

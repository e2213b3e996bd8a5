//! Message documents and correlation keys
//!
//! A document is a JSON object shared behind an `Arc`. Two fields are known
//! to the transport: `message.type` names the operation and
//! `correlation.key` links a response to the request that caused it.
//! Everything else is the marshalling layer's business.

use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Field naming the message kind.
pub const MESSAGE_TYPE_FIELD: &str = "message.type";

/// Field carrying the correlation key.
pub const CORRELATION_KEY_FIELD: &str = "correlation.key";

/// Message type of transport keep-alives.
pub const KEEP_ALIVE_TYPE: &str = "keep_alive";

/// Suffix marking a message type as a response.
pub const RESPONSE_SUFFIX: &str = ".response";

/// Identifier linking a request to its eventual response.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationKey(u64);

impl CorrelationKey {
    /// Wrap a raw key value.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw key value.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable, reference-counted message document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document(Arc<Value>);

impl Document {
    /// Wrap a JSON value.
    pub fn new(value: Value) -> Self {
        Self(Arc::new(value))
    }

    /// Empty object with only `message.type` set.
    pub fn with_type(message_type: &str) -> Self {
        let mut map = Map::new();
        map.insert(MESSAGE_TYPE_FIELD.to_string(), Value::from(message_type));
        Self::new(Value::Object(map))
    }

    /// Transport keep-alive document.
    pub fn keep_alive() -> Self {
        Self::with_type(KEEP_ALIVE_TYPE)
    }

    /// Borrow the underlying JSON.
    pub fn value(&self) -> &Value {
        &self.0
    }

    /// Look up a top-level field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// `message.type`, if present and a string.
    pub fn message_type(&self) -> Option<&str> {
        self.0.get(MESSAGE_TYPE_FIELD).and_then(Value::as_str)
    }

    /// `correlation.key`, if present and an unsigned integer.
    pub fn correlation_key(&self) -> Option<CorrelationKey> {
        self.0
            .get(CORRELATION_KEY_FIELD)
            .and_then(Value::as_u64)
            .map(CorrelationKey)
    }

    /// Whether the message type marks this document as a response.
    pub fn is_response(&self) -> bool {
        self.message_type()
            .is_some_and(|t| t.ends_with(RESPONSE_SUFFIX))
    }

    /// Whether this is a transport keep-alive.
    pub fn is_keep_alive(&self) -> bool {
        self.message_type() == Some(KEEP_ALIVE_TYPE)
    }

    /// Copy of this document with `correlation.key` set to `key`.
    ///
    /// Non-object documents are wrapped as `{"body": <value>}` first.
    pub fn with_correlation_key(&self, key: CorrelationKey) -> Self {
        let mut map = self.to_object();
        map.insert(CORRELATION_KEY_FIELD.to_string(), Value::from(key.0));
        Self::new(Value::Object(map))
    }

    /// Build the response to this request.
    ///
    /// `body`'s fields are kept; `message.type` becomes `<request type>.response`
    /// and the request's correlation key is copied over.
    pub fn response(&self, body: Value) -> Self {
        let mut map = match body {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("body".to_string(), other);
                map
            }
        };
        let request_type = self.message_type().unwrap_or("request");
        map.insert(
            MESSAGE_TYPE_FIELD.to_string(),
            Value::from(format!("{}{}", request_type, RESPONSE_SUFFIX)),
        );
        if let Some(key) = self.correlation_key() {
            map.insert(CORRELATION_KEY_FIELD.to_string(), Value::from(key.0));
        }
        Self::new(Value::Object(map))
    }

    /// Serialize to compact JSON bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing a Value cannot fail: all map keys are strings.
        serde_json::to_vec(&*self.0).unwrap_or_default()
    }

    /// Parse from JSON bytes.
    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes).map(Self::new)
    }

    fn to_object(&self) -> Map<String, Value> {
        match &*self.0 {
            Value::Object(map) => map.clone(),
            other => {
                let mut map = Map::new();
                map.insert("body".to_string(), other.clone());
                map
            }
        }
    }
}

impl From<Value> for Document {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

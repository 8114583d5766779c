//! Query cache key definitions.
//!
//! A [`QueryKey`] is an ordered list of parts, typically an endpoint string
//! optionally followed by parameter objects, e.g.
//! `["/api/finance/analytics", {"propertyId": 66}]`.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde_json::Value;

/// One component of a composite query key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryKeyPart {
    Text(String),
    Param(Value),
}

impl Hash for QueryKeyPart {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            QueryKeyPart::Text(text) => {
                0u8.hash(state);
                text.hash(state);
            }
            QueryKeyPart::Param(value) => {
                1u8.hash(state);
                hash_value(value, state);
            }
        }
    }
}

// Object keys are visited in sorted order so that equal maps hash equally
// regardless of insertion order.
fn hash_value<H: Hasher>(value: &Value, state: &mut H) {
    match value {
        Value::Null => 0u8.hash(state),
        Value::Bool(flag) => {
            1u8.hash(state);
            flag.hash(state);
        }
        Value::Number(number) => {
            2u8.hash(state);
            number.to_string().hash(state);
        }
        Value::String(text) => {
            3u8.hash(state);
            text.hash(state);
        }
        Value::Array(items) => {
            4u8.hash(state);
            items.len().hash(state);
            for item in items {
                hash_value(item, state);
            }
        }
        Value::Object(map) => {
            5u8.hash(state);
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            entries.len().hash(state);
            for (key, item) in entries {
                key.hash(state);
                hash_value(item, state);
            }
        }
    }
}

impl From<Value> for QueryKeyPart {
    fn from(value: Value) -> Self {
        match value {
            Value::String(text) => QueryKeyPart::Text(text),
            other => QueryKeyPart::Param(other),
        }
    }
}

/// Structured key of a query cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey(Vec<QueryKeyPart>);

impl QueryKey {
    /// Key consisting of a single endpoint string.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self(vec![QueryKeyPart::Text(endpoint.into())])
    }

    pub fn from_parts(parts: Vec<QueryKeyPart>) -> Self {
        Self(parts)
    }

    /// Append a parameter part (a JSON string becomes a text part).
    pub fn with_param(mut self, value: Value) -> Self {
        self.0.push(value.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.0.push(QueryKeyPart::Text(text.into()));
        self
    }

    pub fn parts(&self) -> &[QueryKeyPart] {
        &self.0
    }

    /// True when any text part contains any of the given substrings.
    ///
    /// Parameter parts are never inspected.
    pub fn matches_any<S: AsRef<str>>(&self, patterns: &[S]) -> bool {
        self.0.iter().any(|part| match part {
            QueryKeyPart::Text(text) => patterns
                .iter()
                .any(|pattern| text.contains(pattern.as_ref())),
            QueryKeyPart::Param(_) => false,
        })
    }
}

impl From<&str> for QueryKey {
    fn from(endpoint: &str) -> Self {
        QueryKey::new(endpoint)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (index, part) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            match part {
                QueryKeyPart::Text(text) => write!(f, "{text:?}")?,
                QueryKeyPart::Param(value) => write!(f, "{value}")?,
            }
        }
        f.write_str("]")
    }
}

//! Query key management utilities.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identity of a cached resource.
///
/// An ordered sequence of plain-data segments, e.g. `["super-hero", 1]`.
/// Two keys are equal iff their serialized forms match exactly, so equality
/// is structural and order-sensitive.
///
/// # Example
///
/// ```
/// use query_kit::{query_key, QueryKey};
///
/// let a = query_key!["super-hero", 1];
/// let b = QueryKey::new().segment("super-hero").segment(1);
/// assert_eq!(a, b);
/// assert_ne!(a, query_key![1, "super-hero"]);
/// assert_eq!(QueryKey::from("friends"), query_key!["friends"]);
/// ```
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "Vec<Value>", into = "Vec<Value>")]
pub struct QueryKey {
    segments: Vec<Value>,
    serialized: String,
}

impl QueryKey {
    /// Create an empty key. Append segments with [`segment`](Self::segment).
    pub fn new() -> Self {
        Self::from_segments(Vec::new())
    }

    /// Build a key from already converted segments.
    pub fn from_segments(segments: Vec<Value>) -> Self {
        let serialized = Value::Array(segments.clone()).to_string();
        QueryKey {
            segments,
            serialized,
        }
    }

    /// Append a plain segment (string, number, bool, JSON value).
    pub fn segment(self, segment: impl Into<Value>) -> Self {
        let mut segments = self.segments;
        segments.push(segment.into());
        Self::from_segments(segments)
    }

    /// Append any serializable value as a segment.
    ///
    /// # Errors
    /// Returns `Err` if the value cannot be represented as JSON
    /// (e.g. a map with non-string keys).
    pub fn try_segment<S: Serialize + ?Sized>(self, segment: &S) -> Result<Self> {
        let value = serde_json::to_value(segment)?;
        Ok(self.segment(value))
    }

    /// Segments in order.
    pub fn segments(&self) -> &[Value] {
        &self.segments
    }

    /// Canonical serialized form used for equality and hashing.
    pub fn as_str(&self) -> &str {
        &self.serialized
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// True if `prefix` matches the leading segments of this key.
    ///
    /// An empty prefix matches every key.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        prefix.len() <= self.len()
            && self
                .segments
                .iter()
                .zip(prefix.segments.iter())
                .all(|(a, b)| a == b)
    }
}

impl Default for QueryKey {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.serialized == other.serialized
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.serialized.hash(state);
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialized)
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryKey({})", self.serialized)
    }
}

impl From<&str> for QueryKey {
    fn from(s: &str) -> Self {
        QueryKey::new().segment(s)
    }
}

impl From<String> for QueryKey {
    fn from(s: String) -> Self {
        QueryKey::new().segment(s)
    }
}

impl From<Vec<Value>> for QueryKey {
    fn from(segments: Vec<Value>) -> Self {
        QueryKey::from_segments(segments)
    }
}

impl From<QueryKey> for Vec<Value> {
    fn from(key: QueryKey) -> Self {
        key.segments
    }
}

impl From<&QueryKey> for QueryKey {
    fn from(key: &QueryKey) -> Self {
        key.clone()
    }
}

/// Build a [`QueryKey`] from a list of plain segments.
///
/// ```
/// use query_kit::query_key;
///
/// let id = 7;
/// let key = query_key!["super-hero", id];
/// assert_eq!(key.to_string(), r#"["super-hero",7]"#);
/// ```
#[macro_export]
macro_rules! query_key {
    ($($segment:expr),* $(,)?) => {
        $crate::QueryKey::new()$(.segment($segment))*
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_query_key_builder() {
        let key = QueryKey::new().segment("super-hero").segment(1);
        assert_eq!(key.as_str(), r#"["super-hero",1]"#);
        assert_eq!(key.len(), 2);
    }

    #[test]
    fn test_single_string_key() {
        let key = QueryKey::from("super-heroes");
        assert_eq!(key, crate::query_key!["super-heroes"]);
        assert_eq!(key.to_string(), r#"["super-heroes"]"#);
    }

    #[test]
    fn test_order_sensitive() {
        assert_ne!(
            crate::query_key!["hero", 1],
            crate::query_key![1, "hero"]
        );
    }

    #[test]
    fn test_type_sensitive() {
        assert_ne!(crate::query_key!["hero", 1], crate::query_key!["hero", "1"]);
    }

    #[test]
    fn test_structural_segments() {
        #[derive(Serialize)]
        struct Filter {
            page: u32,
            tag: &'static str,
        }

        let a = QueryKey::from("heroes")
            .try_segment(&Filter { page: 2, tag: "marvel" })
            .unwrap();
        let b = QueryKey::from("heroes")
            .segment(serde_json::json!({"tag": "marvel", "page": 2}));
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_matches_equality() {
        let mut set = HashSet::new();
        set.insert(crate::query_key!["hero", 1]);
        set.insert(QueryKey::new().segment("hero").segment(1));
        set.insert(crate::query_key!["hero", 2]);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_starts_with() {
        let key = crate::query_key!["hero", 1, "friends"];
        assert!(key.starts_with(&QueryKey::from("hero")));
        assert!(key.starts_with(&crate::query_key!["hero", 1]));
        assert!(key.starts_with(&QueryKey::new()));
        assert!(!key.starts_with(&crate::query_key!["hero", 2]));
        assert!(!QueryKey::from("hero").starts_with(&key));
    }

    #[test]
    fn test_serde_roundtrip_shape() {
        let key = crate::query_key!["hero", 1];
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, r#"["hero",1]"#);
        let back: QueryKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}

//! [`QueryKey`] – ordered list of JSON tokens identifying a cached query.
//!
//! Part-scoped keys start with `["partsync", "partID", <part>]`, so every
//! query of a part can be found (and cancelled) by prefix.

use std::fmt;
use std::hash::{Hash, Hasher};

use partsync_types::PartId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const NAMESPACE: &str = "partsync";
const PART_SEGMENT: &str = "partID";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueryKey(Vec<Value>);

impl QueryKey {
    pub fn new(tokens: Vec<Value>) -> Self {
        Self(tokens)
    }

    /// `["partsync", "partID", <part>]`.
    pub fn part(part_id: &PartId) -> Self {
        Self(vec![
            Value::from(NAMESPACE),
            Value::from(PART_SEGMENT),
            Value::from(part_id.as_str()),
        ])
    }

    /// Append a token.
    pub fn push(mut self, token: impl Into<Value>) -> Self {
        self.0.push(token.into());
        self
    }

    pub fn tokens(&self) -> &[Value] {
        &self.0
    }

    /// `true` when `prefix` matches the leading tokens of this key (a key is
    /// a prefix of itself).
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.len() >= prefix.0.len() && self.0.iter().zip(&prefix.0).all(|(a, b)| a == b)
    }

    /// The part this key is scoped to, if any.
    pub fn part_id(&self) -> Option<PartId> {
        match self.0.as_slice() {
            [Value::String(ns), Value::String(seg), Value::String(part), ..]
                if ns == NAMESPACE && seg == PART_SEGMENT =>
            {
                Some(PartId::from(part.as_str()))
            }
            _ => None,
        }
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, token) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{token}")?;
        }
        f.write_str("]")
    }
}

// `Value` has no `Hash`; its compact JSON rendering is canonical because
// object keys are kept sorted.
impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.to_string().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn part_prefix_layout() {
        let key = QueryKey::part(&PartId::from("p1")).push("resource").push("arm");
        assert_eq!(key.to_string(), r#"["partsync","partID","p1","resource","arm"]"#);
        assert_eq!(key.part_id(), Some(PartId::from("p1")));
    }

    #[test]
    fn prefix_matching() {
        let prefix = QueryKey::part(&PartId::from("p1"));
        let key = prefix.clone().push("robotClient").push("getMachineStatus");
        assert!(key.starts_with(&prefix));
        assert!(key.starts_with(&key));
        assert!(!prefix.starts_with(&key));
        assert!(!key.starts_with(&QueryKey::part(&PartId::from("p2"))));
    }

    #[test]
    fn keys_with_equal_args_hash_alike() {
        let a = QueryKey::new(vec![json!("x"), json!({ "b": 1, "a": 2 })]);
        let b = QueryKey::new(vec![json!("x"), json!({ "a": 2, "b": 1 })]);
        let mut map = HashMap::new();
        map.insert(a, 1);
        assert_eq!(map.get(&b), Some(&1));
    }

    #[test]
    fn unscoped_key_has_no_part() {
        assert_eq!(QueryKey::new(vec![json!("app")]).part_id(), None);
    }
}

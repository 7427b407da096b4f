//! Dotted paths into JSON documents
//!
//! Used by the path wrapper to address one nested field of a loaded
//! document, e.g. `inventory.items[2].count`.
//!
//! | Syntax | Meaning |
//! |--------|---------|
//! | `key` / `.key` | object property |
//! | `[n]` | array index |
//! | (empty) | the whole document |

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Path parse or traversal failure
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("empty key in path at position {0}")]
    EmptyKey(usize),
    #[error("unclosed bracket starting at position {0}")]
    UnclosedBracket(usize),
    #[error("invalid array index at position {0}: {1}")]
    InvalidIndex(usize, String),
    #[error("missing '.' before key at position {0}")]
    MissingSeparator(usize),
    #[error("type mismatch at '{path}': expected {expected}")]
    TypeMismatch { path: String, expected: &'static str },
    #[error("index {index} out of bounds at '{path}' (len {len})")]
    IndexOutOfBounds { path: String, index: usize, len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// A parsed location inside a document
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocPath {
    segments: Vec<PathSegment>,
}

impl DocPath {
    pub fn root() -> Self {
        DocPath::default()
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.segments.push(PathSegment::Key(key.into()));
        self
    }

    pub fn index(mut self, idx: usize) -> Self {
        self.segments.push(PathSegment::Index(idx));
        self
    }

    /// True if `self` equals `other` or lies above it in the tree.
    pub fn is_ancestor_of(&self, other: &DocPath) -> bool {
        other.segments.starts_with(&self.segments)
    }

    /// True if a write at `written` can change the value at `self`.
    pub fn is_affected_by(&self, written: &DocPath) -> bool {
        self.is_ancestor_of(written) || written.is_ancestor_of(self)
    }

    /// Borrow the value at this path.
    pub fn get<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut current = root;
        for segment in &self.segments {
            current = match (segment, current) {
                (PathSegment::Key(k), Value::Object(obj)) => obj.get(k)?,
                (PathSegment::Index(i), Value::Array(arr)) => arr.get(*i)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Write `value` at this path, creating missing intermediate objects.
    ///
    /// Array indices must already exist; the helper never grows arrays.
    pub fn set(&self, root: &mut Value, value: Value) -> Result<(), PathError> {
        let mut current = root;
        for (depth, segment) in self.segments.iter().enumerate() {
            let here = || DocPath::from_segments(self.segments[..depth].to_vec()).to_string();
            current = match segment {
                PathSegment::Key(k) => {
                    if current.is_null() {
                        *current = Value::Object(serde_json::Map::new());
                    }
                    match current {
                        Value::Object(obj) => obj.entry(k.clone()).or_insert(Value::Null),
                        _ => {
                            return Err(PathError::TypeMismatch {
                                path: here(),
                                expected: "object",
                            })
                        }
                    }
                }
                PathSegment::Index(i) => match current {
                    Value::Array(arr) => {
                        let len = arr.len();
                        arr.get_mut(*i).ok_or_else(|| PathError::IndexOutOfBounds {
                            path: here(),
                            index: *i,
                            len,
                        })?
                    }
                    _ => {
                        return Err(PathError::TypeMismatch {
                            path: here(),
                            expected: "array",
                        })
                    }
                },
            };
        }
        *current = value;
        Ok(())
    }

    fn from_segments(segments: Vec<PathSegment>) -> Self {
        DocPath { segments }
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.segments.iter().enumerate() {
            match seg {
                PathSegment::Key(k) if i == 0 => write!(f, "{}", k)?,
                PathSegment::Key(k) => write!(f, ".{}", k)?,
                PathSegment::Index(idx) => write!(f, "[{}]", idx)?,
            }
        }
        Ok(())
    }
}

impl FromStr for DocPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut segments = Vec::new();
        let bytes = s.as_bytes();
        let mut i = 0;
        if bytes.first() == Some(&b'.') {
            i = 1;
        }
        while i < bytes.len() {
            match bytes[i] {
                b'[' => {
                    let start = i;
                    let close = s[i..]
                        .find(']')
                        .map(|off| i + off)
                        .ok_or(PathError::UnclosedBracket(start))?;
                    let raw = &s[i + 1..close];
                    let idx = raw
                        .parse::<usize>()
                        .map_err(|_| PathError::InvalidIndex(start, raw.to_string()))?;
                    segments.push(PathSegment::Index(idx));
                    i = close + 1;
                }
                b'.' => {
                    i += 1;
                    if i >= bytes.len() || bytes[i] == b'.' || bytes[i] == b'[' {
                        return Err(PathError::EmptyKey(i));
                    }
                }
                _ => {
                    if i > 0 && bytes[i - 1] == b']' {
                        return Err(PathError::MissingSeparator(i));
                    }
                    let end = s[i..]
                        .find(|c| c == '.' || c == '[')
                        .map(|off| i + off)
                        .unwrap_or(s.len());
                    segments.push(PathSegment::Key(s[i..end].to_string()));
                    i = end;
                }
            }
        }
        Ok(DocPath { segments })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_mixed_path() {
        let path: DocPath = "inventory.items[2].count".parse().unwrap();
        assert_eq!(
            path,
            DocPath::root().key("inventory").key("items").index(2).key("count")
        );
        assert_eq!(path.to_string(), "inventory.items[2].count");
    }

    #[test]
    fn test_parse_root_and_leading_dot() {
        assert!("".parse::<DocPath>().unwrap().is_root());
        assert_eq!(".coins".parse::<DocPath>().unwrap(), DocPath::root().key("coins"));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!("a..b".parse::<DocPath>(), Err(PathError::EmptyKey(_))));
        assert!(matches!("a[1".parse::<DocPath>(), Err(PathError::UnclosedBracket(1))));
        assert!(matches!("a[x]".parse::<DocPath>(), Err(PathError::InvalidIndex(..))));
        assert!(matches!("a[0]b".parse::<DocPath>(), Err(PathError::MissingSeparator(4))));
        assert!(matches!("[1]x.y".parse::<DocPath>(), Err(PathError::MissingSeparator(3))));
        assert!("a[0].b".parse::<DocPath>().is_ok());
        assert!("a[0][1]".parse::<DocPath>().is_ok());
    }

    #[test]
    fn test_get_and_set() {
        let mut doc = json!({"stats": {"level": 1}, "items": [10, 20]});
        let level: DocPath = "stats.level".parse().unwrap();
        assert_eq!(level.get(&doc), Some(&json!(1)));

        level.set(&mut doc, json!(2)).unwrap();
        "items[1]".parse::<DocPath>().unwrap().set(&mut doc, json!(25)).unwrap();
        "stats.xp".parse::<DocPath>().unwrap().set(&mut doc, json!(0)).unwrap();
        assert_eq!(doc, json!({"stats": {"level": 2, "xp": 0}, "items": [10, 25]}));
    }

    #[test]
    fn test_set_creates_missing_objects() {
        let mut doc = json!({});
        "a.b.c".parse::<DocPath>().unwrap().set(&mut doc, json!(true)).unwrap();
        assert_eq!(doc, json!({"a": {"b": {"c": true}}}));
    }

    #[test]
    fn test_set_errors() {
        let mut doc = json!({"items": [1], "name": "x"});
        let err = "items[3]".parse::<DocPath>().unwrap().set(&mut doc, json!(0));
        assert!(matches!(err, Err(PathError::IndexOutOfBounds { index: 3, len: 1, .. })));
        let err = "name.first".parse::<DocPath>().unwrap().set(&mut doc, json!(0));
        assert!(matches!(err, Err(PathError::TypeMismatch { expected: "object", .. })));
    }

    #[test]
    fn test_affected_by() {
        let stats: DocPath = "stats".parse().unwrap();
        let level: DocPath = "stats.level".parse().unwrap();
        let coins: DocPath = "coins".parse().unwrap();
        assert!(level.is_affected_by(&stats));
        assert!(stats.is_affected_by(&level));
        assert!(!coins.is_affected_by(&level));
        assert!(coins.is_affected_by(&DocPath::root()));
    }
}

//! Locations inside a document ([`AttributeReference`]) and the document parts
//! (tables) they map to ([`TableRef`]).

use serde::{Deserialize, Serialize};

// maps keyed by table references use a fast hasher
use core::hash::BuildHasherDefault;
use seahash::SeaHasher;

use std::cmp::Ordering;
use std::fmt;

use crate::error::{DocShredError, Result};

pub type RefHasher = BuildHasherDefault<SeaHasher>;

// ------------- Keys -------------
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    Object(String),
    Array(usize),
}

impl Key {
    pub fn object(name: impl Into<String>) -> Self {
        Key::Object(name.into())
    }
    pub fn is_array(&self) -> bool {
        matches!(self, Key::Array(_))
    }
}
impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Key::Object(name) => write!(f, "{}", name),
            Key::Array(index) => write!(f, "[{}]", index),
        }
    }
}

// ------------- AttributeReference -------------
/// Where in a document a value lives, as the keys walked from the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributeReference {
    keys: Vec<Key>,
}

impl AttributeReference {
    pub fn root() -> Self {
        Self { keys: Vec::new() }
    }
    pub fn from_keys(keys: Vec<Key>) -> Self {
        Self { keys }
    }
    pub fn keys(&self) -> &[Key] {
        &self.keys
    }
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
    pub fn len(&self) -> usize {
        self.keys.len()
    }
    pub fn last_key(&self) -> Option<&Key> {
        self.keys.last()
    }
    pub fn append(&self, key: Key) -> Self {
        let mut keys = Vec::with_capacity(self.keys.len() + 1);
        keys.extend_from_slice(&self.keys);
        keys.push(key);
        Self { keys }
    }
}
impl fmt::Display for AttributeReference {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut first = true;
        for key in &self.keys {
            match key {
                Key::Object(name) if !first => write!(f, ".{}", name)?,
                _ => write!(f, "{}", key)?,
            }
            first = false;
        }
        Ok(())
    }
}

// ------------- TableRef -------------
/// One step of a [`TableRef`]. Serialized as a JSON string for named segments
/// and a JSON number for array dimensions, so `["a", 2]` is the path `a.$2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Segment {
    Named(String),
    ArrayDimension(usize),
}

/// Identifies one document part. The root has no segments; every other table
/// reference has exactly one parent, its path minus the last segment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TableRef {
    segments: Vec<Segment>,
}

impl TableRef {
    pub fn root() -> Self {
        Self { segments: Vec::new() }
    }
    pub fn from_segments(segments: Vec<Segment>) -> Result<Self> {
        for (position, segment) in segments.iter().enumerate() {
            if let Segment::ArrayDimension(dimension) = segment {
                let expected = match position.checked_sub(1).map(|p| &segments[p]) {
                    Some(Segment::Named(_)) => 2,
                    Some(Segment::ArrayDimension(previous)) => previous + 1,
                    None => 0,
                };
                if *dimension != expected {
                    return Err(DocShredError::Invariant(format!(
                        "array dimension ${} cannot follow {:?}",
                        dimension,
                        &segments[..position]
                    )));
                }
            }
        }
        Ok(Self { segments })
    }
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }
    pub fn depth(&self) -> usize {
        self.segments.len()
    }
    pub fn parent(&self) -> Option<TableRef> {
        if self.is_root() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }
    pub fn child(&self, name: impl Into<String>) -> TableRef {
        self.with_segment(Segment::Named(name.into()))
    }
    /// The document part holding the elements of arrays nested directly in
    /// arrays stored at this document part.
    pub fn array_child(&self) -> TableRef {
        let dimension = match self.segments.last() {
            Some(Segment::ArrayDimension(d)) => d + 1,
            _ => 2,
        };
        self.with_segment(Segment::ArrayDimension(dimension))
    }
    pub fn last_segment(&self) -> Option<&Segment> {
        self.segments.last()
    }
    /// The name of the closest named segment, which is the key owning the document part.
    pub fn name(&self) -> Option<&str> {
        self.segments.iter().rev().find_map(|segment| match segment {
            Segment::Named(name) => Some(name.as_str()),
            Segment::ArrayDimension(_) => None,
        })
    }
    pub fn array_dimension(&self) -> Option<usize> {
        match self.segments.last() {
            Some(Segment::ArrayDimension(d)) => Some(*d),
            _ => None,
        }
    }
    pub fn is_ancestor_of(&self, other: &TableRef) -> bool {
        other.segments.len() > self.segments.len() && other.segments.starts_with(&self.segments)
    }
    pub fn to_json(&self) -> String {
        // a list of strings and numbers always serializes
        serde_json::to_string(&self.segments).unwrap_or_else(|_| String::from("[]"))
    }
    pub fn from_json(text: &str) -> Result<Self> {
        let segments: Vec<Segment> = serde_json::from_str(text)
            .map_err(|e| DocShredError::Invariant(format!("stored table reference {} is unreadable: {}", text, e)))?;
        Self::from_segments(segments)
    }
    fn with_segment(&self, segment: Segment) -> TableRef {
        let mut segments = Vec::with_capacity(self.segments.len() + 1);
        segments.extend_from_slice(&self.segments);
        segments.push(segment);
        Self { segments }
    }
}
// parents sort before their children
impl Ord for TableRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.depth()
            .cmp(&other.depth())
            .then_with(|| self.segments.cmp(&other.segments))
    }
}
impl PartialOrd for TableRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let rendered: Vec<String> = self
            .segments
            .iter()
            .map(|segment| match segment {
                Segment::Named(name) => name.clone(),
                Segment::ArrayDimension(d) => format!("${}", d),
            })
            .collect();
        write!(f, "{}", rendered.join("."))
    }
}

//! Deterministic mapping from attribute references to document parts, table
//! names and column names.
//!
//! Consecutive array levels under one object key fold into a single
//! dimension marker: the elements of `a` live in the document part `a`, the
//! elements of arrays nested in `a` live in `a.$2`, one level deeper in
//! `a.$2.$3`, and so on. Names are built from sanitized keys joined with the
//! separator of the [`IdentifierConstraints`], with the field type code
//! appended to column names so that each type seen under a key gets its own column.

// used to sanitize keys before they become part of identifiers
use lazy_static::lazy_static;
use regex::Regex;

use crate::datatype::FieldType;
use crate::identifier::IdentifierConstraints;
use crate::reference::{AttributeReference, Key, Segment, TableRef};

lazy_static! {
    static ref UNSAFE_CHARACTERS: Regex = Regex::new(r"[^a-z0-9$]").unwrap();
}

/// Lowercases a key and replaces anything outside `[a-z0-9$]` with `_`.
pub fn sanitize(name: &str) -> String {
    UNSAFE_CHARACTERS
        .replace_all(&name.to_lowercase(), "_")
        .into_owned()
}

/// The document part a value at `reference` is stored in.
pub fn to_table_ref(reference: &AttributeReference) -> TableRef {
    let mut segments = Vec::new();
    let mut depth = 0;
    for key in reference.keys() {
        match key {
            Key::Object(name) => {
                segments.push(Segment::Named(name.clone()));
                depth = 0;
            }
            Key::Array(_) => {
                depth += 1;
                if depth >= 2 {
                    segments.push(Segment::ArrayDimension(depth));
                }
            }
        }
    }
    TableRef::from_segments(segments).unwrap_or_default()
}

/// The keys from the last object key onwards.
pub fn from_last_object_key(reference: &AttributeReference) -> &[Key] {
    let keys = reference.keys();
    match keys.iter().rposition(|key| !key.is_array()) {
        Some(position) => &keys[position..],
        None => keys,
    }
}

pub fn last_object_key(reference: &AttributeReference) -> Option<&str> {
    reference.keys().iter().rev().find_map(|key| match key {
        Key::Object(name) => Some(name.as_str()),
        Key::Array(_) => None,
    })
}

#[derive(Debug, Clone, Copy)]
pub struct AttributeReferenceTranslator<'c> {
    constraints: &'c dyn IdentifierConstraints,
}

impl<'c> AttributeReferenceTranslator<'c> {
    pub fn new(constraints: &'c dyn IdentifierConstraints) -> Self {
        Self { constraints }
    }
    pub fn to_table_name(&self, reference: &AttributeReference, collection_name: &str) -> String {
        let separator = self.constraints.separator();
        let mut name = sanitize(collection_name);
        name.push(separator);
        let mut owner_end = name.len();
        let mut depth = 0;
        for key in reference.keys() {
            match key {
                Key::Object(key) => {
                    name.push_str(&sanitize(key));
                    owner_end = name.len();
                    name.push(separator);
                    depth = 0;
                }
                Key::Array(_) => {
                    depth += 1;
                    if depth >= 2 {
                        name.truncate(owner_end);
                        name.push(self.constraints.array_dimension_separator());
                        name.push_str(&depth.to_string());
                        name.push(separator);
                    }
                }
            }
        }
        self.tidy(&name)
    }
    /// The table name of a document part, rebuilt from its table reference.
    pub fn table_ref_to_table_name(&self, table_ref: &TableRef, collection_name: &str) -> String {
        let mut keys: Vec<Key> = table_ref
            .segments()
            .iter()
            .flat_map(|segment| match segment {
                Segment::Named(name) => vec![Key::Object(name.clone()), Key::Array(0)],
                Segment::ArrayDimension(_) => vec![Key::Array(0)],
            })
            .collect();
        // the trailing array key only opens the part, it does not name it
        if matches!(table_ref.last_segment(), Some(Segment::Named(_))) {
            keys.pop();
        }
        self.to_table_name(&AttributeReference::from_keys(keys), collection_name)
    }
    pub fn to_column_name(&self, reference: &AttributeReference, field_type: FieldType) -> String {
        let key = last_object_key(reference).map(sanitize).unwrap_or_default();
        self.field_column_name(&key, field_type)
    }
    /// The column name of a field named `key` holding values of `field_type`.
    pub fn field_column_name(&self, key: &str, field_type: FieldType) -> String {
        let mut name = sanitize(key);
        name.push(self.constraints.separator());
        name.push(self.constraints.field_type_code(field_type));
        name
    }
    pub fn scalar_column_name(&self, field_type: FieldType) -> String {
        self.constraints.scalar_identifier(field_type).to_string()
    }
    // collapses repeated separators and drops trailing ones
    fn tidy(&self, name: &str) -> String {
        let separator = self.constraints.separator();
        let mut tidy = String::with_capacity(name.len());
        for c in name.chars() {
            if c == separator && tidy.ends_with(separator) {
                continue;
            }
            tidy.push(c);
        }
        tidy.trim_end_matches(separator).to_string()
    }
}

//! Identifier rules per backend and generation of identifiers that satisfy them.
//!
//! Every field type has a single character code used to suffix column names so
//! that a key seen with several types yields one column per type. The table is
//! validated when constraints are built: all types mapped, codes distinct and
//! drawn from `[a-z0-9]`.

// used to look up field types by code and codes by field type
use bimap::BiMap;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::datatype::FieldType;
use crate::error::{DocShredError, Result};

/// Name of the schema holding the metadata tables.
pub const META_SCHEMA: &str = "docshred";

/// Internal columns of document part tables.
pub const DID: &str = "did";
pub const RID: &str = "rid";
pub const PID: &str = "pid";
pub const SEQ: &str = "seq";

/// Suffixes of the indexes every non-root document part table gets on its
/// internal columns, appended to the table identifier.
pub const INTERNAL_INDEX_SUFFIXES: [&str; 2] = ["_did_idx", "_pid_idx"];

/// The synthetic key that scalar columns are named after.
pub const SCALAR_KEY: &str = "v";

pub const DEFAULT_FIELD_TYPE_CODES: [(FieldType, char); 13] = [
    (FieldType::Binary, 'r'),
    (FieldType::Boolean, 'b'),
    (FieldType::Date, 'c'),
    (FieldType::Double, 'd'),
    (FieldType::Instant, 'g'),
    (FieldType::Integer, 'i'),
    (FieldType::Long, 'l'),
    (FieldType::MongoObjectId, 'x'),
    (FieldType::MongoTimeStamp, 'y'),
    (FieldType::Null, 'n'),
    (FieldType::String, 's'),
    (FieldType::Time, 't'),
    (FieldType::Child, 'e'),
];

// ------------- Field Type Codes -------------
#[derive(Debug, Clone)]
pub struct FieldTypeCodes {
    codes: BiMap<FieldType, char>,
    scalar_identifiers: HashMap<FieldType, String>,
}

impl FieldTypeCodes {
    pub fn new(table: &[(FieldType, char)], separator: char) -> Result<Self> {
        let mut codes = BiMap::new();
        for (field_type, code) in table {
            if !(code.is_ascii_lowercase() || code.is_ascii_digit()) {
                return Err(DocShredError::Invariant(format!(
                    "the code '{}' of {} is not in [a-z0-9]",
                    code, field_type
                )));
            }
            if codes.insert_no_overwrite(*field_type, *code).is_err() {
                return Err(DocShredError::Invariant(format!(
                    "{} or its code '{}' is mapped twice",
                    field_type, code
                )));
            }
        }
        if let Some(missing) = FieldType::ALL.iter().find(|t| !codes.contains_left(t)) {
            return Err(DocShredError::Invariant(format!("{} has no code", missing)));
        }
        let scalar_identifiers = FieldType::ALL
            .iter()
            .filter_map(|t| codes.get_by_left(t).map(|c| (*t, format!("{}{}{}", SCALAR_KEY, separator, c))))
            .collect();
        Ok(Self { codes, scalar_identifiers })
    }
    pub fn code(&self, field_type: FieldType) -> char {
        // every type is mapped once construction succeeded
        self.codes.get_by_left(&field_type).copied().unwrap_or('?')
    }
    pub fn field_type(&self, code: char) -> Option<FieldType> {
        self.codes.get_by_right(&code).copied()
    }
    pub fn scalar_identifier(&self, field_type: FieldType) -> &str {
        self.scalar_identifiers
            .get(&field_type)
            .map(String::as_str)
            .unwrap_or_default()
    }
    pub fn scalar_identifiers(&self) -> impl Iterator<Item = &str> {
        self.scalar_identifiers.values().map(String::as_str)
    }
}

// ------------- Identifier Constraints -------------
/// The identifier rules of one backend, queried by everything that generates names.
pub trait IdentifierConstraints: Send + Sync + fmt::Debug {
    fn identifier_max_size(&self) -> usize;
    fn separator(&self) -> char {
        '_'
    }
    fn array_dimension_separator(&self) -> char {
        '$'
    }
    fn field_type_codes(&self) -> &FieldTypeCodes;
    fn field_type_code(&self, field_type: FieldType) -> char {
        self.field_type_codes().code(field_type)
    }
    fn scalar_identifier(&self, field_type: FieldType) -> &str {
        self.field_type_codes().scalar_identifier(field_type)
    }
    fn is_allowed_schema_identifier(&self, identifier: &str) -> bool;
    fn is_allowed_table_identifier(&self, identifier: &str) -> bool;
    fn is_allowed_column_identifier(&self, identifier: &str) -> bool;
    fn is_allowed_index_identifier(&self, identifier: &str) -> bool {
        self.is_allowed_table_identifier(identifier)
    }
    fn is_same_identifier(&self, left: &str, right: &str) -> bool {
        left == right
    }
}

/// Constraints shared by the dialects; each dialect adds its own reserved names.
#[derive(Debug, Clone)]
pub struct BaseIdentifierConstraints {
    max_size: usize,
    codes: FieldTypeCodes,
    restricted_schemas: HashSet<String>,
    restricted_tables: HashSet<String>,
    restricted_columns: HashSet<String>,
}

impl BaseIdentifierConstraints {
    pub fn new(
        max_size: usize,
        restricted_schemas: &[&str],
        restricted_tables: &[&str],
        restricted_columns: &[&str],
    ) -> Result<Self> {
        let codes = FieldTypeCodes::new(&DEFAULT_FIELD_TYPE_CODES, '_')?;
        let mut columns: HashSet<String> = [DID, RID, PID, SEQ].iter().map(|c| c.to_string()).collect();
        columns.extend(codes.scalar_identifiers().map(String::from));
        columns.extend(restricted_columns.iter().map(|c| c.to_string()));
        let mut schemas: HashSet<String> = restricted_schemas.iter().map(|s| s.to_string()).collect();
        schemas.insert(META_SCHEMA.to_string());
        Ok(Self {
            max_size,
            codes,
            restricted_schemas: schemas,
            restricted_tables: restricted_tables.iter().map(|t| t.to_string()).collect(),
            restricted_columns: columns,
        })
    }
    fn is_well_formed(&self, identifier: &str) -> bool {
        !identifier.is_empty()
            && identifier.len() <= self.max_size
            && identifier
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '$')
    }
}

impl IdentifierConstraints for BaseIdentifierConstraints {
    fn identifier_max_size(&self) -> usize {
        self.max_size
    }
    fn field_type_codes(&self) -> &FieldTypeCodes {
        &self.codes
    }
    fn is_allowed_schema_identifier(&self, identifier: &str) -> bool {
        self.is_well_formed(identifier) && !self.restricted_schemas.contains(identifier)
    }
    fn is_allowed_table_identifier(&self, identifier: &str) -> bool {
        self.is_well_formed(identifier) && !self.restricted_tables.contains(identifier)
    }
    fn is_allowed_column_identifier(&self, identifier: &str) -> bool {
        self.is_well_formed(identifier) && !self.restricted_columns.contains(identifier)
    }
}

// ------------- Identifier Factory -------------
/// The namespaces identifiers are generated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    Schema,
    Collection,
    Table,
    Column,
    Index,
}

const MAX_COUNTER: usize = 1000;

/// Turns the names derived from documents into identifiers the backend accepts.
///
/// A candidate that is not allowed is escaped with one leading separator; one
/// that is too long is shortened and tagged with a hash of the full name; one
/// that is taken gets a numeric suffix. Generation is deterministic for a
/// given `taken` predicate.
#[derive(Debug, Clone)]
pub struct IdentifierFactory {
    constraints: Arc<dyn IdentifierConstraints>,
}

impl IdentifierFactory {
    pub fn new(constraints: Arc<dyn IdentifierConstraints>) -> Self {
        Self { constraints }
    }
    pub fn constraints(&self) -> &dyn IdentifierConstraints {
        self.constraints.as_ref()
    }
    pub fn generate(&self, kind: IdentifierKind, base: &str, taken: impl Fn(&str) -> bool) -> Result<String> {
        let separator = self.constraints.separator();
        let max_size = self.constraints.identifier_max_size();
        let mut base = base.to_string();
        if !self.is_allowed(kind, &self.shorten(&base)) {
            base.insert(0, separator);
        }
        let candidate = self.shorten(&base);
        if self.is_allowed(kind, &candidate) && !taken(&candidate) {
            return Ok(candidate);
        }
        for counter in 1..=MAX_COUNTER {
            let suffix = format!("{}{}", separator, counter);
            let head = self.shorten_to(&base, max_size.saturating_sub(suffix.len()));
            let candidate = format!("{}{}", head, suffix);
            if self.is_allowed(kind, &candidate) && !taken(&candidate) {
                return Ok(candidate);
            }
        }
        Err(DocShredError::Identifier(format!(
            "no {:?} identifier could be derived from '{}'",
            kind, base
        )))
    }
    /// Fails when an identifier handed to the metadata model breaks the rules.
    pub fn ensure_allowed(&self, kind: IdentifierKind, identifier: &str) -> Result<()> {
        if self.is_allowed(kind, identifier) {
            Ok(())
        } else {
            Err(DocShredError::Invariant(format!(
                "'{}' is not an allowed {:?} identifier",
                identifier, kind
            )))
        }
    }
    fn is_allowed(&self, kind: IdentifierKind, identifier: &str) -> bool {
        match kind {
            IdentifierKind::Schema => self.constraints.is_allowed_schema_identifier(identifier),
            IdentifierKind::Collection | IdentifierKind::Table => {
                self.constraints.is_allowed_table_identifier(identifier)
            }
            IdentifierKind::Column => self.constraints.is_allowed_column_identifier(identifier),
            IdentifierKind::Index => self.constraints.is_allowed_index_identifier(identifier),
        }
    }
    fn shorten(&self, name: &str) -> String {
        self.shorten_to(name, self.constraints.identifier_max_size())
    }
    // keeps the head of the name and tags it with a hash of the whole name
    fn shorten_to(&self, name: &str, max_size: usize) -> String {
        if name.len() <= max_size {
            return name.to_string();
        }
        let digest = blake3::hash(name.as_bytes()).to_hex();
        let tag = format!("{}x{}", self.constraints.separator(), &digest.as_str()[..8]);
        let keep = max_size.saturating_sub(tag.len());
        let mut head: String = name.chars().take(keep).collect();
        while head.len() > keep {
            head.pop();
        }
        format!("{}{}", head, tag)
    }
}

//! The in-memory document model: ordered documents of typed values.
//!
//! Documents can be built programmatically or parsed from JSON. JSON has no
//! native notion of most of the field types, so the usual extended-JSON
//! wrappers are recognized: `{"$oid": "<24 hex>"}`, `{"$date": "<rfc3339>"}`,
//! `{"$localDate": "YYYY-MM-DD"}`, `{"$localTime": "HH:MM:SS"}`,
//! `{"$timestamp": {"t": <u32>, "i": <u32>}}`, `{"$binary": "<hex>"}` and
//! `{"$long": "<i64>"}`.

use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use serde_json::{Map, Number, json};

use std::fmt;

use crate::error::{DocShredError, Result};

// ------------- ObjectId -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    pub fn new(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 12]>::try_from(bytes).ok().map(Self)
    }
    pub fn from_hex(hex: &str) -> Option<Self> {
        Self::from_slice(&decode_hex(hex)?)
    }
    pub fn bytes(&self) -> &[u8] {
        &self.0
    }
}
impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", encode_hex(&self.0))
    }
}

// ------------- Timestamp -------------
/// A replication timestamp: seconds since the epoch plus an ordinal within the second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timestamp {
    pub seconds: u32,
    pub ordinal: u32,
}

impl Timestamp {
    pub fn new(seconds: u32, ordinal: u32) -> Self {
        Self { seconds, ordinal }
    }
    pub fn as_i64(&self) -> i64 {
        ((u64::from(self.seconds) << 32) | u64::from(self.ordinal)) as i64
    }
    pub fn from_i64(packed: i64) -> Self {
        let packed = packed as u64;
        Self {
            seconds: (packed >> 32) as u32,
            ordinal: packed as u32,
        }
    }
}

// ------------- Value -------------
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i32),
    Long(i64),
    Double(f64),
    String(String),
    Binary(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    Instant(DateTime<Utc>),
    ObjectId(ObjectId),
    Timestamp(Timestamp),
    Document(Document),
    Array(Vec<Value>),
}

impl Value {
    pub fn is_scalar(&self) -> bool {
        !matches!(self, Value::Document(_) | Value::Array(_))
    }
    pub fn from_json(json: serde_json::Value) -> Result<Self> {
        Ok(match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(b),
            serde_json::Value::Number(n) => number_value(&n)?,
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(Value::from_json)
                    .collect::<Result<Vec<_>>>()?,
            ),
            serde_json::Value::Object(map) => match extended_value(&map)? {
                Some(value) => value,
                None => Value::Document(Document::from_json_map(map)?),
            },
        })
    }
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Boolean(b) => json!(b),
            Value::Integer(i) => json!(i),
            Value::Long(l) => json!({ "$long": l.to_string() }),
            Value::Double(d) => Number::from_f64(*d)
                .map(serde_json::Value::Number)
                .unwrap_or_else(|| json!({ "$numberDouble": non_finite_name(*d) })),
            Value::String(s) => json!(s),
            Value::Binary(b) => json!({ "$binary": encode_hex(b) }),
            Value::Date(d) => json!({ "$localDate": d.format("%Y-%m-%d").to_string() }),
            Value::Time(t) => json!({ "$localTime": t.format("%H:%M:%S%.f").to_string() }),
            Value::Instant(i) => json!({ "$date": i.to_rfc3339_opts(SecondsFormat::AutoSi, true) }),
            Value::ObjectId(o) => json!({ "$oid": o.to_string() }),
            Value::Timestamp(t) => json!({ "$timestamp": { "t": t.seconds, "i": t.ordinal } }),
            Value::Document(d) => d.to_json(),
            Value::Array(items) => serde_json::Value::Array(items.iter().map(Value::to_json).collect()),
        }
    }
}

fn number_value(n: &Number) -> Result<Value> {
    if let Some(i) = n.as_i64() {
        return Ok(match i32::try_from(i) {
            Ok(small) => Value::Integer(small),
            Err(_) => Value::Long(i),
        });
    }
    n.as_f64()
        .map(Value::Double)
        .ok_or_else(|| DocShredError::Document(format!("the number {} is out of range", n)))
}

fn extended_value(map: &Map<String, serde_json::Value>) -> Result<Option<Value>> {
    if map.len() != 1 {
        return Ok(None);
    }
    let Some((key, inner)) = map.iter().next() else {
        return Ok(None);
    };
    let text = || {
        inner
            .as_str()
            .ok_or_else(|| DocShredError::Document(format!("{} expects a string", key)))
    };
    let malformed = |what: &str| DocShredError::Document(format!("malformed {}: {}", key, what));
    let value = match key.as_str() {
        "$oid" => Value::ObjectId(ObjectId::from_hex(text()?).ok_or_else(|| malformed(&inner.to_string()))?),
        "$date" => Value::Instant(
            DateTime::parse_from_rfc3339(text()?)
                .map_err(|e| malformed(&e.to_string()))?
                .with_timezone(&Utc),
        ),
        "$localDate" => Value::Date(
            NaiveDate::parse_from_str(text()?, "%Y-%m-%d").map_err(|e| malformed(&e.to_string()))?,
        ),
        "$localTime" => Value::Time(
            NaiveTime::parse_from_str(text()?, "%H:%M:%S%.f").map_err(|e| malformed(&e.to_string()))?,
        ),
        "$binary" => Value::Binary(decode_hex(text()?).ok_or_else(|| malformed("not hex"))?),
        "$long" => Value::Long(text()?.parse().map_err(|_| malformed("not an integer"))?),
        "$numberDouble" => Value::Double(match text()? {
            "NaN" => f64::NAN,
            "Infinity" => f64::INFINITY,
            "-Infinity" => f64::NEG_INFINITY,
            other => other.parse().map_err(|_| malformed("not a number"))?,
        }),
        "$timestamp" => {
            let part = |name: &str| {
                inner
                    .get(name)
                    .and_then(serde_json::Value::as_u64)
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| malformed(name))
            };
            Value::Timestamp(Timestamp::new(part("t")?, part("i")?))
        }
        _ => return Ok(None),
    };
    Ok(Some(value))
}

fn non_finite_name(d: f64) -> &'static str {
    if d.is_nan() {
        "NaN"
    } else if d.is_sign_negative() {
        "-Infinity"
    } else {
        "Infinity"
    }
}

// NaN equals NaN here, so stored documents compare equal to what was written.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Binary(a), Value::Binary(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Time(a), Value::Time(b)) => a == b,
            (Value::Instant(a), Value::Instant(b)) => a == b,
            (Value::ObjectId(a), Value::ObjectId(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (Value::Document(a), Value::Document(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            _ => false,
        }
    }
}

// ------------- Document -------------
/// An ordered set of uniquely named values. Equality ignores key order, as the
/// relational form keeps no record of it.
#[derive(Debug, Clone, Default)]
pub struct Document {
    entries: Vec<(String, Value)>,
}

impl Document {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }
    /// Sets `key`, replacing the value in place if the key already exists.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.insert(key, value);
        self
    }
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
    pub fn from_json_str(text: &str) -> Result<Self> {
        match serde_json::from_str::<serde_json::Value>(text)? {
            serde_json::Value::Object(map) => Self::from_json_map(map),
            other => Err(DocShredError::Document(format!("expected a JSON object, found {}", other))),
        }
    }
    fn from_json_map(map: Map<String, serde_json::Value>) -> Result<Self> {
        let mut document = Document::new();
        for (key, value) in map {
            document.insert(key, Value::from_json(value)?);
        }
        Ok(document)
    }
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.entries
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }
}
impl PartialEq for Document {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .entries
                .iter()
                .all(|(k, v)| other.get(k).is_some_and(|o| o == v))
    }
}
impl<K: Into<String>> FromIterator<(K, Value)> for Document {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        let mut document = Document::new();
        for (key, value) in iter {
            document.insert(key, value);
        }
        document
    }
}
impl fmt::Display for Document {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 || !hex.is_ascii() {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

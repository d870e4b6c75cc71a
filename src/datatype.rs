// used for persistence
use rusqlite::types::{FromSql, ToSql, ToSqlOutput, ValueRef};

// used for the temporal field types
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};

// field types are stored as text in the metadata tables
use serde::{Deserialize, Serialize};

// used to print out readable forms of a field type
use std::fmt;

use crate::document::{ObjectId, Timestamp, Value};
use crate::error::{DocShredError, Result};

// ------------- Field Types -------------
/// The closed set of value kinds a column can hold. `Child` is the structural
/// marker written where a key holds a nested document (false) or array (true).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldType {
    Binary,
    Boolean,
    Date,
    Double,
    Instant,
    Integer,
    Long,
    MongoObjectId,
    MongoTimeStamp,
    Null,
    String,
    Time,
    Child,
}

impl FieldType {
    pub const ALL: [FieldType; 13] = [
        FieldType::Binary,
        FieldType::Boolean,
        FieldType::Date,
        FieldType::Double,
        FieldType::Instant,
        FieldType::Integer,
        FieldType::Long,
        FieldType::MongoObjectId,
        FieldType::MongoTimeStamp,
        FieldType::Null,
        FieldType::String,
        FieldType::Time,
        FieldType::Child,
    ];
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::Binary => "BINARY",
            FieldType::Boolean => "BOOLEAN",
            FieldType::Date => "DATE",
            FieldType::Double => "DOUBLE",
            FieldType::Instant => "INSTANT",
            FieldType::Integer => "INTEGER",
            FieldType::Long => "LONG",
            FieldType::MongoObjectId => "MONGO_OBJECT_ID",
            FieldType::MongoTimeStamp => "MONGO_TIME_STAMP",
            FieldType::Null => "NULL",
            FieldType::String => "STRING",
            FieldType::Time => "TIME",
            FieldType::Child => "CHILD",
        }
    }
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.name() == name)
    }
    /// The column type a value is stored under. Documents and arrays are
    /// represented by their `Child` marker.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => FieldType::Null,
            Value::Boolean(_) => FieldType::Boolean,
            Value::Integer(_) => FieldType::Integer,
            Value::Long(_) => FieldType::Long,
            Value::Double(_) => FieldType::Double,
            Value::String(_) => FieldType::String,
            Value::Binary(_) => FieldType::Binary,
            Value::Date(_) => FieldType::Date,
            Value::Time(_) => FieldType::Time,
            Value::Instant(_) => FieldType::Instant,
            Value::ObjectId(_) => FieldType::MongoObjectId,
            Value::Timestamp(_) => FieldType::MongoTimeStamp,
            Value::Document(_) | Value::Array(_) => FieldType::Child,
        }
    }
}
impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ------------- SQL values -------------
// A NULL-typed column stores a non-null marker so that a present null can be
// told apart from an absent field when rows are read back. SQLite turns a
// bound NaN into NULL, so NaN doubles are stored as their big-endian bits.
impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            Value::Null => Ok(ToSqlOutput::from(true)),
            Value::Boolean(b) => Ok(ToSqlOutput::from(*b)),
            Value::Integer(i) => Ok(ToSqlOutput::from(i64::from(*i))),
            Value::Long(l) => Ok(ToSqlOutput::from(*l)),
            Value::Double(d) if d.is_nan() => Ok(ToSqlOutput::from(d.to_bits().to_be_bytes().to_vec())),
            Value::Double(d) => Ok(ToSqlOutput::from(*d)),
            Value::String(s) => Ok(ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes()))),
            Value::Binary(b) => Ok(ToSqlOutput::Borrowed(ValueRef::Blob(b))),
            Value::Date(d) => d.to_sql(),
            Value::Time(t) => t.to_sql(),
            Value::Instant(i) => i.to_sql(),
            Value::ObjectId(o) => Ok(ToSqlOutput::Borrowed(ValueRef::Blob(o.bytes()))),
            Value::Timestamp(t) => Ok(ToSqlOutput::from(t.as_i64())),
            Value::Document(_) | Value::Array(_) => Err(rusqlite::Error::ToSqlConversionFailure(
                "nested documents and arrays are stored as rows, not as column values".into(),
            )),
        }
    }
}

/// Converts one stored column value back into a document value. SQL NULL means
/// the field is absent from the row and yields `None`.
pub fn value_from_sql(field_type: FieldType, value: ValueRef<'_>) -> Result<Option<Value>> {
    if let ValueRef::Null = value {
        return Ok(None);
    }
    let mismatch = || {
        DocShredError::Invariant(format!(
            "a {} column holds an incompatible {:?} value",
            field_type,
            value.data_type()
        ))
    };
    let converted = match field_type {
        FieldType::Null => Value::Null,
        FieldType::Boolean | FieldType::Child => Value::Boolean(value.as_i64().map_err(|_| mismatch())? != 0),
        FieldType::Integer => {
            let wide = value.as_i64().map_err(|_| mismatch())?;
            Value::Integer(i32::try_from(wide).map_err(|_| mismatch())?)
        }
        FieldType::Long => Value::Long(value.as_i64().map_err(|_| mismatch())?),
        FieldType::Double => match value {
            ValueRef::Integer(i) => Value::Double(i as f64),
            ValueRef::Blob(bits) => {
                let bits: [u8; 8] = bits.try_into().map_err(|_| mismatch())?;
                Value::Double(f64::from_bits(u64::from_be_bytes(bits)))
            }
            _ => Value::Double(value.as_f64().map_err(|_| mismatch())?),
        },
        FieldType::String => Value::String(value.as_str().map_err(|_| mismatch())?.to_string()),
        FieldType::Binary => Value::Binary(value.as_blob().map_err(|_| mismatch())?.to_vec()),
        FieldType::Date => Value::Date(NaiveDate::column_result(value).map_err(|_| mismatch())?),
        FieldType::Time => Value::Time(NaiveTime::column_result(value).map_err(|_| mismatch())?),
        FieldType::Instant => {
            Value::Instant(DateTime::<Utc>::column_result(value).map_err(|_| mismatch())?)
        }
        FieldType::MongoObjectId => {
            let bytes = value.as_blob().map_err(|_| mismatch())?;
            Value::ObjectId(ObjectId::from_slice(bytes).ok_or_else(mismatch)?)
        }
        FieldType::MongoTimeStamp => {
            Value::Timestamp(Timestamp::from_i64(value.as_i64().map_err(|_| mismatch())?))
        }
    };
    Ok(Some(converted))
}

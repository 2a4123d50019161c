//! Schema-typed records: input rows, output pairs and the schemas describing them.

use crate::error::{Error, Result};
use parquet::basic::{ConvertedType, LogicalType, Type as PhysicalType};
use parquet::schema::types::SchemaDescriptor;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// A single column value of a decoded record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl Value {
    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int32(_) => 2,
            Value::Int64(_) => 3,
            Value::Double(_) => 4,
            Value::String(_) => 5,
            Value::Bytes(_) => 6,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(FieldType::Bool),
            Value::Int32(_) => Some(FieldType::Int32),
            Value::Int64(_) => Some(FieldType::Int64),
            Value::Double(_) => Some(FieldType::Double),
            Value::String(_) => Some(FieldType::String),
            Value::Bytes(_) => Some(FieldType::Bytes),
        }
    }

    /// Collapses values that compare unequal bit-wise but mean the same thing
    /// (`-0.0` and `0.0`, NaN payloads).
    pub fn canonical(self) -> Value {
        match self {
            Value::Double(d) if d == 0.0 => Value::Double(0.0),
            Value::Double(d) if d.is_nan() => Value::Double(f64::NAN),
            other => other,
        }
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int32(a), Value::Int32(b)) => a.cmp(b),
            (Value::Int64(a), Value::Int64(b)) => a.cmp(b),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int32(i) => write!(f, "{i}"),
            Value::Int64(i) => write!(f, "{i}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int32(i)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int64(i)
    }
}

/// A decoded record, keyed by column name.
pub type Row = BTreeMap<String, Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Bool,
    Int32,
    Int64,
    Double,
    String,
    Bytes,
}

impl FieldType {
    fn physical_name(self) -> &'static str {
        match self {
            FieldType::Bool => "BOOLEAN",
            FieldType::Int32 => "INT32",
            FieldType::Int64 => "INT64",
            FieldType::Double => "DOUBLE",
            FieldType::String | FieldType::Bytes => "BINARY",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub ty: FieldType,
    pub nullable: bool,
}

impl Field {
    pub fn required(name: impl Into<String>, ty: FieldType) -> Self {
        Self { name: name.into(), ty, nullable: false }
    }

    pub fn optional(name: impl Into<String>, ty: FieldType) -> Self {
        Self { name: name.into(), ty, nullable: true }
    }
}

/// Flat record schema. Field order is the physical column order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    /// Input schema of the tweet count job.
    pub fn tweet() -> Self {
        Self::new(vec![
            Field::required("username", FieldType::String),
            Field::required("tweet", FieldType::String),
            Field::required("timestamp", FieldType::Int64),
        ])
    }

    /// `{key: string, value: int}`
    pub fn output_pair() -> Self {
        Self::new(vec![
            Field::required(OutputPair::KEY_FIELD, FieldType::String),
            Field::required(OutputPair::VALUE_FIELD, FieldType::Int32),
        ])
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Same set of fields, ignoring column order.
    pub fn same_fields(&self, other: &Schema) -> bool {
        let mut a = self.fields.clone();
        let mut b = other.fields.clone();
        a.sort();
        b.sort();
        a == b
    }

    pub fn validate(&self, row: &Row) -> Result<()> {
        for field in &self.fields {
            match row.get(&field.name) {
                None => return Err(Error::Schema(format!("missing field '{}'", field.name))),
                Some(Value::Null) if !field.nullable => {
                    return Err(Error::Schema(format!("null in required field '{}'", field.name)))
                }
                Some(Value::Null) => {}
                Some(v) if v.field_type() != Some(field.ty) => {
                    return Err(Error::Schema(format!(
                        "field '{}' expects {:?}, got {}",
                        field.name, field.ty, v
                    )))
                }
                Some(_) => {}
            }
        }
        if let Some(extra) = row.keys().find(|k| self.field(k).is_none()) {
            return Err(Error::Schema(format!("unexpected field '{extra}'")));
        }
        Ok(())
    }

    pub fn to_message_type(&self) -> String {
        let mut out = String::from("message schema {");
        for f in &self.fields {
            let rep = if f.nullable { "OPTIONAL" } else { "REQUIRED" };
            let annotation = if f.ty == FieldType::String { " (UTF8)" } else { "" };
            out.push_str(&format!(" {} {} {}{};", rep, f.ty.physical_name(), f.name, annotation));
        }
        out.push_str(" }");
        out
    }

    pub fn from_parquet(descr: &SchemaDescriptor) -> Result<Self> {
        let mut fields = Vec::with_capacity(descr.num_columns());
        for col in descr.columns() {
            if col.path().parts().len() != 1 || col.max_rep_level() > 0 {
                return Err(Error::Schema(format!("nested column '{}' is not supported", col.path())));
            }
            let ty = match col.physical_type() {
                PhysicalType::BOOLEAN => FieldType::Bool,
                PhysicalType::INT32 => FieldType::Int32,
                PhysicalType::INT64 => FieldType::Int64,
                PhysicalType::DOUBLE => FieldType::Double,
                PhysicalType::BYTE_ARRAY => {
                    if matches!(col.logical_type(), Some(LogicalType::String))
                        || col.converted_type() == ConvertedType::UTF8
                    {
                        FieldType::String
                    } else {
                        FieldType::Bytes
                    }
                }
                other => {
                    return Err(Error::Schema(format!(
                        "column '{}' has unsupported type {}",
                        col.name(),
                        other
                    )))
                }
            };
            fields.push(Field { name: col.name().to_string(), ty, nullable: col.max_def_level() > 0 });
        }
        Ok(Self { fields })
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            let opt = if field.nullable { "?" } else { "" };
            write!(f, "{}: {:?}{}", field.name, field.ty, opt)?;
        }
        write!(f, "}}")
    }
}

/// One distinct key and the number of contributions it received.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutputPair {
    pub key: String,
    pub count: i32,
}

impl OutputPair {
    pub const KEY_FIELD: &'static str = "key";
    pub const VALUE_FIELD: &'static str = "value";

    pub fn new(key: impl Into<String>, count: i32) -> Self {
        Self { key: key.into(), count }
    }
}

impl From<OutputPair> for Row {
    fn from(pair: OutputPair) -> Row {
        let mut row = Row::new();
        row.insert(OutputPair::KEY_FIELD.to_string(), Value::String(pair.key));
        row.insert(OutputPair::VALUE_FIELD.to_string(), Value::Int32(pair.count));
        row
    }
}

impl TryFrom<&Row> for OutputPair {
    type Error = Error;

    fn try_from(row: &Row) -> Result<Self> {
        let key = match row.get(Self::KEY_FIELD) {
            Some(Value::String(s)) => s.clone(),
            other => return Err(Error::Schema(format!("output pair key must be a string, got {other:?}"))),
        };
        let count = match row.get(Self::VALUE_FIELD) {
            Some(Value::Int32(c)) => *c,
            other => return Err(Error::Schema(format!("output pair value must be an int, got {other:?}"))),
        };
        Ok(Self { key, count })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tweet {
    pub username: String,
    pub tweet: String,
    pub timestamp: i64,
}

impl From<Tweet> for Row {
    fn from(t: Tweet) -> Row {
        let mut row = Row::new();
        row.insert("username".to_string(), Value::String(t.username));
        row.insert("tweet".to_string(), Value::String(t.tweet));
        row.insert("timestamp".to_string(), Value::Int64(t.timestamp));
        row
    }
}

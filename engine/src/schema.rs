//! Table schemas and record serialization.
//!
//! A schema is an ordered list of typed fields; the first field is the
//! primary key. Records are serialized field by field in schema order:
//!
//! - int32: 4 bytes little-endian
//! - string: u32 length + UTF-8 bytes, no terminator
//! - bool: 1 byte, 0 or 1
//! - float64: IEEE-754 bit pattern, little-endian
//! - date: i32 little-endian days since 1970-01-01
//!
//! Inside the tree every key is a `u64` regardless of the key field's type.
//! The widening rules live in [`Value::key_u64`].

use chrono::NaiveDate;

use crate::codec::{CodecError, Reader, Writer};

/// Days from 0001-01-01 (CE) to 1970-01-01, used to convert `NaiveDate`
/// to the on-disk days-since-epoch form.
const UNIX_EPOCH_CE_DAYS: i32 = 719_163;

/// FNV-1a 64-bit offset basis. The hash derives tree keys for non-integer
/// primary key fields, so the constants are part of the on-disk contract.
const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;

/// FNV-1a 64-bit prime.
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Field type discriminants as stored in the table header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Int = 0,
    Str = 1,
    Bool = 2,
    Float = 3,
    Date = 4,
}

impl TryFrom<u8> for FieldType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Int),
            1 => Ok(Self::Str),
            2 => Ok(Self::Bool),
            3 => Ok(Self::Float),
            4 => Ok(Self::Date),
            _ => Err(value),
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Int => "int",
            Self::Str => "string",
            Self::Bool => "bool",
            Self::Float => "float",
            Self::Date => "date",
        };
        write!(f, "{name}")
    }
}

/// A single named, typed field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub ftype: FieldType,
}

impl Field {
    #[must_use]
    pub fn new(name: &str, ftype: FieldType) -> Self {
        Self {
            name: name.to_owned(),
            ftype,
        }
    }
}

/// A typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Str(String),
    Bool(bool),
    Float(f64),
    Date(NaiveDate),
}

impl Value {
    /// Whether this value matches a field type.
    #[must_use]
    pub const fn matches(&self, ftype: FieldType) -> bool {
        matches!(
            (self, ftype),
            (Self::Int(_), FieldType::Int)
                | (Self::Str(_), FieldType::Str)
                | (Self::Bool(_), FieldType::Bool)
                | (Self::Float(_), FieldType::Float)
                | (Self::Date(_), FieldType::Date)
        )
    }

    /// Parse a date value from its canonical `YYYY-MM-DD` text form.
    pub fn parse_date(text: &str) -> Result<Self, SchemaError> {
        NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .map(Self::Date)
            .map_err(|_| SchemaError::InvalidDate(text.to_owned()))
    }

    /// Widen this value to the uniform `u64` tree key.
    ///
    /// int32 values are bit-cast through u32 and zero-extended, so the key
    /// order matches unsigned interpretation of the stored bits. Strings are
    /// hashed with FNV-1a 64; bool, float, and date keys are their stored bit
    /// patterns.
    #[must_use]
    pub fn key_u64(&self) -> u64 {
        match self {
            Self::Int(v) => u64::from(v.cast_unsigned()),
            Self::Str(s) => fnv1a_64(s.as_bytes()),
            Self::Bool(b) => u64::from(*b),
            Self::Float(f) => f.to_bits(),
            Self::Date(d) => u64::from(days_since_epoch(*d).cast_unsigned()),
        }
    }
}

/// FNV-1a over a byte string. Stable across builds; the constants above are
/// part of the format.
fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn days_since_epoch(date: NaiveDate) -> i32 {
    chrono::Datelike::num_days_from_ce(&date) - UNIX_EPOCH_CE_DAYS
}

fn date_from_days(days: i32) -> Result<NaiveDate, SchemaError> {
    NaiveDate::from_num_days_from_ce_opt(days + UNIX_EPOCH_CE_DAYS)
        .ok_or(SchemaError::DateOutOfRange(days))
}

/// An ordered field list plus the table name. The first field is the
/// primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    table: String,
    fields: Vec<Field>,
}

impl Schema {
    /// Create a schema. The field list must be non-empty.
    pub fn new(table: &str, fields: Vec<Field>) -> Result<Self, SchemaError> {
        if fields.is_empty() {
            return Err(SchemaError::EmptySchema);
        }
        Ok(Self {
            table: table.to_owned(),
            fields,
        })
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// The primary key field (always the first).
    #[must_use]
    pub fn key_field(&self) -> &Field {
        &self.fields[0]
    }

    /// Serialize the schema for the table header: length-prefixed table
    /// name, u32 field count, then per field a length-prefixed name and a
    /// one-byte type code.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // field counts are small
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.put_string(&self.table);
        w.put_u32(self.fields.len() as u32);
        for field in &self.fields {
            w.put_string(&field.name);
            w.put_u8(field.ftype as u8);
        }
        w.into_bytes()
    }

    /// Parse a schema from a header reader, leaving the reader positioned
    /// after the schema bytes.
    pub fn read_from(r: &mut Reader<'_>) -> Result<Self, SchemaError> {
        let table = r.read_string()?;
        let count = r.read_u32()? as usize;
        if count == 0 {
            return Err(SchemaError::EmptySchema);
        }
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            let name = r.read_string()?;
            let code = r.read_u8()?;
            let ftype = FieldType::try_from(code).map_err(SchemaError::UnknownTypeCode)?;
            fields.push(Field { name, ftype });
        }
        Ok(Self { table, fields })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SchemaError> {
        Self::read_from(&mut Reader::new(bytes))
    }

    /// Serialize a record. The value list must match the schema in arity
    /// and type.
    pub fn encode_record(&self, values: &[Value]) -> Result<Vec<u8>, SchemaError> {
        if values.len() != self.fields.len() {
            return Err(SchemaError::FieldCount {
                expected: self.fields.len(),
                got: values.len(),
            });
        }
        let mut w = Writer::new();
        for (field, value) in self.fields.iter().zip(values) {
            if !value.matches(field.ftype) {
                return Err(SchemaError::TypeMismatch {
                    field: field.name.as_str().to_owned(),
                    expected: field.ftype,
                });
            }
            match value {
                Value::Int(v) => w.put_i32(*v),
                Value::Str(s) => w.put_string(s),
                Value::Bool(b) => w.put_u8(u8::from(*b)),
                Value::Float(f) => w.put_f64(*f),
                Value::Date(d) => w.put_i32(days_since_epoch(*d)),
            }
        }
        Ok(w.into_bytes())
    }

    /// Deserialize a record produced by [`Schema::encode_record`].
    pub fn decode_record(&self, bytes: &[u8]) -> Result<Vec<Value>, SchemaError> {
        let mut r = Reader::new(bytes);
        let mut values = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let value = match field.ftype {
                FieldType::Int => Value::Int(r.read_i32()?),
                FieldType::Str => Value::Str(r.read_string()?),
                FieldType::Bool => Value::Bool(r.read_u8()? != 0),
                FieldType::Float => Value::Float(r.read_f64()?),
                FieldType::Date => Value::Date(date_from_days(r.read_i32()?)?),
            };
            values.push(value);
        }
        Ok(values)
    }

    /// Extract the tree key from a record's values.
    pub fn primary_key(&self, values: &[Value]) -> Result<u64, SchemaError> {
        let field = self.key_field();
        let value = values.first().ok_or(SchemaError::FieldCount {
            expected: self.fields.len(),
            got: 0,
        })?;
        if !value.matches(field.ftype) {
            return Err(SchemaError::TypeMismatch {
                field: field.name.as_str().to_owned(),
                expected: field.ftype,
            });
        }
        Ok(value.key_u64())
    }
}

/// Errors from schema parsing and record (de)serialization.
#[derive(Debug)]
pub enum SchemaError {
    /// Underlying codec failure.
    Codec(CodecError),
    /// Unknown field type code in a stored schema.
    UnknownTypeCode(u8),
    /// A record's value count does not match the schema.
    FieldCount { expected: usize, got: usize },
    /// A value's type does not match its field.
    TypeMismatch { field: String, expected: FieldType },
    /// A schema must have at least one field.
    EmptySchema,
    /// Text did not parse as `YYYY-MM-DD`.
    InvalidDate(String),
    /// Stored day count outside the representable date range.
    DateOutOfRange(i32),
}

impl std::fmt::Display for SchemaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Codec(e) => write!(f, "schema codec error: {e}"),
            Self::UnknownTypeCode(c) => write!(f, "unknown field type code: {c}"),
            Self::FieldCount { expected, got } => {
                write!(f, "record has {got} values, schema expects {expected}")
            }
            Self::TypeMismatch { field, expected } => {
                write!(f, "value for field '{field}' is not of type {expected}")
            }
            Self::EmptySchema => write!(f, "schema must have at least one field"),
            Self::InvalidDate(s) => write!(f, "invalid date (expected YYYY-MM-DD): '{s}'"),
            Self::DateOutOfRange(d) => write!(f, "stored date out of range: {d} days"),
        }
    }
}

impl std::error::Error for SchemaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CodecError> for SchemaError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

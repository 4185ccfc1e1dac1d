//! The type catalog: object classes, field policy flags, value packing.
//!
//! The state server, database, and client agent all consult the catalog
//! the same way: "given a class number, enumerate fields and their flags"
//! and "pack/unpack a field's argument tuple to/from bytes". The catalog
//! can be supplied as a TOML file or built programmatically; the built-in
//! game schema lives in [`schema`].

mod schema;

pub use schema::game_schema;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use otp_proto::{Datagram, DatagramIter, ProtocolError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while consulting the catalog or (un)packing values.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("unknown class number: {0}")]
    UnknownClass(u16),

    #[error("unknown class name: {0}")]
    UnknownClassName(String),

    #[error("unknown field {number} on class {class}")]
    UnknownField { class: String, number: u16 },

    #[error("unknown field {name} on class {class}")]
    UnknownFieldName { class: String, name: String },

    #[error("field {field}: expected {expected} argument(s), got {got}")]
    ArityMismatch { field: String, expected: usize, got: usize },

    #[error("field {field}: argument {index} has the wrong kind")]
    KindMismatch { field: String, index: usize },

    #[error("duplicate class number: {0}")]
    DuplicateClass(u16),

    #[error(transparent)]
    Wire(#[from] ProtocolError),

    #[error("schema parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Kind of a single argument in a field's tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArgKind {
    U8,
    U16,
    U32,
    U64,
    I32,
    Str,
    Blob,
    /// u16-count-prefixed list of u32s.
    U32Array,
    /// u16-count-prefixed list of (u32 id, u8 kind) pairs.
    PairArray,
}

/// A single argument value. JSON-serializable so the database backend can
/// persist field tuples verbatim.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I32(i32),
    Str(String),
    Blob(Vec<u8>),
    U32Array(Vec<u32>),
    PairArray(Vec<(u32, u8)>),
}

impl FieldValue {
    fn kind(&self) -> ArgKind {
        match self {
            Self::U8(_) => ArgKind::U8,
            Self::U16(_) => ArgKind::U16,
            Self::U32(_) => ArgKind::U32,
            Self::U64(_) => ArgKind::U64,
            Self::I32(_) => ArgKind::I32,
            Self::Str(_) => ArgKind::Str,
            Self::Blob(_) => ArgKind::Blob,
            Self::U32Array(_) => ArgKind::U32Array,
            Self::PairArray(_) => ArgKind::PairArray,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{s:?}"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// A declared field with its policy flags.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FieldSpec {
    pub number: u16,
    pub name: String,
    #[serde(default)]
    pub args: Vec<ArgKind>,

    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub broadcast: bool,
    #[serde(default)]
    pub ram: bool,
    #[serde(default)]
    pub db: bool,
    #[serde(default)]
    pub clsend: bool,
    #[serde(default)]
    pub ownsend: bool,
    #[serde(default)]
    pub airecv: bool,

    /// Default argument tuple, used by database creation for `db` fields.
    #[serde(default)]
    pub default: Option<Vec<FieldValue>>,
}

impl FieldSpec {
    /// Pack an argument tuple to wire bytes, validating kinds.
    pub fn pack(&self, values: &[FieldValue]) -> Result<Vec<u8>, SchemaError> {
        if values.len() != self.args.len() {
            return Err(SchemaError::ArityMismatch {
                field: self.name.clone(),
                expected: self.args.len(),
                got: values.len(),
            });
        }

        let mut dg = Datagram::new();
        for (index, (value, kind)) in values.iter().zip(&self.args).enumerate() {
            if value.kind() != *kind {
                return Err(SchemaError::KindMismatch { field: self.name.clone(), index });
            }
            match value {
                FieldValue::U8(v) => dg.add_u8(*v),
                FieldValue::U16(v) => dg.add_u16(*v),
                FieldValue::U32(v) => dg.add_u32(*v),
                FieldValue::U64(v) => dg.add_u64(*v),
                FieldValue::I32(v) => dg.add_i32(*v),
                FieldValue::Str(v) => dg.add_string(v),
                FieldValue::Blob(v) => dg.add_blob(v),
                FieldValue::U32Array(v) => {
                    dg.add_u16(v.len() as u16);
                    for item in v {
                        dg.add_u32(*item);
                    }
                }
                FieldValue::PairArray(v) => {
                    dg.add_u16(v.len() as u16);
                    for (id, kind) in v {
                        dg.add_u32(*id);
                        dg.add_u8(*kind);
                    }
                }
            }
        }
        Ok(dg.freeze().to_vec())
    }

    /// Unpack one argument tuple from the cursor.
    pub fn unpack(&self, it: &mut DatagramIter<'_>) -> Result<Vec<FieldValue>, SchemaError> {
        let mut values = Vec::with_capacity(self.args.len());
        for kind in &self.args {
            let value = match kind {
                ArgKind::U8 => FieldValue::U8(it.read_u8()?),
                ArgKind::U16 => FieldValue::U16(it.read_u16()?),
                ArgKind::U32 => FieldValue::U32(it.read_u32()?),
                ArgKind::U64 => FieldValue::U64(it.read_u64()?),
                ArgKind::I32 => FieldValue::I32(it.read_i32()?),
                ArgKind::Str => FieldValue::Str(it.read_string()?),
                ArgKind::Blob => FieldValue::Blob(it.read_blob()?),
                ArgKind::U32Array => {
                    let count = it.read_u16()? as usize;
                    let mut items = Vec::with_capacity(count);
                    for _ in 0..count {
                        items.push(it.read_u32()?);
                    }
                    FieldValue::U32Array(items)
                }
                ArgKind::PairArray => {
                    let count = it.read_u16()? as usize;
                    let mut items = Vec::with_capacity(count);
                    for _ in 0..count {
                        items.push((it.read_u32()?, it.read_u8()?));
                    }
                    FieldValue::PairArray(items)
                }
            };
            values.push(value);
        }
        Ok(values)
    }
}

/// An object class: fields held sorted by number.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClassSpec {
    pub number: u16,
    pub name: String,
    /// The class whose generates carry a live player; its objects are never
    /// created to clients out of the quiet zone.
    #[serde(default)]
    pub player_avatar: bool,
    #[serde(default, rename = "field")]
    pub fields: Vec<FieldSpec>,
}

impl ClassSpec {
    pub fn field(&self, number: u16) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.number == number)
    }

    pub fn field_by_name(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Declared required fields, in field-number order.
    pub fn required_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.required)
    }
}

/// The catalog of classes, the oracle every service consults.
#[derive(Debug, Clone)]
pub struct Catalog {
    by_number: HashMap<u16, Arc<ClassSpec>>,
    by_name: HashMap<String, u16>,
    hash: u32,
}

#[derive(Deserialize)]
struct SchemaFile {
    #[serde(default, rename = "class")]
    classes: Vec<ClassSpec>,
}

impl Catalog {
    pub fn new(mut classes: Vec<ClassSpec>) -> Result<Self, SchemaError> {
        let mut by_number = HashMap::new();
        let mut by_name = HashMap::new();
        let mut hash = Fnv1a::new();

        classes.sort_by_key(|c| c.number);
        for mut class in classes {
            class.fields.sort_by_key(|f| f.number);

            hash.write_u16(class.number);
            hash.write(class.name.as_bytes());
            for field in &class.fields {
                hash.write_u16(field.number);
                hash.write(field.name.as_bytes());
                hash.write(&[flag_bits(field)]);
                for kind in &field.args {
                    hash.write(&[*kind as u8]);
                }
            }

            if by_number.contains_key(&class.number) || by_name.contains_key(&class.name) {
                return Err(SchemaError::DuplicateClass(class.number));
            }
            by_name.insert(class.name.clone(), class.number);
            by_number.insert(class.number, Arc::new(class));
        }

        Ok(Self { by_number, by_name, hash: hash.finish() })
    }

    pub fn from_toml(raw: &str) -> Result<Self, SchemaError> {
        let file: SchemaFile = toml::from_str(raw)?;
        Self::new(file.classes)
    }

    pub fn class(&self, number: u16) -> Option<&Arc<ClassSpec>> {
        self.by_number.get(&number)
    }

    pub fn class_by_name(&self, name: &str) -> Option<&Arc<ClassSpec>> {
        self.by_name.get(name).and_then(|n| self.by_number.get(n))
    }

    /// Deterministic digest of the declarations; gates `CLIENT_LOGIN_2`.
    pub fn hash(&self) -> u32 {
        self.hash
    }
}

fn flag_bits(field: &FieldSpec) -> u8 {
    (field.required as u8)
        | (field.broadcast as u8) << 1
        | (field.ram as u8) << 2
        | (field.db as u8) << 3
        | (field.clsend as u8) << 4
        | (field.ownsend as u8) << 5
        | (field.airecv as u8) << 6
}

/// 32-bit FNV-1a.
struct Fnv1a(u32);

impl Fnv1a {
    fn new() -> Self {
        Self(0x811c_9dc5)
    }

    fn write(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.0 ^= *b as u32;
            self.0 = self.0.wrapping_mul(0x0100_0193);
        }
    }

    fn write_u16(&mut self, v: u16) {
        self.write(&v.to_le_bytes());
    }

    fn finish(&self) -> u32 {
        self.0
    }
}

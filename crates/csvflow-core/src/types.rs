//! Data model shared by the parser, converter, assembler, and sinks.

use arcstr::ArcStr;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Zero-based position of a line within its source. Line 0 is the header.
pub type LineIndex = u64;

/// One line of text as yielded by a line reader, tagged with its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    pub index: LineIndex,
    pub text: String,
}

impl RawLine {
    pub fn new(index: LineIndex, text: impl Into<String>) -> Self {
        Self {
            index,
            text: text.into(),
        }
    }
}

/// Declared type of a column's values.
///
/// `Row` exists so composite schemas can be described, but a cell is always
/// scalar and converting into `Row` is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    Boolean,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    String,
    Object,
    Row,
}

impl DataType {
    pub const fn name(&self) -> &'static str {
        match self {
            DataType::Boolean => "BOOLEAN",
            DataType::Byte => "BYTE",
            DataType::Short => "SHORT",
            DataType::Int => "INT",
            DataType::Long => "LONG",
            DataType::Float => "FLOAT",
            DataType::Double => "DOUBLE",
            DataType::String => "STRING",
            DataType::Object => "OBJECT",
            DataType::Row => "ROW",
        }
    }

    pub const fn is_scalar(&self) -> bool {
        !matches!(self, DataType::Row)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        const ALL: [DataType; 10] = [
            DataType::Boolean,
            DataType::Byte,
            DataType::Short,
            DataType::Int,
            DataType::Long,
            DataType::Float,
            DataType::Double,
            DataType::String,
            DataType::Object,
            DataType::Row,
        ];
        ALL.into_iter()
            .find(|t| t.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown data type: {s}"))
    }
}

/// A converted cell value. One variant per scalar [`DataType`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Boolean(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Object(serde_json::Value),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Boolean(_) => DataType::Boolean,
            Value::Byte(_) => DataType::Byte,
            Value::Short(_) => DataType::Short,
            Value::Int(_) => DataType::Int,
            Value::Long(_) => DataType::Long,
            Value::Float(_) => DataType::Float,
            Value::Double(_) => DataType::Double,
            Value::String(_) => DataType::String,
            Value::Object(_) => DataType::Object,
        }
    }
}

/// Where a schema column takes its value from: a header name or a header
/// position. Integers in YAML become positions, strings become names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnSource {
    Position(usize),
    Name(String),
}

impl fmt::Display for ColumnSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnSource::Position(p) => write!(f, "#{p}"),
            ColumnSource::Name(n) => f.write_str(n),
        }
    }
}

/// Schema entry: selects one header field, renames it, and types it.
///
/// ```yaml
/// - { source: cf1, name: id, data_type: INT, order: 0 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub source: ColumnSource,

    /// Output field name. Defaults to the matched header name.
    #[serde(default, rename = "name", skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,

    #[serde(default = "default_data_type")]
    pub data_type: DataType,

    /// Output position; columns are emitted in ascending `order`.
    #[serde(default)]
    pub order: u32,
}

fn default_data_type() -> DataType {
    DataType::String
}

impl Column {
    pub fn new(
        source_name: impl Into<String>,
        destination: impl Into<String>,
        data_type: DataType,
        order: u32,
    ) -> Self {
        Self {
            source: ColumnSource::Name(source_name.into()),
            destination: Some(destination.into()),
            data_type,
            order,
        }
    }

    pub fn at_position(
        position: usize,
        destination: impl Into<String>,
        data_type: DataType,
        order: u32,
    ) -> Self {
        Self {
            source: ColumnSource::Position(position),
            destination: Some(destination.into()),
            data_type,
            order,
        }
    }
}

/// One parsed field of a line, named after the header field at the same
/// position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub name: String,
    pub value: String,
}

impl Cell {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Ordered, named, typed fields of one converted line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypedRecord {
    fields: Vec<(String, Value)>,
}

impl TypedRecord {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, name: impl Into<String>, value: Value) {
        self.fields.push((name.into(), value));
    }

    /// First field called `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }
}

impl FromIterator<(String, Value)> for TypedRecord {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

impl Serialize for TypedRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, value) in self.iter() {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Partition key of an envelope: which source the line came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SourcePartition {
    #[serde(rename = "source")]
    pub source_id: ArcStr,
}

/// Offset key of an envelope: which line of the source it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SourceOffset {
    #[serde(rename = "line")]
    pub line_index: LineIndex,
}

/// One record addressed to one destination channel.
///
/// Envelopes produced from the same line share the record allocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputEnvelope {
    pub channel: ArcStr,
    pub partition: SourcePartition,
    pub offset: SourceOffset,
    pub record: Arc<TypedRecord>,
}

use csvflow_core::{ConvertError, DataType, Value};
use std::num::{IntErrorKind, ParseFloatError, ParseIntError};
use std::str::FromStr;
use std::sync::Arc;

/// Turns the text of an OBJECT cell into a structured value.
pub trait ObjectDecoder: Send + Sync {
    fn decode(&self, raw: &str) -> Result<serde_json::Value, ConvertError>;
}

/// Parses JSON, keeping non-JSON text as a JSON string so OBJECT cells are
/// never null.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonObjectDecoder;

impl ObjectDecoder for JsonObjectDecoder {
    fn decode(&self, raw: &str) -> Result<serde_json::Value, ConvertError> {
        Ok(serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_owned())))
    }
}

/// Coerces cell text into a [`Value`] of the declared [`DataType`].
#[derive(Clone)]
pub struct TypeConverter {
    objects: Arc<dyn ObjectDecoder>,
}

impl Default for TypeConverter {
    fn default() -> Self {
        Self::new(Arc::new(JsonObjectDecoder))
    }
}

impl std::fmt::Debug for TypeConverter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeConverter").finish_non_exhaustive()
    }
}

impl TypeConverter {
    pub fn new(objects: Arc<dyn ObjectDecoder>) -> Self {
        Self { objects }
    }

    pub fn convert(&self, raw: &str, data_type: DataType) -> Result<Value, ConvertError> {
        match data_type {
            DataType::Boolean => parse_bool(raw).map(Value::Boolean),
            DataType::Byte => parse_int(raw, data_type).map(Value::Byte),
            DataType::Short => parse_int(raw, data_type).map(Value::Short),
            DataType::Int => parse_int(raw, data_type).map(Value::Int),
            DataType::Long => parse_int(raw, data_type).map(Value::Long),
            DataType::Float => parse_float(raw, data_type, |v: &f32| v.is_infinite()).map(Value::Float),
            DataType::Double => {
                parse_float(raw, data_type, |v: &f64| v.is_infinite()).map(Value::Double)
            }
            DataType::String => Ok(Value::String(raw.to_owned())),
            DataType::Object => self.objects.decode(raw).map(Value::Object),
            DataType::Row => Err(ConvertError::UnsupportedType(data_type)),
        }
    }
}

/// Convert one cell with the default OBJECT decoder.
pub fn convert_cell_value(raw: &str, data_type: DataType) -> Result<Value, ConvertError> {
    TypeConverter::default().convert(raw, data_type)
}

fn parse_bool(raw: &str) -> Result<bool, ConvertError> {
    if raw.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if raw.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(ConvertError::Format {
            value: raw.to_owned(),
            data_type: DataType::Boolean,
            reason: "expected true or false".into(),
        })
    }
}

fn parse_int<T>(raw: &str, data_type: DataType) -> Result<T, ConvertError>
where
    T: FromStr<Err = ParseIntError>,
{
    raw.parse::<T>().map_err(|e| match e.kind() {
        IntErrorKind::PosOverflow | IntErrorKind::NegOverflow => ConvertError::NumericRange {
            value: raw.to_owned(),
            data_type,
        },
        _ => ConvertError::Format {
            value: raw.to_owned(),
            data_type,
            reason: e.to_string(),
        },
    })
}

// finite text that overflows the width parses to infinity
fn parse_float<T>(
    raw: &str,
    data_type: DataType,
    is_infinite: impl Fn(&T) -> bool,
) -> Result<T, ConvertError>
where
    T: FromStr<Err = ParseFloatError>,
{
    let value = raw.parse::<T>().map_err(|e| ConvertError::Format {
        value: raw.to_owned(),
        data_type,
        reason: e.to_string(),
    })?;
    if is_infinite(&value) && !names_infinity(raw) {
        return Err(ConvertError::NumericRange {
            value: raw.to_owned(),
            data_type,
        });
    }
    Ok(value)
}

fn names_infinity(raw: &str) -> bool {
    let unsigned = raw.trim_start_matches(['+', '-']);
    unsigned.eq_ignore_ascii_case("inf") || unsigned.eq_ignore_ascii_case("infinity")
}

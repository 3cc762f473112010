use crate::types::{DataType, LineIndex};

/// Errors raised while turning raw lines into typed records.
///
/// Every variant is fatal for the `convert` call that raised it unless the
/// source was configured to skip malformed lines.
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    /// A data line split into a different number of fields than the header.
    #[error("expected {expected} fields but found {found}")]
    Parse { expected: usize, found: usize },

    /// The text is numeric but does not fit the declared width.
    #[error("value {value:?} is out of range for {data_type}")]
    NumericRange { value: String, data_type: DataType },

    /// The text does not parse as the declared type at all.
    #[error("value {value:?} is not a valid {data_type}: {reason}")]
    Format {
        value: String,
        data_type: DataType,
        reason: String,
    },

    /// A composite type was requested for a scalar cell.
    #[error("{0} is not a scalar type and cannot hold a cell value")]
    UnsupportedType(DataType),

    /// A schema column names a header field that does not exist.
    #[error("column {0} is not present in the header")]
    UnknownColumn(String),

    /// Two output fields resolved to the same name.
    #[error("output field {0} is produced more than once")]
    DuplicateField(String),

    /// Wraps a per-line failure with the index of the offending line.
    #[error("line {line_index}: {source}")]
    Line {
        line_index: LineIndex,
        #[source]
        source: Box<ConvertError>,
    },

    /// The line reader failed.
    #[error("failed to read line: {0}")]
    Io(#[from] std::io::Error),

    /// The durable offset context failed; surfaced unchanged.
    #[error(transparent)]
    Context(#[from] anyhow::Error),
}

impl ConvertError {
    pub fn at_line(self, line_index: LineIndex) -> Self {
        ConvertError::Line {
            line_index,
            source: Box::new(self),
        }
    }

    /// The underlying error with any line wrapper removed.
    pub fn root(&self) -> &ConvertError {
        match self {
            ConvertError::Line { source, .. } => source.root(),
            other => other,
        }
    }
}

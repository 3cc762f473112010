//! # csvflow Core - Delimited Text Ingestion Core Library
//!
//! This crate provides the foundational types, traits, and configuration used to
//! turn delimited text files into typed, schema-shaped records that are fanned out
//! to one or more destination channels.
//!
//! ## Key Components
//!
//! - **Data Model**: Raw lines, cells, columns, typed records, and output envelopes
//! - **Operator Traits**: Source and Sink abstractions connected by bounded channels
//! - **Configuration**: YAML-based pipeline specification
//! - **Error Handling**: A typed conversion error shared by every component
//!
//! ## Example Usage
//!
//! ```rust
//! use csvflow_core::{Message, PipelineSpec};
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//!
//! # fn example() -> anyhow::Result<()> {
//! let spec = PipelineSpec::from_yaml(
//!     r#"
//! name: "orders"
//! sources:
//!   - type: file_csv
//!     id: "orders-source"
//!     path: "orders.csv"
//!     channels: ["orders"]
//! sinks:
//!   - type: stdout_json
//!     id: "console"
//! "#,
//! )?;
//! let (tx, rx) = mpsc::channel::<Message>(8);
//! let cancel = CancellationToken::new();
//! // Sources and sinks implement the Source and Sink traits and share `tx`/`rx`
//! # Ok(())
//! # }
//! ```

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod error;
pub mod types;

pub use error::ConvertError;
pub use types::{
    Cell, Column, ColumnSource, DataType, LineIndex, OutputEnvelope, RawLine, SourceOffset,
    SourcePartition, TypedRecord, Value,
};

/// Type alias for the sender side of a message channel between operators
pub type EnvelopeTx = mpsc::Sender<Message>;

/// Type alias for the receiver side of a message channel between operators
pub type EnvelopeRx = mpsc::Receiver<Message>;

/// Messages passed from sources to sinks
#[derive(Debug, Clone)]
pub enum Message {
    /// One converted line addressed to one destination channel
    Envelope(OutputEnvelope),

    /// End-of-stream marker
    ///
    /// Signals that the source will send nothing more, allowing sinks to
    /// flush and finish.
    Eos,
}

/// Base trait for all pipeline operators
#[async_trait]
pub trait Operator: Send + Sync {
    /// Returns the unique name/identifier of this operator
    ///
    /// Used for logging and pipeline construction.
    fn name(&self) -> &str;
}

/// Trait for source operators
///
/// Sources read raw lines from an external system, convert them, and publish
/// the resulting envelopes downstream.
#[async_trait]
pub trait Source: Operator {
    /// Run the source operator
    ///
    /// # Arguments
    /// * `tx` - Channel sender for publishing messages to downstream operators
    /// * `cancel` - Cancellation token for graceful shutdown
    async fn run(&mut self, tx: EnvelopeTx, cancel: CancellationToken) -> Result<()>;
}

/// Trait for sink operators
///
/// Sinks are the exit points of a pipeline, writing envelopes to their
/// destination channels.
#[async_trait]
pub trait Sink: Operator {
    /// Run the sink operator until end-of-stream or cancellation
    ///
    /// # Arguments
    /// * `rx` - Channel receiver for consuming input messages
    /// * `cancel` - Cancellation token for graceful shutdown
    async fn run(&mut self, rx: EnvelopeRx, cancel: CancellationToken) -> Result<()>;
}

/// Complete pipeline specification loaded from YAML configuration
///
/// # Example YAML Configuration
///
/// ```yaml
/// name: "orders"
/// sources:
///   - type: file_csv
///     id: "orders-source"
///     path: "data/orders.csv"
///     channels: ["orders-a", "orders-b"]
///     max_lines: 1000
///     columns:
///       - { source: cf1, name: id, data_type: INT, order: 0 }
/// sinks:
///   - type: json_dir
///     id: "out"
///     path: "out/"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Human-readable name of the pipeline
    pub name: String,

    /// List of source specifications
    pub sources: Vec<SourceSpec>,

    /// List of sink specifications
    pub sinks: Vec<SinkSpec>,
}

impl PipelineSpec {
    /// Parse and validate a pipeline document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let spec: PipelineSpec = serde_yaml::from_str(yaml)?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            bail!("pipeline {} declares no sources", self.name);
        }
        if self.sinks.is_empty() {
            bail!("pipeline {} declares no sinks", self.name);
        }
        for source in &self.sources {
            match source {
                SourceSpec::Csv(csv) => csv.validate()?,
            }
        }
        Ok(())
    }
}

/// What to do with a data line that fails to parse or convert
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Abort the whole conversion call
    #[default]
    Fail,
    /// Log a warning, mark the line processed, and continue
    Skip,
}

/// Configuration for delimited text file sources
///
/// Defines which file to read, how its lines are shaped into records, and
/// which channels every record is replicated to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CsvSourceSpec {
    /// Unique identifier for this source operator
    pub id: String,

    /// Path of the file to read. The first line is always the header.
    pub path: String,

    /// Identity used for partition keys and offset tracking
    ///
    /// Defaults to `path`.
    #[serde(default)]
    pub source_id: Option<String>,

    /// Destination channels every record is replicated to
    pub channels: Vec<String>,

    /// Optional schema: selection, renaming, and typing of header fields
    ///
    /// Without a schema every header field is emitted as a STRING under its
    /// header name.
    #[serde(default)]
    pub columns: Option<Vec<Column>>,

    /// Maximum number of data lines converted per pass
    ///
    /// Lines skipped because they were already processed do not count.
    #[serde(default)]
    pub max_lines: Option<usize>,

    /// Track processed lines so a re-read does not emit them again
    #[serde(default = "default_resume")]
    pub resume: bool,

    /// Handling of malformed data lines
    #[serde(default)]
    pub on_error: ErrorPolicy,
}

fn default_resume() -> bool {
    true
}

impl CsvSourceSpec {
    pub fn source_id(&self) -> &str {
        self.source_id.as_deref().unwrap_or(&self.path)
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            bail!("source {} declares no channels", self.id);
        }
        if self.max_lines == Some(0) {
            bail!("source {}: max_lines must be greater than zero", self.id);
        }
        if let Some(columns) = &self.columns {
            let mut seen = HashSet::new();
            for name in columns.iter().filter_map(|c| c.destination.as_deref()) {
                if !seen.insert(name) {
                    bail!("source {}: duplicate column name {}", self.id, name);
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SourceSpec {
    #[serde(rename = "file_csv")]
    Csv(CsvSourceSpec),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SinkSpec {
    #[serde(rename = "stdout_json")]
    Stdout { id: String },
    #[serde(rename = "json_dir")]
    JsonDir { id: String, path: String },
}

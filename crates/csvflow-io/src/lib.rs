//! # csvflow I/O - Conversion Pipeline and Operator Implementations
//!
//! This crate turns delimited text into typed records and moves them through
//! the pipeline operators defined in `csvflow-core`.
//!
//! ## Components
//!
//! - **Cell Parser**: Quote-aware splitting of a line into named cells
//! - **Type Converter**: Coercion of cell text into typed values with range checks
//! - **Offset Cache**: Restart-safe tracking of already converted lines
//! - **Record Assembler**: Header handling, schema projection, typing, and
//!   fan-out of every record to each destination channel
//!
//! ### Operators
//! - **CSV Source**: Reads a file line by line and publishes envelopes
//! - **Stdout Sink**: One JSON object per envelope on standard output
//! - **JSON Directory Sink**: One newline-delimited JSON file per channel
//!
//! ## Example Usage
//!
//! ```rust
//! use csvflow_core::{Column, DataType, RawLine};
//! use csvflow_io::offset_cache::PassThroughOffsetCache;
//! use csvflow_io::record_assembler::{AssemblerConfig, RecordAssembler};
//! use futures::{stream, TryStreamExt};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let cache = Arc::new(PassThroughOffsetCache);
//! let mut config = AssemblerConfig::new("orders.csv", ["orders"], cache);
//! config.schema = Some(vec![Column::new("qty", "quantity", DataType::Int, 0)]);
//! let assembler = RecordAssembler::new(config);
//!
//! let lines = stream::iter(vec![
//!     Ok::<_, std::io::Error>(RawLine::new(0, "sku,qty")),
//!     Ok(RawLine::new(1, "a-1,3")),
//! ]);
//! let envelopes: Vec<_> = assembler.convert(lines, None).try_collect().await?;
//! assert_eq!(envelopes.len(), 1);
//! # Ok(())
//! # }
//! ```

/// Quote-aware line splitting
pub mod cell_parser;

/// Cell value coercion
pub mod type_convert;

/// Processed-line bookkeeping
pub mod offset_cache;

/// Line-to-envelope conversion
pub mod record_assembler;

/// Delimited text file source
pub mod source_csv;

/// Standard output sink for debugging
pub mod sink_stdout;

/// Newline-delimited JSON directory sink
pub mod sink_json_dir;

pub use cell_parser::{parse_header, parse_line, split_line};
pub use type_convert::{convert_cell_value, JsonObjectDecoder, ObjectDecoder, TypeConverter};

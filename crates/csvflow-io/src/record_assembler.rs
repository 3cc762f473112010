//! Conversion of a header-led stream of raw lines into output envelopes.
//!
//! The first line fixes the header. Every later line is, in order:
//!
//! 1. skipped if the offset cache has already seen it
//! 2. split into cells and projected through the schema (or taken whole)
//! 3. typed per column
//! 4. replicated into one envelope per destination channel
//! 5. marked processed once its last envelope has been handed out
//!
//! The returned stream is lazy: lines are pulled only while envelopes are
//! being consumed, so dropping the stream stops reading and leaves any line
//! whose envelopes were not all delivered unmarked.

use crate::cell_parser::{parse_header, parse_line};
use crate::offset_cache::OffsetCache;
use crate::type_convert::TypeConverter;
use arcstr::ArcStr;
use csvflow_core::{
    Column, ColumnSource, ConvertError, DataType, ErrorPolicy, LineIndex, OutputEnvelope,
    RawLine, SourceOffset, SourcePartition, TypedRecord,
};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::collections::{HashSet, VecDeque};
use std::io;
use std::sync::Arc;
use tracing::{debug, warn};

/// Everything a [`RecordAssembler`] needs for one source.
#[derive(Clone)]
pub struct AssemblerConfig {
    /// Identity used for partition keys and offset tracking
    pub source_id: ArcStr,
    /// Every record is replicated to each of these channels
    pub channels: Vec<ArcStr>,
    pub offset_cache: Arc<dyn OffsetCache>,
    /// Selection, renaming, and typing; `None` keeps every header field as STRING
    pub schema: Option<Vec<Column>>,
    pub on_error: ErrorPolicy,
    pub converter: TypeConverter,
}

impl AssemblerConfig {
    /// Config without a schema that fails on the first malformed line.
    pub fn new<I, C>(
        source_id: impl Into<ArcStr>,
        channels: I,
        offset_cache: Arc<dyn OffsetCache>,
    ) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<ArcStr>,
    {
        Self {
            source_id: source_id.into(),
            channels: channels.into_iter().map(Into::into).collect(),
            offset_cache,
            schema: None,
            on_error: ErrorPolicy::Fail,
            converter: TypeConverter::default(),
        }
    }
}

#[derive(Clone)]
pub struct RecordAssembler {
    config: AssemblerConfig,
}

/// Where one output field comes from and how it is typed.
#[derive(Debug, Clone)]
struct FieldPlan {
    position: usize,
    name: String,
    data_type: DataType,
}

#[derive(Debug, Clone)]
struct Layout {
    header: Vec<String>,
    fields: Vec<FieldPlan>,
}

impl RecordAssembler {
    pub fn new(config: AssemblerConfig) -> Self {
        Self { config }
    }

    pub fn source_id(&self) -> &ArcStr {
        &self.config.source_id
    }

    pub fn offset_cache(&self) -> &Arc<dyn OffsetCache> {
        &self.config.offset_cache
    }

    /// Convert `lines` into envelopes, stopping after `max_data_lines`
    /// converted lines when given. Lines skipped as already processed do not
    /// count toward the cap.
    ///
    /// The first error ends the stream.
    pub fn convert<S>(
        &self,
        lines: S,
        max_data_lines: Option<usize>,
    ) -> impl Stream<Item = Result<OutputEnvelope, ConvertError>> + Send + 'static
    where
        S: Stream<Item = io::Result<RawLine>> + Send + 'static,
    {
        let conversion = Conversion {
            assembler: self.clone(),
            lines: lines.boxed(),
            layout: None,
            pending: VecDeque::new(),
            pending_mark: None,
            remaining: max_data_lines,
            finished: false,
        };
        stream::unfold(conversion, |mut conversion| async move {
            if conversion.finished {
                return None;
            }
            match conversion.next_envelope().await {
                Ok(Some(envelope)) => Some((Ok(envelope), conversion)),
                Ok(None) => None,
                Err(error) => {
                    conversion.finished = true;
                    Some((Err(error), conversion))
                }
            }
        })
    }

    fn layout(&self, header_line: &RawLine) -> Result<Layout, ConvertError> {
        let header = parse_header(&header_line.text);
        let fields = match &self.config.schema {
            None => header
                .iter()
                .enumerate()
                .map(|(position, name)| FieldPlan {
                    position,
                    name: name.clone(),
                    data_type: DataType::String,
                })
                .collect(),
            Some(columns) => {
                let mut columns: Vec<&Column> = columns.iter().collect();
                columns.sort_by_key(|c| c.order);
                columns
                    .into_iter()
                    .map(|column| plan_column(column, &header))
                    .collect::<Result<Vec<_>, _>>()?
            }
        };
        let mut seen = HashSet::with_capacity(fields.len());
        if let Some(field) = fields.iter().find(|f| !seen.insert(f.name.as_str())) {
            return Err(ConvertError::DuplicateField(field.name.clone()));
        }
        Ok(Layout { header, fields })
    }

    fn assemble(&self, layout: &Layout, line: &RawLine) -> Result<TypedRecord, ConvertError> {
        let cells = parse_line(&line.text, &layout.header)?;
        let mut record = TypedRecord::with_capacity(layout.fields.len());
        for field in &layout.fields {
            let value = self
                .config
                .converter
                .convert(&cells[field.position].value, field.data_type)?;
            record.push(field.name.as_str(), value);
        }
        Ok(record)
    }

    fn envelopes(
        &self,
        record: TypedRecord,
        line_index: LineIndex,
    ) -> impl Iterator<Item = OutputEnvelope> + '_ {
        let record = Arc::new(record);
        self.config.channels.iter().map(move |channel| OutputEnvelope {
            channel: channel.clone(),
            partition: SourcePartition {
                source_id: self.config.source_id.clone(),
            },
            offset: SourceOffset { line_index },
            record: Arc::clone(&record),
        })
    }
}

fn plan_column(column: &Column, header: &[String]) -> Result<FieldPlan, ConvertError> {
    if !column.data_type.is_scalar() {
        return Err(ConvertError::UnsupportedType(column.data_type));
    }
    let position = match &column.source {
        ColumnSource::Name(name) => header.iter().position(|h| h == name),
        ColumnSource::Position(position) => (*position < header.len()).then_some(*position),
    }
    .ok_or_else(|| ConvertError::UnknownColumn(column.source.to_string()))?;
    Ok(FieldPlan {
        position,
        name: column
            .destination
            .clone()
            .unwrap_or_else(|| header[position].clone()),
        data_type: column.data_type,
    })
}

/// State of one `convert` call.
struct Conversion {
    assembler: RecordAssembler,
    lines: BoxStream<'static, io::Result<RawLine>>,
    layout: Option<Layout>,
    pending: VecDeque<OutputEnvelope>,
    // line whose envelopes are in `pending`, marked when the last one leaves
    pending_mark: Option<LineIndex>,
    remaining: Option<usize>,
    finished: bool,
}

impl Conversion {
    async fn next_envelope(&mut self) -> Result<Option<OutputEnvelope>, ConvertError> {
        loop {
            if let Some(envelope) = self.pending.pop_front() {
                if self.pending.is_empty() {
                    self.flush_mark();
                }
                return Ok(Some(envelope));
            }
            self.flush_mark();

            if self.remaining == Some(0) {
                return Ok(None);
            }
            let Some(line) = self.lines.next().await.transpose()? else {
                return Ok(None);
            };

            if self.layout.is_none() {
                self.layout = Some(self.assembler.layout(&line)?);
                continue;
            }
            let Some(layout) = self.layout.as_ref() else {
                continue;
            };

            let config = &self.assembler.config;
            if !config.offset_cache.should_process(&config.source_id, line.index) {
                debug!(source_id = %config.source_id, line_index = line.index, "line already processed");
                continue;
            }

            match self.assembler.assemble(layout, &line) {
                Ok(record) => {
                    self.pending
                        .extend(self.assembler.envelopes(record, line.index));
                    self.pending_mark = Some(line.index);
                    if let Some(remaining) = self.remaining.as_mut() {
                        *remaining -= 1;
                    }
                }
                Err(error) => match config.on_error {
                    ErrorPolicy::Fail => return Err(error.at_line(line.index)),
                    ErrorPolicy::Skip => {
                        warn!(
                            source_id = %config.source_id,
                            line_index = line.index,
                            %error,
                            "skipping malformed line"
                        );
                        config
                            .offset_cache
                            .mark_processed(&config.source_id, line.index);
                    }
                },
            }
        }
    }

    fn flush_mark(&mut self) {
        if let Some(line_index) = self.pending_mark.take() {
            let config = &self.assembler.config;
            config
                .offset_cache
                .mark_processed(&config.source_id, line_index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offset_cache::{InMemoryOffsetCache, OffsetContext, PassThroughOffsetCache};
    use async_trait::async_trait;
    use csvflow_core::Value;
    use futures::TryStreamExt;
    use std::collections::BTreeSet;

    const CSV: &str = "cf1,cf2,cf3\na,b,c\na,d,c\na,f,c";

    fn lines(text: &str) -> impl Stream<Item = io::Result<RawLine>> + Send + 'static {
        let lines: Vec<io::Result<RawLine>> = text
            .lines()
            .enumerate()
            .map(|(i, l)| Ok(RawLine::new(i as LineIndex, l)))
            .collect();
        stream::iter(lines)
    }

    fn assembler(cache: Arc<dyn OffsetCache>, schema: Option<Vec<Column>>) -> RecordAssembler {
        let mut config = AssemblerConfig::new("test.csv", ["T1", "T2"], cache);
        config.schema = schema;
        RecordAssembler::new(config)
    }

    async fn collect(
        assembler: &RecordAssembler,
        text: &str,
        max: Option<usize>,
    ) -> Result<Vec<OutputEnvelope>, ConvertError> {
        assembler.convert(lines(text), max).try_collect().await
    }

    struct NothingToDo;

    #[async_trait]
    impl OffsetCache for NothingToDo {
        async fn load_if_needed(
            &self,
            _context: &dyn OffsetContext,
            _source_id: &str,
        ) -> Result<(), ConvertError> {
            Ok(())
        }

        fn should_process(&self, _source_id: &str, _line_index: LineIndex) -> bool {
            false
        }

        fn mark_processed(&self, _source_id: &str, _line_index: LineIndex) {}
    }

    #[tokio::test]
    async fn emits_one_envelope_per_line_and_channel() {
        let assembler = assembler(Arc::new(PassThroughOffsetCache), None);
        let envelopes = collect(&assembler, CSV, None).await.unwrap();
        assert_eq!(envelopes.len(), 3 * 2);

        for envelope in &envelopes {
            assert!(envelope.channel == "T1" || envelope.channel == "T2");
            assert_eq!(envelope.partition.source_id, "test.csv");
            assert_eq!(envelope.record.len(), 3);
            assert_eq!(envelope.record.get("cf1"), Some(&Value::String("a".into())));
        }
        let second_line: Vec<_> = envelopes
            .iter()
            .filter(|e| e.offset.line_index == 2)
            .collect();
        assert_eq!(second_line.len(), 2);
        assert_eq!(second_line[0].record.get("cf2"), Some(&Value::String("d".into())));
        assert!(Arc::ptr_eq(&second_line[0].record, &second_line[1].record));
    }

    #[tokio::test]
    async fn without_schema_keeps_header_order() {
        let assembler = assembler(Arc::new(PassThroughOffsetCache), None);
        let envelopes = collect(&assembler, CSV, None).await.unwrap();
        let names: Vec<_> = envelopes[0].record.names().collect();
        assert_eq!(names, vec!["cf1", "cf2", "cf3"]);
    }

    #[tokio::test]
    async fn single_column_schema_projects_one_field() {
        let schema = vec![Column::new("cf1", "cf1", DataType::String, 0)];
        let assembler = assembler(Arc::new(PassThroughOffsetCache), Some(schema));
        let envelopes = collect(&assembler, CSV, None).await.unwrap();
        assert_eq!(envelopes.len(), 6);
        for envelope in envelopes {
            assert_eq!(envelope.record.len(), 1);
            assert_eq!(envelope.record.get("cf1"), Some(&Value::String("a".into())));
        }
    }

    #[tokio::test]
    async fn schema_renames_types_and_orders_fields() {
        let schema = vec![
            Column::new("amount", "total", DataType::Int, 2),
            Column::at_position(0, "key", DataType::String, 0),
            Column::new("ok", "valid", DataType::Boolean, 1),
        ];
        let assembler = assembler(Arc::new(PassThroughOffsetCache), Some(schema));
        let text = "id,amount,ok,note\n\"x,1\",42,true,ignored";
        let envelopes = collect(&assembler, text, None).await.unwrap();
        let record = &envelopes[0].record;
        let names: Vec<_> = record.names().collect();
        assert_eq!(names, vec!["key", "valid", "total"]);
        assert_eq!(record.get("key"), Some(&Value::String("\"x,1\"".into())));
        assert_eq!(record.get("valid"), Some(&Value::Boolean(true)));
        assert_eq!(record.get("total"), Some(&Value::Int(42)));
        assert_eq!(record.get("note"), None);
    }

    #[tokio::test]
    async fn column_without_destination_takes_header_name() {
        let schema = vec![Column {
            source: ColumnSource::Position(1),
            destination: None,
            data_type: DataType::String,
            order: 0,
        }];
        let assembler = assembler(Arc::new(PassThroughOffsetCache), Some(schema));
        let envelopes = collect(&assembler, CSV, Some(1)).await.unwrap();
        assert_eq!(envelopes[0].record.get("cf2"), Some(&Value::String("b".into())));
    }

    #[tokio::test]
    async fn unknown_schema_column_fails() {
        let schema = vec![Column::new("missing", "m", DataType::String, 0)];
        let assembler = assembler(Arc::new(PassThroughOffsetCache), Some(schema));
        let err = collect(&assembler, CSV, None).await.unwrap_err();
        assert!(matches!(err, ConvertError::UnknownColumn(name) if name == "missing"));
    }

    #[tokio::test]
    async fn nothing_emitted_when_every_line_is_cached() {
        let assembler = assembler(Arc::new(NothingToDo), None);
        let envelopes = collect(&assembler, CSV, None).await.unwrap();
        assert!(envelopes.is_empty());
    }

    #[tokio::test]
    async fn empty_input_yields_nothing() {
        let assembler = assembler(Arc::new(PassThroughOffsetCache), None);
        assert!(collect(&assembler, "", None).await.unwrap().is_empty());
        assert!(collect(&assembler, "cf1,cf2", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cap_bounds_converted_lines() {
        for k in 1..=3 {
            let assembler = assembler(Arc::new(PassThroughOffsetCache), None);
            let envelopes = collect(&assembler, CSV, Some(k)).await.unwrap();
            let lines: BTreeSet<_> = envelopes.iter().map(|e| e.offset.line_index).collect();
            assert_eq!(lines.len(), k);
            assert_eq!(lines, (1..=k as LineIndex).collect::<BTreeSet<_>>());
        }
    }

    #[tokio::test]
    async fn repeated_capped_calls_resume_where_they_left_off() {
        let assembler = assembler(Arc::new(InMemoryOffsetCache::new()), None);

        let first = collect(&assembler, CSV, Some(2)).await.unwrap();
        let first: BTreeSet<_> = first.iter().map(|e| e.offset.line_index).collect();
        assert_eq!(first, BTreeSet::from([1, 2]));

        let second = collect(&assembler, CSV, Some(2)).await.unwrap();
        let second: BTreeSet<_> = second.iter().map(|e| e.offset.line_index).collect();
        assert_eq!(second, BTreeSet::from([3]));

        assert!(collect(&assembler, CSV, Some(2)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_line_aborts_conversion() {
        let cache = Arc::new(InMemoryOffsetCache::new());
        let assembler = assembler(cache.clone(), None);
        let err = collect(&assembler, "cf1,cf2\na,b\nc\nd,e", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ConvertError::Line { line_index: 2, .. }));
        assert!(matches!(err.root(), ConvertError::Parse { expected: 2, found: 1 }));
        assert!(!cache.should_process("test.csv", 1));
        assert!(cache.should_process("test.csv", 2));
        assert!(cache.should_process("test.csv", 3));
    }

    #[tokio::test]
    async fn conversion_error_aborts_conversion() {
        let schema = vec![Column::new("n", "n", DataType::Byte, 0)];
        let assembler = assembler(Arc::new(PassThroughOffsetCache), Some(schema));
        let err = collect(&assembler, "n\n127\n128", None).await.unwrap_err();
        assert!(matches!(err.root(), ConvertError::NumericRange { .. }));
    }

    #[tokio::test]
    async fn skip_policy_drops_bad_lines() {
        let cache = Arc::new(InMemoryOffsetCache::new());
        let mut config = AssemblerConfig::new("test.csv", ["T1"], cache.clone());
        config.on_error = ErrorPolicy::Skip;
        let assembler = RecordAssembler::new(config);

        let envelopes = collect(&assembler, "cf1,cf2\na,b\nc\nd,e", Some(2))
            .await
            .unwrap();
        let lines: Vec<_> = envelopes.iter().map(|e| e.offset.line_index).collect();
        assert_eq!(lines, vec![1, 3]);
        assert!(!cache.should_process("test.csv", 2));
    }

    #[tokio::test]
    async fn blank_line_is_an_empty_value_under_a_single_column_header() {
        let config = AssemblerConfig::new("test.csv", ["T1"], Arc::new(PassThroughOffsetCache));
        let assembler = RecordAssembler::new(config);
        let envelopes = collect(&assembler, "cf1\na\n\nb", None).await.unwrap();
        let lines: Vec<_> = envelopes.iter().map(|e| e.offset.line_index).collect();
        assert_eq!(lines, vec![1, 2, 3]);
        assert_eq!(envelopes[1].record.get("cf1"), Some(&Value::String(String::new())));
    }

    #[tokio::test]
    async fn blank_line_under_a_wider_header_is_a_parse_error() {
        let assembler = assembler(Arc::new(PassThroughOffsetCache), None);
        let err = collect(&assembler, "cf1,cf2\na,b\n\nc,d", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ConvertError::Line { line_index: 2, .. }));
        assert!(matches!(err.root(), ConvertError::Parse { expected: 2, found: 1 }));
    }

    #[tokio::test]
    async fn duplicate_output_names_are_rejected() {
        let renamed = vec![
            Column::new("cf1", "x", DataType::String, 0),
            Column::new("cf2", "x", DataType::String, 1),
        ];
        let by_rename = assembler(Arc::new(PassThroughOffsetCache), Some(renamed));
        let err = collect(&by_rename, CSV, None).await.unwrap_err();
        assert!(matches!(err, ConvertError::DuplicateField(name) if name == "x"));

        // header name taken implicitly, then the same field again by position
        let implicit = vec![
            Column {
                source: ColumnSource::Name("cf1".into()),
                destination: None,
                data_type: DataType::String,
                order: 0,
            },
            Column {
                source: ColumnSource::Position(0),
                destination: None,
                data_type: DataType::String,
                order: 1,
            },
        ];
        let by_header = assembler(Arc::new(PassThroughOffsetCache), Some(implicit));
        let err = collect(&by_header, CSV, None).await.unwrap_err();
        assert!(matches!(err, ConvertError::DuplicateField(name) if name == "cf1"));
    }

    #[tokio::test]
    async fn row_column_is_rejected_with_the_header() {
        let schema = vec![Column::new("cf1", "nested", DataType::Row, 0)];
        let assembler = assembler(Arc::new(PassThroughOffsetCache), Some(schema));
        let err = collect(&assembler, CSV, None).await.unwrap_err();
        assert!(matches!(err, ConvertError::UnsupportedType(DataType::Row)));
    }

    #[tokio::test]
    async fn read_error_is_surfaced() {
        let assembler = assembler(Arc::new(PassThroughOffsetCache), None);
        let input = stream::iter(vec![
            Ok(RawLine::new(0, "cf1")),
            Err(io::Error::new(io::ErrorKind::InvalidData, "bad utf-8")),
        ]);
        let result: Result<Vec<_>, _> = assembler.convert(input, None).try_collect().await;
        assert!(matches!(result, Err(ConvertError::Io(_))));
    }

    #[tokio::test]
    async fn dropping_the_stream_leaves_undelivered_lines_unmarked() {
        let cache = Arc::new(InMemoryOffsetCache::new());
        let assembler = assembler(cache.clone(), None);
        {
            let mut envelopes = Box::pin(assembler.convert(lines(CSV), None));
            let first = envelopes.next().await.unwrap().unwrap();
            assert_eq!(first.offset.line_index, 1);
            assert!(cache.should_process("test.csv", 1));
            let second = envelopes.next().await.unwrap().unwrap();
            assert_eq!(second.offset.line_index, 1);
            assert!(!cache.should_process("test.csv", 1));
            let third = envelopes.next().await.unwrap().unwrap();
            assert_eq!(third.offset.line_index, 2);
        }
        assert!(cache.should_process("test.csv", 2));
        assert!(cache.should_process("test.csv", 3));
    }
}

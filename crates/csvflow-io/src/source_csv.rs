use crate::offset_cache::{
    InMemoryOffsetCache, MemoryOffsetContext, OffsetCache, OffsetContext, PassThroughOffsetCache,
};
use crate::record_assembler::{AssemblerConfig, RecordAssembler};
use anyhow::{Context, Result};
use async_trait::async_trait;
use csvflow_core::{CsvSourceSpec, EnvelopeTx, LineIndex, Message, Operator, RawLine, Source};
use futures::{Stream, StreamExt};
use std::io;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct CsvSource {
    pub id: String,
    pub spec: CsvSourceSpec,
    assembler: RecordAssembler,
    context: Arc<dyn OffsetContext>,
}

impl CsvSource {
    /// Source with an in-memory offset cache when `spec.resume` is set and a
    /// pass-through cache otherwise, starting from no committed offsets.
    pub fn try_new(spec: CsvSourceSpec) -> Result<Self> {
        let cache: Arc<dyn OffsetCache> = if spec.resume {
            Arc::new(InMemoryOffsetCache::new())
        } else {
            Arc::new(PassThroughOffsetCache)
        };
        Self::with_offsets(spec, cache, Arc::new(MemoryOffsetContext::new()))
    }

    /// Source sharing `cache` with other workers and hydrating it from
    /// `context`.
    pub fn with_offsets(
        spec: CsvSourceSpec,
        cache: Arc<dyn OffsetCache>,
        context: Arc<dyn OffsetContext>,
    ) -> Result<Self> {
        spec.validate()?;
        let mut config = AssemblerConfig::new(
            spec.source_id(),
            spec.channels.iter().map(String::as_str),
            cache,
        );
        config.schema = spec.columns.clone();
        config.on_error = spec.on_error;
        Ok(Self {
            id: spec.id.clone(),
            assembler: RecordAssembler::new(config),
            context,
            spec,
        })
    }

    async fn open(&self) -> Result<impl Stream<Item = io::Result<RawLine>> + Send + 'static> {
        let file = File::open(&self.spec.path)
            .await
            .with_context(|| format!("open {}", self.spec.path))?;
        let lines = LinesStream::new(BufReader::new(file).lines());
        Ok(lines
            .enumerate()
            .map(|(index, line)| line.map(|text| RawLine::new(index as LineIndex, text))))
    }
}

#[async_trait]
impl Operator for CsvSource {
    fn name(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl Source for CsvSource {
    async fn run(&mut self, tx: EnvelopeTx, cancel: CancellationToken) -> Result<()> {
        let source_id = self.assembler.source_id().clone();
        self.assembler
            .offset_cache()
            .load_if_needed(self.context.as_ref(), &source_id)
            .await
            .with_context(|| format!("load offsets for {}", source_id))?;

        // one pass per batch of `max_lines`; stop once a pass converts nothing
        loop {
            let lines = self.open().await?;
            let mut envelopes = std::pin::pin!(self.assembler.convert(lines, self.spec.max_lines));
            let mut converted = 0usize;
            let mut last_line = None;
            let mut stopped = false;

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => {
                        stopped = true;
                        break;
                    }
                    next = envelopes.next() => next,
                };
                let Some(envelope) = next else {
                    break;
                };
                let envelope = envelope.with_context(|| format!("convert {}", self.spec.path))?;
                if last_line != Some(envelope.offset.line_index) {
                    last_line = Some(envelope.offset.line_index);
                    converted += 1;
                }
                if tx.send(Message::Envelope(envelope)).await.is_err() {
                    stopped = true;
                    break;
                }
            }

            info!(source_id = %source_id, converted, "conversion pass finished");
            if stopped
                || converted == 0
                || self.spec.max_lines.is_none()
                || !self.assembler.offset_cache().resumes()
            {
                break;
            }
        }

        let _ = tx.send(Message::Eos).await; // best-effort
        Ok(())
    }
}

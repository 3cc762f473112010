//! Bookkeeping of which lines of a source have already been converted.
//!
//! A source can be re-read from its first line after a restart; the cache
//! answers whether a given line still needs converting so that nothing handed
//! off before the restart is emitted again.
//!
//! Two variants share the [`OffsetCache`] capability:
//!
//! - [`InMemoryOffsetCache`]: per-source processed-line state, hydrated once
//!   per source from an [`OffsetContext`]
//! - [`PassThroughOffsetCache`]: processes every line, remembers nothing

use async_trait::async_trait;
use csvflow_core::{ConvertError, LineIndex};
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Durable record of the last line committed downstream for each source.
///
/// Owned by whatever delivers envelopes; the cache only reads from it.
#[async_trait]
pub trait OffsetContext: Send + Sync {
    async fn committed_offset(&self, source_id: &str) -> anyhow::Result<Option<LineIndex>>;
}

/// [`OffsetContext`] backed by a plain map.
#[derive(Debug, Clone, Default)]
pub struct MemoryOffsetContext {
    offsets: HashMap<String, LineIndex>,
}

impl MemoryOffsetContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_offset(mut self, source_id: impl Into<String>, line_index: LineIndex) -> Self {
        self.offsets.insert(source_id.into(), line_index);
        self
    }
}

#[async_trait]
impl OffsetContext for MemoryOffsetContext {
    async fn committed_offset(&self, source_id: &str) -> anyhow::Result<Option<LineIndex>> {
        Ok(self.offsets.get(source_id).copied())
    }
}

/// Tracks processed line indices per source.
///
/// Safe to share across workers handling distinct sources; a single source
/// must have a single writer.
#[async_trait]
pub trait OffsetCache: Send + Sync {
    /// Hydrate state for `source_id` from `context` the first time the source
    /// is seen. Later calls for the same source do nothing.
    async fn load_if_needed(
        &self,
        context: &dyn OffsetContext,
        source_id: &str,
    ) -> Result<(), ConvertError>;

    /// Whether `line_index` has not been marked processed yet.
    fn should_process(&self, source_id: &str, line_index: LineIndex) -> bool;

    /// Record that `line_index` was handed off. Marking twice is a no-op.
    fn mark_processed(&self, source_id: &str, line_index: LineIndex);

    /// Whether state survives between conversion passes over the same source.
    fn resumes(&self) -> bool {
        true
    }
}

/// Set of line indices kept as disjoint, non-adjacent inclusive ranges
/// keyed by range start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct LineRanges {
    ranges: BTreeMap<LineIndex, LineIndex>,
}

impl LineRanges {
    pub(crate) fn contains(&self, index: LineIndex) -> bool {
        self.ranges
            .range(..=index)
            .next_back()
            .is_some_and(|(_, &end)| index <= end)
    }

    /// Returns false when `index` was already present.
    pub(crate) fn insert(&mut self, index: LineIndex) -> bool {
        if self.contains(index) {
            return false;
        }
        let mut start = index;
        let mut end = index;
        if let Some((&s, &e)) = self.ranges.range(..index).next_back() {
            if e.checked_add(1) == Some(index) {
                start = s;
            }
        }
        if let Some(next) = index.checked_add(1) {
            if let Some(e) = self.ranges.remove(&next) {
                end = e;
            }
        }
        self.ranges.insert(start, end);
        true
    }

    /// Insert every index in `0..=last`.
    pub(crate) fn insert_through(&mut self, last: LineIndex) {
        let bound = last.saturating_add(1);
        let absorbed: Vec<LineIndex> = self.ranges.range(..=bound).map(|(&s, _)| s).collect();
        let mut end = last;
        for start in absorbed {
            if let Some(e) = self.ranges.remove(&start) {
                end = end.max(e);
            }
        }
        self.ranges.insert(0, end);
    }

    pub(crate) fn range_count(&self) -> usize {
        self.ranges.len()
    }
}

#[derive(Debug, Default)]
struct SourceState {
    loaded: bool,
    lines: LineRanges,
}

/// Offset cache that keeps processed-line state in memory for the lifetime
/// of the process.
#[derive(Debug, Default)]
pub struct InMemoryOffsetCache {
    sources: RwLock<HashMap<String, SourceState>>,
}

impl InMemoryOffsetCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, SourceState>> {
        self.sources.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, SourceState>> {
        self.sources.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl OffsetCache for InMemoryOffsetCache {
    async fn load_if_needed(
        &self,
        context: &dyn OffsetContext,
        source_id: &str,
    ) -> Result<(), ConvertError> {
        let loaded = self.read().get(source_id).is_some_and(|s| s.loaded);
        if loaded {
            return Ok(());
        }

        let committed = context.committed_offset(source_id).await?;

        let mut sources = self.write();
        let state = sources.entry(source_id.to_owned()).or_default();
        if state.loaded {
            return Ok(());
        }
        if let Some(last) = committed {
            state.lines.insert_through(last);
        }
        state.loaded = true;
        info!(source_id, ?committed, "offset cache hydrated");
        Ok(())
    }

    fn should_process(&self, source_id: &str, line_index: LineIndex) -> bool {
        !self
            .read()
            .get(source_id)
            .is_some_and(|s| s.lines.contains(line_index))
    }

    fn mark_processed(&self, source_id: &str, line_index: LineIndex) {
        let mut sources = self.write();
        let state = sources.entry(source_id.to_owned()).or_default();
        if state.lines.insert(line_index) {
            debug!(source_id, line_index, "line marked processed");
        }
    }
}

/// Offset cache for callers that never resume: every line is processed and
/// nothing is remembered.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassThroughOffsetCache;

#[async_trait]
impl OffsetCache for PassThroughOffsetCache {
    async fn load_if_needed(
        &self,
        _context: &dyn OffsetContext,
        _source_id: &str,
    ) -> Result<(), ConvertError> {
        Ok(())
    }

    fn should_process(&self, _source_id: &str, _line_index: LineIndex) -> bool {
        true
    }

    fn mark_processed(&self, _source_id: &str, _line_index: LineIndex) {}

    fn resumes(&self) -> bool {
        false
    }
}

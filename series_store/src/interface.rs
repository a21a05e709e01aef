//! Interfaces of the collaborators the store is wired to.

use crate::Result;
use async_trait::async_trait;
use data_types::{Chunk, ChunkRef, IndexQuery, Labels, ShardAnnotation, Time};
use std::fmt::Debug;

/// An index row decoded by the [`Schema`].
///
/// For series-index rows `chunk_key` carries the series ID; for chunk-index
/// rows it carries the external chunk key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedIndexEntry {
    /// The chunk key (or series ID) carried by the row.
    pub chunk_key: String,
    /// The label value carried by the row.
    pub label_value: String,
}

/// Knows how index queries are encoded for a given time range and how the
/// returned rows decode.
pub trait Schema: Debug + Send + Sync {
    /// Queries returning every series of `metric_name`.
    fn get_read_queries_for_metric(
        &self,
        from: Time,
        through: Time,
        tenant: &str,
        metric_name: &str,
    ) -> Result<Vec<IndexQuery>>;

    /// Queries returning every series of `metric_name` carrying
    /// `label_name`, with any value.
    fn get_read_queries_for_metric_label(
        &self,
        from: Time,
        through: Time,
        tenant: &str,
        metric_name: &str,
        label_name: &str,
    ) -> Result<Vec<IndexQuery>>;

    /// Queries returning every series of `metric_name` where `label_name`
    /// equals `label_value`.
    fn get_read_queries_for_metric_label_value(
        &self,
        from: Time,
        through: Time,
        tenant: &str,
        metric_name: &str,
        label_name: &str,
        label_value: &str,
    ) -> Result<Vec<IndexQuery>>;

    /// Queries returning the chunk keys of one series.
    fn get_chunks_for_series(
        &self,
        from: Time,
        through: Time,
        tenant: &str,
        series_id: &str,
    ) -> Result<Vec<IndexQuery>>;

    /// Queries returning the label names recorded for one series. Schemas
    /// without a label-name index answer [`crate::Error::NotSupported`].
    fn get_label_names_for_series(
        &self,
        from: Time,
        through: Time,
        tenant: &str,
        series_id: &str,
    ) -> Result<Vec<IndexQuery>>;

    /// Restrict `queries` to the given shard, if any.
    fn filter_read_queries(
        &self,
        queries: Vec<IndexQuery>,
        shard: Option<&ShardAnnotation>,
    ) -> Vec<IndexQuery>;

    /// Decode the opaque range/value bytes of one index row.
    fn parse_index_entry(&self, range_value: &[u8], value: &[u8]) -> Result<ParsedIndexEntry>;
}

/// One page of rows returned for an [`IndexQuery`].
pub trait ReadBatch: Send + Sync {
    /// Iterate the `(range_value, value)` rows of this page.
    fn rows(&self) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>;
}

/// Per-page callback handed to [`IndexClient::query_pages`]. Returning
/// `false` stops the scan. The client may invoke it concurrently from
/// multiple workers.
pub type QueryPagesCallback<'a> = &'a (dyn Fn(&IndexQuery, &dyn ReadBatch) -> bool + Send + Sync);

/// Paginated range scans against the backing key-range index.
#[async_trait]
pub trait IndexClient: Debug + Send + Sync {
    /// Stream the rows matching `queries`, invoking `callback` once per
    /// response page.
    async fn query_pages(
        &self,
        queries: Vec<IndexQuery>,
        callback: QueryPagesCallback<'_>,
    ) -> Result<()>;
}

/// Materializes chunks (with their label sets) from the chunk backing store.
#[async_trait]
pub trait ChunkFetcher: Debug + Send + Sync {
    /// Fetch the given chunks. `keys` are the external keys of `chunks` in
    /// matching order, sorted ascending; batched cache lookups rely on that
    /// order.
    async fn fetch_chunks(&self, chunks: Vec<ChunkRef>, keys: Vec<String>) -> Result<Vec<Chunk>>;
}

/// A per-request series filter applied during series materialization.
pub trait Filterer: Send + Sync {
    /// Whether the series carrying `labels` should be dropped.
    fn should_filter(&self, labels: &Labels) -> bool;
}

/// Creates a [`Filterer`] bound to one request, so per-request state can be
/// captured once per call.
pub trait ChunkFiltererFactory: Send + Sync {
    /// Called once per series request.
    fn for_request(&self) -> Box<dyn Filterer>;
}

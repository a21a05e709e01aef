//! Reference collaborator implementations for testing the store.
//!
//! The production schema/index pair is replaced by an in-memory index keyed
//! by hash value, with a trivial range-value encoding: the label value and
//! the chunk key separated by a NUL byte. Chunks are served from a map keyed
//! by external chunk key.

use crate::{
    interface::{
        ChunkFetcher, ChunkFiltererFactory, Filterer, IndexClient, ParsedIndexEntry,
        QueryPagesCallback, ReadBatch, Schema,
    },
    Error, Result,
};
use async_trait::async_trait;
use data_types::{Chunk, ChunkRef, IndexQuery, Labels, ShardAnnotation, Time};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

/// The single table used by [`TestSchema`] queries.
pub const TEST_TABLE: &str = "index";

const RANGE_SEPARATOR: u8 = 0;

/// Encode a range value the way [`TestSchema`] decodes it.
pub fn encode_range_value(label_value: &str, chunk_key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(label_value.len() + 1 + chunk_key.len());
    out.extend_from_slice(label_value.as_bytes());
    out.push(RANGE_SEPARATOR);
    out.extend_from_slice(chunk_key.as_bytes());
    out
}

/// Schema adapter over the in-memory test index.
///
/// Hash values are plain joined strings (`tenant:metric`,
/// `tenant:metric:label`, `tenant:chunks:series`, `tenant:labelnames:series`)
/// so tests can seed [`TestIndexClient`] rows directly.
#[derive(Debug)]
pub struct TestSchema {
    label_names_supported: Mutex<bool>,
    last_shard: Mutex<Option<ShardAnnotation>>,
}

impl Default for TestSchema {
    fn default() -> Self {
        Self {
            label_names_supported: Mutex::new(true),
            last_shard: Mutex::new(None),
        }
    }
}

impl TestSchema {
    /// Make [`Schema::get_label_names_for_series`] answer
    /// [`Error::NotSupported`].
    pub fn set_label_names_supported(&self, supported: bool) {
        *self.label_names_supported.lock() = supported;
    }

    /// The shard handed to the most recent
    /// [`Schema::filter_read_queries`] call.
    pub fn last_shard(&self) -> Option<ShardAnnotation> {
        *self.last_shard.lock()
    }

    fn query(hash_value: String) -> IndexQuery {
        IndexQuery {
            table_name: TEST_TABLE.to_string(),
            hash_value,
            ..Default::default()
        }
    }
}

impl Schema for TestSchema {
    fn get_read_queries_for_metric(
        &self,
        _from: Time,
        _through: Time,
        tenant: &str,
        metric_name: &str,
    ) -> Result<Vec<IndexQuery>> {
        Ok(vec![Self::query(format!("{}:{}", tenant, metric_name))])
    }

    fn get_read_queries_for_metric_label(
        &self,
        _from: Time,
        _through: Time,
        tenant: &str,
        metric_name: &str,
        label_name: &str,
    ) -> Result<Vec<IndexQuery>> {
        Ok(vec![Self::query(format!(
            "{}:{}:{}",
            tenant, metric_name, label_name
        ))])
    }

    fn get_read_queries_for_metric_label_value(
        &self,
        _from: Time,
        _through: Time,
        tenant: &str,
        metric_name: &str,
        label_name: &str,
        label_value: &str,
    ) -> Result<Vec<IndexQuery>> {
        let mut query = Self::query(format!("{}:{}:{}", tenant, metric_name, label_name));
        query.value_equal = Some(label_value.as_bytes().to_vec());
        Ok(vec![query])
    }

    fn get_chunks_for_series(
        &self,
        _from: Time,
        _through: Time,
        tenant: &str,
        series_id: &str,
    ) -> Result<Vec<IndexQuery>> {
        Ok(vec![Self::query(format!("{}:chunks:{}", tenant, series_id))])
    }

    fn get_label_names_for_series(
        &self,
        _from: Time,
        _through: Time,
        tenant: &str,
        series_id: &str,
    ) -> Result<Vec<IndexQuery>> {
        if !*self.label_names_supported.lock() {
            return Err(Error::NotSupported);
        }
        Ok(vec![Self::query(format!(
            "{}:labelnames:{}",
            tenant, series_id
        ))])
    }

    fn filter_read_queries(
        &self,
        queries: Vec<IndexQuery>,
        shard: Option<&ShardAnnotation>,
    ) -> Vec<IndexQuery> {
        *self.last_shard.lock() = shard.copied();
        queries
    }

    fn parse_index_entry(&self, range_value: &[u8], _value: &[u8]) -> Result<ParsedIndexEntry> {
        let separator = range_value
            .iter()
            .position(|b| *b == RANGE_SEPARATOR)
            .ok_or_else(|| Error::MalformedIndexEntry {
                reason: "missing range separator".to_string(),
            })?;
        let label_value = std::str::from_utf8(&range_value[..separator]).map_err(|_| {
            Error::MalformedIndexEntry {
                reason: "label value is not utf-8".to_string(),
            }
        })?;
        let chunk_key = std::str::from_utf8(&range_value[separator + 1..]).map_err(|_| {
            Error::MalformedIndexEntry {
                reason: "chunk key is not utf-8".to_string(),
            }
        })?;
        Ok(ParsedIndexEntry {
            chunk_key: chunk_key.to_string(),
            label_value: label_value.to_string(),
        })
    }
}

/// In-memory index client serving rows seeded per hash value.
#[derive(Debug, Default)]
pub struct TestIndexClient {
    rows: Mutex<HashMap<String, Vec<(Vec<u8>, Vec<u8>)>>>,
    cardinality_failures: Mutex<HashSet<String>>,
}

impl TestIndexClient {
    /// Seed one `(range_value, value)` row under `hash_value`.
    pub fn insert(&self, hash_value: impl Into<String>, range_value: Vec<u8>, value: Vec<u8>) {
        self.rows
            .lock()
            .entry(hash_value.into())
            .or_default()
            .push((range_value, value));
    }

    /// Make any query against `hash_value` fail with
    /// [`Error::CardinalityExceeded`].
    pub fn fail_with_cardinality_exceeded(&self, hash_value: impl Into<String>) {
        self.cardinality_failures.lock().insert(hash_value.into());
    }
}

struct TestReadBatch {
    rows: Vec<(Vec<u8>, Vec<u8>)>,
}

impl ReadBatch for TestReadBatch {
    fn rows(&self) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_> {
        Box::new(self.rows.iter().cloned())
    }
}

#[async_trait]
impl IndexClient for TestIndexClient {
    async fn query_pages(
        &self,
        queries: Vec<IndexQuery>,
        callback: QueryPagesCallback<'_>,
    ) -> Result<()> {
        for query in &queries {
            if self.cardinality_failures.lock().contains(&query.hash_value) {
                return Err(Error::CardinalityExceeded {
                    metric_name: String::new(),
                    label_name: String::new(),
                });
            }
            let rows: Vec<_> = self
                .rows
                .lock()
                .get(&query.hash_value)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter(|(range_value, _)| match &query.range_value_prefix {
                    Some(prefix) => range_value.starts_with(prefix),
                    None => true,
                })
                .filter(|(_, value)| match &query.value_equal {
                    Some(expected) => value == expected,
                    None => true,
                })
                .collect();
            let batch = TestReadBatch { rows };
            if !callback(query, &batch) {
                return Ok(());
            }
        }
        Ok(())
    }
}

/// In-memory chunk fetcher keyed by external chunk key, recording the key
/// list of every fetch call.
#[derive(Debug, Default)]
pub struct TestChunkFetcher {
    chunks: Mutex<HashMap<String, Chunk>>,
    fetch_calls: Mutex<Vec<Vec<String>>>,
}

impl TestChunkFetcher {
    /// Register a materialized chunk under its external key.
    pub fn insert(&self, chunk: Chunk) {
        let key = chunk.chunk_ref.external_key();
        self.chunks.lock().insert(key, chunk);
    }

    /// The key lists of all fetch calls so far, in call order.
    pub fn fetch_calls(&self) -> Vec<Vec<String>> {
        self.fetch_calls.lock().clone()
    }
}

#[async_trait]
impl ChunkFetcher for TestChunkFetcher {
    async fn fetch_chunks(&self, _chunks: Vec<ChunkRef>, keys: Vec<String>) -> Result<Vec<Chunk>> {
        self.fetch_calls.lock().push(keys.clone());
        let known = self.chunks.lock();
        keys.iter()
            .map(|key| {
                known.get(key).cloned().ok_or_else(|| Error::Fetcher {
                    source: format!("unknown chunk key {:?}", key).into(),
                })
            })
            .collect()
    }
}

/// Filterer factory dropping every series carrying a given label pair.
#[derive(Debug, Clone)]
pub struct DropLabelFiltererFactory {
    name: String,
    value: String,
}

impl DropLabelFiltererFactory {
    #[allow(missing_docs)]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl ChunkFiltererFactory for DropLabelFiltererFactory {
    fn for_request(&self) -> Box<dyn Filterer> {
        Box::new(self.clone())
    }
}

impl Filterer for DropLabelFiltererFactory {
    fn should_filter(&self, labels: &Labels) -> bool {
        labels.get(&self.name) == Some(self.value.as_str())
    }
}

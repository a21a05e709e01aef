//! The series store: matcher fanout, intersection and series
//! materialization against the backing chunk index.

use crate::{
    error::{InvalidChunkKeySnafu, InvalidShardSnafu, LabelNamesDecodeSnafu, MissingMetricNameSnafu},
    interface::{ChunkFetcher, ChunkFiltererFactory, IndexClient, ReadBatch, Schema},
    metrics::SeriesStoreMetrics,
    pool::{shared_entry_pool, EntryPool, PooledEntries},
    set_matcher::literal_set,
    Error, Result,
};
use data_types::{
    ChunkRef, IndexEntry, IndexQuery, Labels, MatchType, Matcher, ShardAnnotation, Time,
    METRIC_NAME_LABEL, SHARD_LABEL,
};
use futures::future::join_all;
use observability_deps::tracing::{debug, error, warn};
use parking_lot::{Mutex, RwLock};
use snafu::ResultExt;
use std::{
    cmp::Ordering,
    collections::{BTreeSet, HashSet},
    fmt,
    sync::Arc,
};

/// Store tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct SeriesStoreConfig {
    /// How many chunks are handed to the fetcher per batch during series
    /// materialization.
    pub chunk_batch_size: usize,
}

impl Default for SeriesStoreConfig {
    fn default() -> Self {
        Self {
            chunk_batch_size: 50,
        }
    }
}

/// Resolves series queries to chunk references, series label sets and label
/// name/value enumerations.
pub struct SeriesStore {
    config: SeriesStoreConfig,
    schema: Arc<dyn Schema>,
    index_client: Arc<dyn IndexClient>,
    fetcher: Arc<dyn ChunkFetcher>,
    chunk_filterer: RwLock<Option<Arc<dyn ChunkFiltererFactory>>>,
    entry_pool: Arc<EntryPool>,
    metrics: SeriesStoreMetrics,
}

impl fmt::Debug for SeriesStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeriesStore")
            .field("config", &self.config)
            .field("schema", &self.schema)
            .finish()
    }
}

impl SeriesStore {
    /// Wire a store to its collaborators.
    pub fn new(
        config: SeriesStoreConfig,
        schema: Arc<dyn Schema>,
        index_client: Arc<dyn IndexClient>,
        fetcher: Arc<dyn ChunkFetcher>,
        metrics: SeriesStoreMetrics,
    ) -> Self {
        Self {
            config,
            schema,
            index_client,
            fetcher,
            chunk_filterer: RwLock::new(None),
            entry_pool: shared_entry_pool(),
            metrics,
        }
    }

    #[cfg(test)]
    fn with_entry_pool(mut self, entry_pool: Arc<EntryPool>) -> Self {
        self.entry_pool = entry_pool;
        self
    }

    /// Install the per-request series filter factory. Must be called during
    /// initialization, before the store serves requests.
    pub fn set_chunk_filterer(&self, filterer: Arc<dyn ChunkFiltererFactory>) {
        *self.chunk_filterer.write() = Some(filterer);
    }

    /// Resolve `matchers` to the references of all chunks overlapping
    /// `[from, through]`.
    ///
    /// `matchers` must contain an equality matcher on the metric name.
    /// Matchers the index cannot answer (those matching an absent label) are
    /// not applied here; they participate in residual matching during
    /// [`Self::get_series`].
    pub async fn get_chunk_refs(
        &self,
        tenant: &str,
        from: Time,
        through: Time,
        matchers: &[Matcher],
    ) -> Result<Vec<ChunkRef>> {
        debug!(tenant, %from, %through, matchers = matchers.len(), "resolving chunk refs");
        let (metric_name, rest) = extract_metric_name_matcher(matchers)?;
        let (_filters, index_matchers) = split_filters_and_matchers(&rest);

        let series_ids = self
            .lookup_series_by_metric_name_matchers(
                tenant,
                from,
                through,
                &metric_name,
                &index_matchers,
            )
            .await?;
        debug!(%metric_name, series = series_ids.len(), "series resolved");

        let chunk_keys = self
            .lookup_chunks_by_series(tenant, from, through, &series_ids)
            .await?;

        let mut chunk_refs = Vec::with_capacity(chunk_keys.len());
        for key in &chunk_keys {
            let chunk_ref =
                ChunkRef::parse_external_key(tenant, key).context(InvalidChunkKeySnafu)?;
            if chunk_ref.overlaps(from, through) {
                chunk_refs.push(chunk_ref);
            }
        }
        self.metrics.chunks_per_query.observe(chunk_refs.len() as f64);
        Ok(chunk_refs)
    }

    /// Resolve `matchers` to the distinct series label sets overlapping
    /// `[from, through]`, sorted by label-set order. The metric-name label
    /// is stripped from every returned set.
    pub async fn get_series(
        &self,
        tenant: &str,
        from: Time,
        through: Time,
        matchers: &[Matcher],
    ) -> Result<Vec<Labels>> {
        let chunk_refs = self.get_chunk_refs(tenant, from, through, matchers).await?;
        self.chunks_to_series(chunk_refs, matchers).await
    }

    /// All label names recorded for `metric_name` in `[from, through]`,
    /// sorted. Falls back to scanning one chunk per series when the schema
    /// has no label-name index.
    pub async fn label_names_for_metric_name(
        &self,
        tenant: &str,
        from: Time,
        through: Time,
        metric_name: &str,
    ) -> Result<Vec<String>> {
        debug!(tenant, metric_name, "resolving label names");
        let series_ids = self
            .lookup_series_by_metric_name_matchers(tenant, from, through, metric_name, &[])
            .await?;

        let mut queries = Vec::new();
        for series_id in &series_ids {
            match self
                .schema
                .get_label_names_for_series(from, through, tenant, series_id)
            {
                Ok(series_queries) => queries.extend(series_queries),
                Err(Error::NotSupported) => {
                    return self
                        .label_names_by_chunks(tenant, from, through, &series_ids)
                        .await;
                }
                Err(e) => return Err(e),
            }
        }

        let entries = self.lookup_entries_by_queries(queries).await?;
        let mut names = BTreeSet::new();
        for entry in &*entries {
            let decoded: Vec<String> =
                serde_json::from_slice(&entry.value).context(LabelNamesDecodeSnafu)?;
            names.extend(decoded);
        }
        Ok(names.into_iter().collect())
    }

    /// All values of `label_name` on series of `metric_name` in
    /// `[from, through]`, sorted and unique. With `matchers`, only values
    /// observed on matching series are returned.
    pub async fn label_values_for_metric_name(
        &self,
        tenant: &str,
        from: Time,
        through: Time,
        metric_name: &str,
        label_name: &str,
        matchers: &[Matcher],
    ) -> Result<Vec<String>> {
        debug!(
            tenant,
            metric_name,
            label_name,
            matchers = matchers.len(),
            "resolving label values"
        );
        let series_filter = if matchers.is_empty() {
            None
        } else {
            let series_ids = self
                .lookup_series_by_metric_name_matchers(tenant, from, through, metric_name, matchers)
                .await?;
            Some(series_ids.into_iter().collect::<HashSet<_>>())
        };

        let queries = self.schema.get_read_queries_for_metric_label(
            from,
            through,
            tenant,
            metric_name,
            label_name,
        )?;
        let entries = self.lookup_entries_by_queries(queries).await?;

        let mut values = BTreeSet::new();
        for entry in &*entries {
            let parsed = self
                .schema
                .parse_index_entry(&entry.range_value, &entry.value)?;
            if let Some(series_ids) = &series_filter {
                if !series_ids.contains(&parsed.chunk_key) {
                    continue;
                }
            }
            values.insert(parsed.label_value);
        }
        Ok(values.into_iter().collect())
    }

    /// Series IDs of `metric_name` satisfying every matcher, sorted and
    /// unique.
    async fn lookup_series_by_metric_name_matchers(
        &self,
        tenant: &str,
        from: Time,
        through: Time,
        metric_name: &str,
        matchers: &[Matcher],
    ) -> Result<Vec<String>> {
        let (shard, matchers) = extract_shard_matcher(matchers)?;

        if matchers.is_empty() {
            let queries =
                self.schema
                    .get_read_queries_for_metric(from, through, tenant, metric_name)?;
            let queries = self.schema.filter_read_queries(queries, shard.as_ref());
            let entries = self.lookup_entries_by_queries(queries).await?;
            let ids = parse_index_entries(self.schema.as_ref(), &entries, None)?;
            self.metrics.index_lookups_per_query.observe(1.0);
            return Ok(ids);
        }

        let outcomes = join_all(matchers.iter().map(|matcher| {
            self.lookup_ids_by_matcher(tenant, from, through, metric_name, matcher, shard)
        }))
        .await;

        let mut ids: Option<Vec<String>> = None;
        let mut pre_intersection_count = 0usize;
        let mut last_err = None;
        let mut last_cardinality_err = None;
        let mut cardinality_exceeded_errors = 0usize;
        for outcome in outcomes {
            match outcome {
                Ok(matcher_ids) => {
                    pre_intersection_count += matcher_ids.len();
                    ids = Some(match ids.take() {
                        Some(acc) => intersect(acc, matcher_ids),
                        None => matcher_ids,
                    });
                }
                Err(e) if e.is_cardinality_exceeded() => {
                    cardinality_exceeded_errors += 1;
                    last_cardinality_err = Some(e);
                }
                Err(e) => last_err = Some(e),
            }
        }

        // Only give up when every matcher ran into the cardinality bound:
        // one bounded result is enough for downstream filtering.
        if cardinality_exceeded_errors == matchers.len() {
            if let Some(e) = last_cardinality_err {
                warn!(%e, "cardinality limit exceeded for every matcher");
                return Err(e);
            }
        }
        if let Some(e) = last_err {
            return Err(e);
        }

        let ids = ids.unwrap_or_default();
        self.metrics
            .index_lookups_per_query
            .observe(matchers.len() as f64);
        self.metrics
            .series_pre_intersection_per_query
            .observe(pre_intersection_count as f64);
        self.metrics
            .series_post_intersection_per_query
            .observe(ids.len() as f64);
        debug!(metric_name, series = ids.len(), "matcher intersection complete");
        Ok(ids)
    }

    /// One fanout branch: the series IDs satisfying a single matcher.
    async fn lookup_ids_by_matcher(
        &self,
        tenant: &str,
        from: Time,
        through: Time,
        metric_name: &str,
        matcher: &Matcher,
        shard: Option<ShardAnnotation>,
    ) -> Result<Vec<String>> {
        let queries = match matcher.match_type {
            MatchType::Eq => self.schema.get_read_queries_for_metric_label_value(
                from,
                through,
                tenant,
                metric_name,
                &matcher.name,
                &matcher.value,
            )?,
            _ => self.schema.get_read_queries_for_metric_label(
                from,
                through,
                tenant,
                metric_name,
                &matcher.name,
            )?,
        };
        let queries = self.schema.filter_read_queries(queries, shard.as_ref());

        let entries = match self.lookup_entries_by_queries(queries).await {
            Ok(entries) => entries,
            Err(Error::CardinalityExceeded { .. }) => {
                return Err(Error::CardinalityExceeded {
                    metric_name: metric_name.to_string(),
                    label_name: matcher.name.clone(),
                })
            }
            Err(e) => return Err(e),
        };
        parse_index_entries(self.schema.as_ref(), &entries, Some(matcher))
    }

    /// Chunk keys of the given series, sorted and unique.
    async fn lookup_chunks_by_series(
        &self,
        tenant: &str,
        from: Time,
        through: Time,
        series_ids: &[String],
    ) -> Result<Vec<String>> {
        let mut queries = Vec::with_capacity(series_ids.len());
        for series_id in series_ids {
            queries.extend(
                self.schema
                    .get_chunks_for_series(from, through, tenant, series_id)?,
            );
        }
        let entries = self.lookup_entries_by_queries(queries).await?;
        parse_index_entries(self.schema.as_ref(), &entries, None)
    }

    /// Execute `queries` against the index client, collecting every row into
    /// a pooled buffer. The client may deliver pages concurrently; the
    /// buffer is guarded accordingly. The buffer travels back to the pool
    /// when the returned guard drops, on success and error paths alike.
    async fn lookup_entries_by_queries(
        &self,
        queries: Vec<IndexQuery>,
    ) -> Result<PooledEntries> {
        let entries = Arc::clone(&self.entry_pool).acquire();
        if queries.is_empty() {
            return Ok(entries);
        }

        let collected = Mutex::new(entries);
        let callback = |query: &IndexQuery, batch: &dyn ReadBatch| -> bool {
            let mut entries = collected.lock();
            for (range_value, value) in batch.rows() {
                entries.push(IndexEntry {
                    table_name: query.table_name.clone(),
                    hash_value: query.hash_value.clone(),
                    range_value,
                    value,
                });
            }
            true
        };
        let result = self.index_client.query_pages(queries, &callback).await;
        let entries = collected.into_inner();
        if let Err(e) = result {
            error!(%e, "index client query failed");
            return Err(e);
        }
        Ok(entries)
    }

    /// Materialize distinct series label sets from chunk refs: one
    /// representative chunk per fingerprint, fetched in key-sorted batches,
    /// residual-matched and filtered, with the metric-name label stripped.
    async fn chunks_to_series(
        &self,
        chunk_refs: Vec<ChunkRef>,
        matchers: &[Matcher],
    ) -> Result<Vec<Labels>> {
        let mut seen = HashSet::with_capacity(chunk_refs.len());
        let mut keyed: Vec<(ChunkRef, String)> = Vec::with_capacity(chunk_refs.len());
        for chunk_ref in chunk_refs {
            if seen.insert(chunk_ref.fingerprint) {
                let key = chunk_ref.external_key();
                keyed.push((chunk_ref, key));
            }
        }

        let residual: Vec<&Matcher> = matchers
            .iter()
            .filter(|m| m.name != METRIC_NAME_LABEL && m.name != SHARD_LABEL)
            .collect();
        let filterer = {
            let factory = self.chunk_filterer.read().clone();
            factory.map(|factory| factory.for_request())
        };

        let batch_size = self.config.chunk_batch_size.max(1);
        let mut series = Vec::with_capacity(keyed.len());
        for batch in keyed.chunks(batch_size) {
            let mut batch = batch.to_vec();
            // The fetcher aligns batched cache lookups on ascending keys.
            batch.sort_by(|a, b| a.1.cmp(&b.1));
            let (chunks, keys): (Vec<ChunkRef>, Vec<String>) = batch.into_iter().unzip();

            let fetched = self.fetcher.fetch_chunks(chunks, keys).await?;
            'chunks: for chunk in fetched {
                for matcher in &residual {
                    let value = chunk.labels.get(&matcher.name).unwrap_or("");
                    if !matcher.matches(value) {
                        continue 'chunks;
                    }
                }
                if let Some(filterer) = &filterer {
                    if filterer.should_filter(&chunk.labels) {
                        continue;
                    }
                }
                series.push(chunk.labels.without(METRIC_NAME_LABEL));
            }
        }

        series.sort_unstable();
        series.dedup();
        Ok(series)
    }

    /// Label-name resolution without a label-name index: scan one chunk per
    /// series fingerprint and union the label names observed on the fetched
    /// label sets.
    async fn label_names_by_chunks(
        &self,
        tenant: &str,
        from: Time,
        through: Time,
        series_ids: &[String],
    ) -> Result<Vec<String>> {
        debug!(series = series_ids.len(), "label names via chunk scan");
        let chunk_keys = self
            .lookup_chunks_by_series(tenant, from, through, series_ids)
            .await?;

        let mut seen = HashSet::new();
        let mut keyed: Vec<(ChunkRef, String)> = Vec::new();
        for key in &chunk_keys {
            let chunk_ref =
                ChunkRef::parse_external_key(tenant, key).context(InvalidChunkKeySnafu)?;
            if !chunk_ref.overlaps(from, through) {
                continue;
            }
            if seen.insert(chunk_ref.fingerprint) {
                let key = chunk_ref.external_key();
                keyed.push((chunk_ref, key));
            }
        }
        if keyed.is_empty() {
            return Ok(vec![]);
        }
        keyed.sort_by(|a, b| a.1.cmp(&b.1));
        let (chunks, keys): (Vec<ChunkRef>, Vec<String>) = keyed.into_iter().unzip();

        let fetched = self.fetcher.fetch_chunks(chunks, keys).await?;
        let mut names = BTreeSet::new();
        for chunk in fetched {
            for label in &chunk.labels {
                names.insert(label.name.clone());
            }
        }
        Ok(names.into_iter().collect())
    }
}

/// Decode index entries into the chunk keys accepted by `matcher`, sorted
/// and unique.
///
/// A regexp matcher equivalent to a finite alternation of literals is
/// evaluated by set membership; the compiled regexp is never consulted for
/// such patterns.
fn parse_index_entries(
    schema: &dyn Schema,
    entries: &[IndexEntry],
    matcher: Option<&Matcher>,
) -> Result<Vec<String>> {
    if entries.is_empty() {
        return Ok(vec![]);
    }

    let literal_values: Option<HashSet<String>> = match matcher {
        Some(m) if m.match_type == MatchType::Re => {
            literal_set(&m.value).map(|values| values.into_iter().collect())
        }
        _ => None,
    };
    let literal_values = literal_values.filter(|values| !values.is_empty());

    let mut ids = Vec::with_capacity(entries.len());
    for entry in entries {
        let parsed = schema.parse_index_entry(&entry.range_value, &entry.value)?;
        let accepted = if let Some(values) = &literal_values {
            values.contains(&parsed.label_value)
        } else if let Some(matcher) = matcher {
            matcher.matches(&parsed.label_value)
        } else {
            true
        };
        if accepted {
            ids.push(parsed.chunk_key);
        }
    }
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}

/// Find the mandatory metric-name equality matcher and return its value
/// along with the remaining matchers.
fn extract_metric_name_matcher(matchers: &[Matcher]) -> Result<(String, Vec<Matcher>)> {
    match matchers.iter().position(|m| m.name == METRIC_NAME_LABEL) {
        Some(idx) if matchers[idx].match_type == MatchType::Eq => {
            let metric_name = matchers[idx].value.clone();
            let rest = matchers
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != idx)
                .map(|(_, m)| m.clone())
                .collect();
            Ok((metric_name, rest))
        }
        _ => MissingMetricNameSnafu.fail(),
    }
}

/// Pull the shard annotation out of the matcher set, if present.
fn extract_shard_matcher(
    matchers: &[Matcher],
) -> Result<(Option<ShardAnnotation>, Vec<Matcher>)> {
    let mut shard = None;
    let mut rest = Vec::with_capacity(matchers.len());
    for matcher in matchers {
        if matcher.name == SHARD_LABEL {
            shard = Some(ShardAnnotation::parse(&matcher.value).context(InvalidShardSnafu)?);
        } else {
            rest.push(matcher.clone());
        }
    }
    Ok((shard, rest))
}

/// Split matchers into those the index cannot answer (they match an absent
/// label, so index rows never rule them out) and those it can.
fn split_filters_and_matchers(matchers: &[Matcher]) -> (Vec<Matcher>, Vec<Matcher>) {
    let mut filters = Vec::new();
    let mut index_matchers = Vec::new();
    for matcher in matchers {
        if matcher.matches("") {
            filters.push(matcher.clone());
        } else {
            index_matchers.push(matcher.clone());
        }
    }
    (filters, index_matchers)
}

/// Linear merge intersection of two sorted, duplicate-free ID lists.
fn intersect(left: Vec<String>, right: Vec<String>) -> Vec<String> {
    let mut out = Vec::with_capacity(left.len().min(right.len()));
    let mut right_iter = right.into_iter().peekable();
    for item in left {
        while let Some(candidate) = right_iter.peek() {
            match candidate.as_str().cmp(item.as_str()) {
                Ordering::Less => {
                    right_iter.next();
                }
                Ordering::Equal => {
                    out.push(item);
                    right_iter.next();
                    break;
                }
                Ordering::Greater => break,
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{
        encode_range_value, DropLabelFiltererFactory, TestChunkFetcher, TestIndexClient,
        TestSchema,
    };
    use assert_matches::assert_matches;
    use data_types::{Chunk, Fingerprint};
    use prometheus::Registry;

    const TENANT: &str = "tenant1";

    struct TestStore {
        schema: Arc<TestSchema>,
        index: Arc<TestIndexClient>,
        fetcher: Arc<TestChunkFetcher>,
        pool: Arc<EntryPool>,
        store: SeriesStore,
    }

    fn test_store() -> TestStore {
        test_store_with_config(SeriesStoreConfig::default())
    }

    fn test_store_with_config(config: SeriesStoreConfig) -> TestStore {
        let schema = Arc::new(TestSchema::default());
        let index = Arc::new(TestIndexClient::default());
        let fetcher = Arc::new(TestChunkFetcher::default());
        let pool = Arc::new(EntryPool::new(16));
        let schema_dyn: Arc<dyn Schema> = Arc::clone(&schema) as Arc<dyn Schema>;
        let index_dyn: Arc<dyn IndexClient> = Arc::clone(&index) as Arc<dyn IndexClient>;
        let fetcher_dyn: Arc<dyn ChunkFetcher> = Arc::clone(&fetcher) as Arc<dyn ChunkFetcher>;
        let store = SeriesStore::new(
            config,
            schema_dyn,
            index_dyn,
            fetcher_dyn,
            SeriesStoreMetrics::new(&Registry::new()),
        )
        .with_entry_pool(Arc::clone(&pool));
        TestStore {
            schema,
            index,
            fetcher,
            pool,
            store,
        }
    }

    fn t(millis: i64) -> Time {
        Time::from_millis(millis)
    }

    fn chunk_ref(fingerprint: u64, from: i64, through: i64) -> ChunkRef {
        ChunkRef {
            tenant: TENANT.to_string(),
            fingerprint: Fingerprint::new(fingerprint),
            from: t(from),
            through: t(through),
            checksum: (from as u32) ^ (through as u32),
        }
    }

    fn matcher(match_type: MatchType, name: &str, value: &str) -> Matcher {
        Matcher::new(match_type, name, value).unwrap()
    }

    fn eq(name: &str, value: &str) -> Matcher {
        Matcher::equal(name, value)
    }

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        Labels::from_pairs(pairs.iter().copied())
    }

    /// Register a series: its metric row, one row per label, and its chunk
    /// rows.
    fn add_series(
        fx: &TestStore,
        metric: &str,
        series_id: &str,
        label_pairs: &[(&str, &str)],
        chunks: &[ChunkRef],
    ) {
        fx.index.insert(
            format!("{}:{}", TENANT, metric),
            encode_range_value("", series_id),
            vec![],
        );
        for (name, value) in label_pairs {
            fx.index.insert(
                format!("{}:{}:{}", TENANT, metric, name),
                encode_range_value(value, series_id),
                value.as_bytes().to_vec(),
            );
        }
        for chunk in chunks {
            fx.index.insert(
                format!("{}:chunks:{}", TENANT, series_id),
                encode_range_value("", &chunk.external_key()),
                vec![],
            );
        }
    }

    fn add_chunk(fx: &TestStore, chunk_ref: &ChunkRef, label_pairs: &[(&str, &str)]) {
        fx.fetcher.insert(Chunk {
            chunk_ref: chunk_ref.clone(),
            labels: labels(label_pairs),
        });
    }

    #[tokio::test]
    async fn get_chunk_refs_filters_by_time() {
        let fx = test_store();
        let c1 = chunk_ref(1, 50, 150);
        let c2 = chunk_ref(2, 180, 220);
        let c3 = chunk_ref(3, 300, 400);
        add_series(&fx, "logs", "s1", &[("job", "api")], &[c1.clone()]);
        add_series(&fx, "logs", "s2", &[("job", "api")], &[c2.clone()]);
        add_series(&fx, "logs", "s3", &[("job", "api")], &[c3]);

        let mut refs = fx
            .store
            .get_chunk_refs(
                TENANT,
                t(100),
                t(200),
                &[eq(METRIC_NAME_LABEL, "logs"), eq("job", "api")],
            )
            .await
            .unwrap();
        refs.sort_by_key(|r| r.fingerprint);
        assert_eq!(refs, vec![c1, c2]);

        let lookups = &fx.store.metrics.index_lookups_per_query;
        assert_eq!(lookups.get_sample_count(), 1);
        assert_eq!(lookups.get_sample_sum(), 1.0);
        assert_eq!(fx.store.metrics.chunks_per_query.get_sample_sum(), 2.0);
    }

    #[tokio::test]
    async fn matchers_intersect() {
        let fx = test_store();
        add_series(&fx, "logs", "s1", &[("job", "api")], &[]);
        add_series(&fx, "logs", "s2", &[("job", "api"), ("env", "prod")], &[]);
        add_series(&fx, "logs", "s3", &[("job", "api"), ("env", "prod")], &[]);
        add_series(&fx, "logs", "s4", &[("env", "prod")], &[]);

        let ids = fx
            .store
            .lookup_series_by_metric_name_matchers(
                TENANT,
                t(0),
                t(1000),
                "logs",
                &[eq("job", "api"), eq("env", "prod")],
            )
            .await
            .unwrap();
        assert_eq!(ids, vec!["s2", "s3"]);

        let metrics = &fx.store.metrics;
        assert_eq!(metrics.index_lookups_per_query.get_sample_sum(), 2.0);
        assert_eq!(
            metrics.series_pre_intersection_per_query.get_sample_sum(),
            6.0
        );
        assert_eq!(
            metrics.series_post_intersection_per_query.get_sample_sum(),
            2.0
        );
    }

    #[tokio::test]
    async fn partial_cardinality_failure_recovers() {
        let fx = test_store();
        add_series(&fx, "logs", "s2", &[("job", "api"), ("env", "prod")], &[]);
        add_series(&fx, "logs", "s3", &[("env", "prod")], &[]);
        fx.index
            .fail_with_cardinality_exceeded(format!("{}:logs:job", TENANT));

        let ids = fx
            .store
            .lookup_series_by_metric_name_matchers(
                TENANT,
                t(0),
                t(1000),
                "logs",
                &[eq("job", "api"), eq("env", "prod")],
            )
            .await
            .unwrap();
        assert_eq!(ids, vec!["s2", "s3"]);
    }

    #[tokio::test]
    async fn universal_cardinality_failure_surfaces() {
        let fx = test_store();
        fx.index
            .fail_with_cardinality_exceeded(format!("{}:logs:job", TENANT));
        fx.index
            .fail_with_cardinality_exceeded(format!("{}:logs:env", TENANT));

        let err = fx
            .store
            .lookup_series_by_metric_name_matchers(
                TENANT,
                t(0),
                t(1000),
                "logs",
                &[eq("job", "api"), eq("env", "prod")],
            )
            .await
            .unwrap_err();
        assert_matches!(
            err,
            Error::CardinalityExceeded {
                ref metric_name,
                ref label_name,
            } if metric_name == "logs" && label_name == "env"
        );
    }

    #[tokio::test]
    async fn regexp_set_matcher_takes_the_literal_shortcut() {
        let fx = test_store();
        add_series(&fx, "logs", "s1", &[("job", "api")], &[]);
        add_series(&fx, "logs", "s2", &[("job", "web")], &[]);
        add_series(&fx, "logs", "s3", &[("job", "db")], &[]);

        let ids = fx
            .store
            .lookup_series_by_metric_name_matchers(
                TENANT,
                t(0),
                t(1000),
                "logs",
                &[matcher(MatchType::Re, "job", "api|web")],
            )
            .await
            .unwrap();
        assert_eq!(ids, vec!["s1", "s2"]);
    }

    #[tokio::test]
    async fn regexp_matcher_falls_back_to_full_matching() {
        let fx = test_store();
        add_series(&fx, "logs", "s1", &[("job", "api")], &[]);
        add_series(&fx, "logs", "s2", &[("job", "web")], &[]);
        add_series(&fx, "logs", "s3", &[("job", "db")], &[]);

        let ids = fx
            .store
            .lookup_series_by_metric_name_matchers(
                TENANT,
                t(0),
                t(1000),
                "logs",
                &[matcher(MatchType::Re, "job", "api|d.")],
            )
            .await
            .unwrap();
        assert_eq!(ids, vec!["s1", "s3"]);
    }

    #[tokio::test]
    async fn get_series_applies_residual_matchers_and_strips_metric_name() {
        let fx = test_store();
        let c1 = chunk_ref(1, 100, 150);
        let c1b = chunk_ref(1, 120, 180);
        let c2 = chunk_ref(2, 100, 150);
        add_series(
            &fx,
            "logs",
            "s1",
            &[("job", "api"), ("env", "prod")],
            &[c1.clone(), c1b.clone()],
        );
        add_series(
            &fx,
            "logs",
            "s2",
            &[("job", "api"), ("env", "dev")],
            &[c2.clone()],
        );
        let prod = &[(METRIC_NAME_LABEL, "logs"), ("job", "api"), ("env", "prod")];
        let dev = &[(METRIC_NAME_LABEL, "logs"), ("job", "api"), ("env", "dev")];
        add_chunk(&fx, &c1, prod);
        add_chunk(&fx, &c1b, prod);
        add_chunk(&fx, &c2, dev);

        // `env != "dev"` matches absent labels, so the index cannot answer
        // it; it must be applied during materialization.
        let series = fx
            .store
            .get_series(
                TENANT,
                t(0),
                t(1000),
                &[
                    eq(METRIC_NAME_LABEL, "logs"),
                    eq("job", "api"),
                    matcher(MatchType::Neq, "env", "dev"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(series, vec![labels(&[("env", "prod"), ("job", "api")])]);

        // One fetch per distinct fingerprint.
        let fetched: usize = fx.fetcher.fetch_calls().iter().map(Vec::len).sum();
        assert_eq!(fetched, 2);
    }

    #[tokio::test]
    async fn get_series_applies_the_chunk_filterer() {
        let fx = test_store();
        let c1 = chunk_ref(1, 100, 150);
        let c2 = chunk_ref(2, 100, 150);
        add_series(&fx, "logs", "s1", &[("job", "api"), ("env", "prod")], &[c1.clone()]);
        add_series(&fx, "logs", "s2", &[("job", "api"), ("env", "dev")], &[c2.clone()]);
        add_chunk(
            &fx,
            &c1,
            &[(METRIC_NAME_LABEL, "logs"), ("job", "api"), ("env", "prod")],
        );
        add_chunk(
            &fx,
            &c2,
            &[(METRIC_NAME_LABEL, "logs"), ("job", "api"), ("env", "dev")],
        );

        fx.store
            .set_chunk_filterer(Arc::new(DropLabelFiltererFactory::new("env", "prod")));

        let series = fx
            .store
            .get_series(
                TENANT,
                t(0),
                t(1000),
                &[eq(METRIC_NAME_LABEL, "logs"), eq("job", "api")],
            )
            .await
            .unwrap();
        assert_eq!(series, vec![labels(&[("env", "dev"), ("job", "api")])]);
    }

    #[tokio::test]
    async fn missing_metric_name_matcher_is_rejected() {
        let fx = test_store();

        let err = fx
            .store
            .get_chunk_refs(TENANT, t(0), t(1000), &[eq("job", "api")])
            .await
            .unwrap_err();
        assert_matches!(err, Error::MissingMetricName);

        // A regexp matcher on the metric name is not good enough.
        let err = fx
            .store
            .get_chunk_refs(
                TENANT,
                t(0),
                t(1000),
                &[matcher(MatchType::Re, METRIC_NAME_LABEL, "logs")],
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::MissingMetricName);
    }

    #[tokio::test]
    async fn label_names_union_series_entries() {
        let fx = test_store();
        add_series(&fx, "logs", "s1", &[], &[]);
        add_series(&fx, "logs", "s2", &[], &[]);
        fx.index.insert(
            format!("{}:labelnames:{}", TENANT, "s1"),
            encode_range_value("", ""),
            br#"["__name__","job","env"]"#.to_vec(),
        );
        fx.index.insert(
            format!("{}:labelnames:{}", TENANT, "s2"),
            encode_range_value("", ""),
            br#"["__name__","job","instance"]"#.to_vec(),
        );

        let names = fx
            .store
            .label_names_for_metric_name(TENANT, t(0), t(1000), "logs")
            .await
            .unwrap();
        assert_eq!(names, vec!["__name__", "env", "instance", "job"]);
    }

    #[tokio::test]
    async fn label_names_fall_back_to_chunk_scan() {
        let fx = test_store();
        fx.schema.set_label_names_supported(false);
        let c1 = chunk_ref(1, 100, 150);
        add_series(&fx, "logs", "s1", &[("job", "api")], &[c1.clone()]);
        add_chunk(
            &fx,
            &c1,
            &[(METRIC_NAME_LABEL, "logs"), ("job", "api"), ("env", "prod")],
        );

        let names = fx
            .store
            .label_names_for_metric_name(TENANT, t(0), t(1000), "logs")
            .await
            .unwrap();
        // The chunk scan reports label names as observed, metric name
        // included.
        assert_eq!(names, vec![METRIC_NAME_LABEL, "env", "job"]);
    }

    #[tokio::test]
    async fn label_values_are_unique_and_sorted() {
        let fx = test_store();
        add_series(&fx, "logs", "s1", &[("job", "api")], &[]);
        add_series(&fx, "logs", "s2", &[("job", "web")], &[]);
        add_series(&fx, "logs", "s3", &[("job", "api")], &[]);

        let values = fx
            .store
            .label_values_for_metric_name(TENANT, t(0), t(1000), "logs", "job", &[])
            .await
            .unwrap();
        assert_eq!(values, vec!["api", "web"]);
    }

    #[tokio::test]
    async fn label_values_respect_matchers() {
        let fx = test_store();
        add_series(&fx, "logs", "s1", &[("job", "api"), ("env", "prod")], &[]);
        add_series(&fx, "logs", "s2", &[("job", "web"), ("env", "dev")], &[]);

        let values = fx
            .store
            .label_values_for_metric_name(
                TENANT,
                t(0),
                t(1000),
                "logs",
                "job",
                &[eq("env", "prod")],
            )
            .await
            .unwrap();
        assert_eq!(values, vec!["api"]);
    }

    #[tokio::test]
    async fn series_fetches_are_batched_and_key_sorted() {
        let fx = test_store_with_config(SeriesStoreConfig {
            chunk_batch_size: 2,
        });
        let c1 = chunk_ref(1, 100, 150);
        let c2 = chunk_ref(2, 100, 150);
        let c3 = chunk_ref(3, 100, 150);
        for (series_id, chunk) in [("s1", &c1), ("s2", &c2), ("s3", &c3)] {
            add_series(&fx, "logs", series_id, &[("job", "api")], &[chunk.clone()]);
            add_chunk(
                &fx,
                chunk,
                &[(METRIC_NAME_LABEL, "logs"), ("job", "api"), ("series", series_id)],
            );
        }

        let series = fx
            .store
            .get_series(
                TENANT,
                t(0),
                t(1000),
                &[eq(METRIC_NAME_LABEL, "logs"), eq("job", "api")],
            )
            .await
            .unwrap();
        assert_eq!(series.len(), 3);

        let calls = fx.fetcher.fetch_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].len(), 2);
        assert_eq!(calls[1].len(), 1);
        for keys in calls {
            let mut sorted = keys.clone();
            sorted.sort();
            assert_eq!(keys, sorted, "fetch keys must be sorted ascending");
        }
    }

    #[tokio::test]
    async fn pooled_buffers_return_on_success_and_error() {
        let fx = test_store();
        let c1 = chunk_ref(1, 100, 150);
        add_series(&fx, "logs", "s1", &[("job", "api")], &[c1]);

        fx.store
            .get_chunk_refs(
                TENANT,
                t(0),
                t(1000),
                &[eq(METRIC_NAME_LABEL, "logs"), eq("job", "api")],
            )
            .await
            .unwrap();
        assert_eq!(fx.pool.in_use(), 0);

        fx.index
            .fail_with_cardinality_exceeded(format!("{}:logs:job", TENANT));
        fx.store
            .get_chunk_refs(
                TENANT,
                t(0),
                t(1000),
                &[eq(METRIC_NAME_LABEL, "logs"), eq("job", "api")],
            )
            .await
            .unwrap_err();
        assert_eq!(fx.pool.in_use(), 0);
    }

    #[tokio::test]
    async fn empty_results_are_empty_lists() {
        let fx = test_store();

        let refs = fx
            .store
            .get_chunk_refs(TENANT, t(0), t(1000), &[eq(METRIC_NAME_LABEL, "logs")])
            .await
            .unwrap();
        assert!(refs.is_empty());

        let series = fx
            .store
            .get_series(TENANT, t(0), t(1000), &[eq(METRIC_NAME_LABEL, "logs")])
            .await
            .unwrap();
        assert!(series.is_empty());

        let names = fx
            .store
            .label_names_for_metric_name(TENANT, t(0), t(1000), "logs")
            .await
            .unwrap();
        assert!(names.is_empty());

        let values = fx
            .store
            .label_values_for_metric_name(TENANT, t(0), t(1000), "logs", "job", &[])
            .await
            .unwrap();
        assert!(values.is_empty());
    }

    #[tokio::test]
    async fn shard_matcher_is_extracted_for_the_schema() {
        let fx = test_store();
        add_series(&fx, "logs", "s1", &[("job", "api")], &[]);

        let ids = fx
            .store
            .lookup_series_by_metric_name_matchers(
                TENANT,
                t(0),
                t(1000),
                "logs",
                &[eq("job", "api"), eq(SHARD_LABEL, "0_of_2")],
            )
            .await
            .unwrap();
        assert_eq!(ids, vec!["s1"]);
        assert_eq!(
            fx.schema.last_shard(),
            Some(ShardAnnotation { shard: 0, of: 2 })
        );

        let err = fx
            .store
            .lookup_series_by_metric_name_matchers(
                TENANT,
                t(0),
                t(1000),
                "logs",
                &[eq(SHARD_LABEL, "bogus")],
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidShard { .. });
    }

    #[tokio::test]
    async fn corrupt_chunk_keys_are_fatal() {
        let fx = test_store();
        add_series(&fx, "logs", "s1", &[("job", "api")], &[]);
        fx.index.insert(
            format!("{}:chunks:{}", TENANT, "s1"),
            encode_range_value("", "not-a-chunk-key"),
            vec![],
        );

        let err = fx
            .store
            .get_chunk_refs(
                TENANT,
                t(0),
                t(1000),
                &[eq(METRIC_NAME_LABEL, "logs"), eq("job", "api")],
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidChunkKey { .. });
    }

    #[test]
    fn intersect_merges_sorted_lists() {
        let to_vec = |ids: &[&str]| ids.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(
            intersect(to_vec(&["s1", "s2", "s3"]), to_vec(&["s2", "s3", "s4"])),
            to_vec(&["s2", "s3"])
        );
        assert_eq!(
            intersect(to_vec(&["s1"]), to_vec(&["s2"])),
            Vec::<String>::new()
        );
        assert_eq!(intersect(to_vec(&[]), to_vec(&["s1"])), Vec::<String>::new());
    }

    #[test]
    fn filters_are_split_from_index_matchers() {
        let (filters, index_matchers) = split_filters_and_matchers(&[
            eq("job", "api"),
            matcher(MatchType::Neq, "env", "dev"),
            matcher(MatchType::Re, "job", ".*"),
            matcher(MatchType::Re, "job", "a.+"),
        ]);
        let names = |ms: &[Matcher]| {
            ms.iter()
                .map(|m| format!("{}", m))
                .collect::<Vec<_>>()
        };
        assert_eq!(names(&filters), vec![r#"env!="dev""#, r#"job=~".*""#]);
        assert_eq!(names(&index_matchers), vec![r#"job="api""#, r#"job=~"a.+""#]);
    }

    #[test]
    fn metric_name_matcher_is_extracted() {
        let (metric, rest) =
            extract_metric_name_matcher(&[eq("job", "api"), eq(METRIC_NAME_LABEL, "logs")])
                .unwrap();
        assert_eq!(metric, "logs");
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].name, "job");

        assert_matches!(
            extract_metric_name_matcher(&[eq("job", "api")]),
            Err(Error::MissingMetricName)
        );
    }
}

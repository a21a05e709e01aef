//! Shared data types for the chunk store.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr,
    clippy::future_not_send
)]

use regex::Regex;
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use std::fmt;

/// The label holding the metric name of a series.
pub const METRIC_NAME_LABEL: &str = "__name__";

/// The virtual label carrying a [`ShardAnnotation`] in a matcher set.
pub const SHARD_LABEL: &str = "__shard__";

/// Errors for malformed model values.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("invalid external chunk key {:?}", key))]
    InvalidChunkKey { key: String },

    #[snafu(display("external chunk key {:?} does not belong to tenant {:?}", key, tenant))]
    WrongChunkTenant { key: String, tenant: String },

    #[snafu(display("invalid shard annotation {:?}", value))]
    InvalidShardAnnotation { value: String },

    #[snafu(display("invalid regular expression {:?}: {}", pattern, source))]
    InvalidRegex {
        pattern: String,
        source: regex::Error,
    },
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A point in time, in milliseconds since the Unix epoch.
///
/// Query windows are the inclusive interval `[from, through]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time(i64);

impl Time {
    /// Construct from milliseconds since the epoch.
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Milliseconds since the epoch.
    pub fn millis(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A 64-bit stable hash of a label set, identifying a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(u64);

impl Fingerprint {
    /// Wrap a raw fingerprint value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw fingerprint value.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A single `(name, value)` label pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label {
    #[allow(missing_docs)]
    pub name: String,
    #[allow(missing_docs)]
    pub value: String,
}

impl Label {
    #[allow(missing_docs)]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A series label set: label pairs canonically sorted by name, with unique
/// names.
///
/// The derived ordering (lexicographic over the sorted pairs) is the
/// canonical total order for series.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Labels(Vec<Label>);

impl Labels {
    /// Build a label set from arbitrary pairs, sorting by name and
    /// deduplicating repeated names.
    pub fn new(mut labels: Vec<Label>) -> Self {
        labels.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.value.cmp(&b.value)));
        labels.dedup_by(|a, b| a.name == b.name);
        Self(labels)
    }

    /// Convenience constructor from string pairs.
    pub fn from_pairs<N: Into<String>, V: Into<String>>(pairs: impl IntoIterator<Item = (N, V)>) -> Self {
        Self::new(
            pairs
                .into_iter()
                .map(|(name, value)| Label::new(name, value))
                .collect(),
        )
    }

    /// The value of label `name`, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|label| label.name.as_str().cmp(name))
            .ok()
            .map(|idx| self.0[idx].value.as_str())
    }

    /// A copy of this label set with label `name` removed.
    pub fn without(&self, name: &str) -> Self {
        Self(
            self.0
                .iter()
                .filter(|label| label.name != name)
                .cloned()
                .collect(),
        )
    }

    /// Iterate the pairs in canonical order.
    pub fn iter(&self) -> std::slice::Iter<'_, Label> {
        self.0.iter()
    }

    #[allow(missing_docs)]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// FNV-1a/64 over the sorted pairs, with a `0xff` separator after each
    /// name and value so that pair boundaries cannot alias.
    pub fn fingerprint(&self) -> Fingerprint {
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;
        const SEPARATOR: u8 = 0xff;

        let mut hash = OFFSET;
        let mut mix = |bytes: &[u8]| {
            for b in bytes {
                hash ^= u64::from(*b);
                hash = hash.wrapping_mul(PRIME);
            }
            hash ^= u64::from(SEPARATOR);
            hash = hash.wrapping_mul(PRIME);
        };
        for label in &self.0 {
            mix(label.name.as_bytes());
            mix(label.value.as_bytes());
        }
        Fingerprint(hash)
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:?}", label.name, label.value)?;
        }
        write!(f, "}}")
    }
}

impl<'a> IntoIterator for &'a Labels {
    type Item = &'a Label;
    type IntoIter = std::slice::Iter<'a, Label>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// The kind of predicate a [`Matcher`] applies to a label value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    /// Exact equality.
    Eq,
    /// Exact inequality.
    Neq,
    /// Regular expression match (fully anchored).
    Re,
    /// Negated regular expression match (fully anchored).
    Nre,
}

/// A predicate over one label's value.
#[derive(Debug, Clone)]
pub struct Matcher {
    /// The predicate kind.
    pub match_type: MatchType,
    /// The label the predicate applies to.
    pub name: String,
    /// The literal value or regular expression source.
    pub value: String,
    re: Option<Regex>,
}

impl Matcher {
    /// Build a matcher. Fails if a regexp matcher carries an invalid
    /// pattern. Regexp matchers are fully anchored: `a|b` matches exactly
    /// `a` or `b`, never `ab`.
    pub fn new(
        match_type: MatchType,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let value = value.into();
        let re = match match_type {
            MatchType::Re | MatchType::Nre => Some(
                Regex::new(&format!("^(?:{})$", value)).context(InvalidRegexSnafu {
                    pattern: value.clone(),
                })?,
            ),
            MatchType::Eq | MatchType::Neq => None,
        };
        Ok(Self {
            match_type,
            name,
            value,
            re,
        })
    }

    /// Build an equality matcher; this cannot fail.
    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            match_type: MatchType::Eq,
            name: name.into(),
            value: value.into(),
            re: None,
        }
    }

    /// Whether `value` satisfies this predicate.
    pub fn matches(&self, value: &str) -> bool {
        match (&self.match_type, &self.re) {
            (MatchType::Eq, _) => self.value == value,
            (MatchType::Neq, _) => self.value != value,
            (MatchType::Re, Some(re)) => re.is_match(value),
            (MatchType::Nre, Some(re)) => !re.is_match(value),
            // Unreachable: regexp matchers always carry a compiled regex.
            (MatchType::Re, None) => false,
            (MatchType::Nre, None) => true,
        }
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.match_type {
            MatchType::Eq => "=",
            MatchType::Neq => "!=",
            MatchType::Re => "=~",
            MatchType::Nre => "!~",
        };
        write!(f, "{}{}{:?}", self.name, op, self.value)
    }
}

/// A virtual matcher value partitioning series by fingerprint modulo a shard
/// count, encoded as `<shard>_of_<of>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardAnnotation {
    /// The selected shard, `0 <= shard < of`.
    pub shard: u32,
    /// The total shard count.
    pub of: u32,
}

impl ShardAnnotation {
    /// Decode from the value of a [`SHARD_LABEL`] matcher.
    pub fn parse(value: &str) -> Result<Self> {
        let (shard, of) = value
            .split_once("_of_")
            .context(InvalidShardAnnotationSnafu { value })?;
        let shard: u32 = shard
            .parse()
            .ok()
            .context(InvalidShardAnnotationSnafu { value })?;
        let of: u32 = of
            .parse()
            .ok()
            .context(InvalidShardAnnotationSnafu { value })?;
        ensure!(of > 0 && shard < of, InvalidShardAnnotationSnafu { value });
        Ok(Self { shard, of })
    }

    /// Encode as a [`SHARD_LABEL`] matcher value.
    pub fn label_value(&self) -> String {
        format!("{}_of_{}", self.shard, self.of)
    }
}

impl fmt::Display for ShardAnnotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_of_{}", self.shard, self.of)
    }
}

/// A single range scan against the backing index. Produced by the schema
/// component; opaque to the resolution core.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IndexQuery {
    /// The table to scan.
    pub table_name: String,
    /// The hash key selecting the row group.
    pub hash_value: String,
    /// If set, only rows whose range key starts with this prefix.
    pub range_value_prefix: Option<Vec<u8>>,
    /// If set, scan range keys starting at this value.
    pub range_value_start: Option<Vec<u8>>,
    /// If set, only rows whose value equals this.
    pub value_equal: Option<Vec<u8>>,
}

/// A single row streamed back from the index for some [`IndexQuery`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// The table the row came from.
    pub table_name: String,
    /// The hash key the row was stored under.
    pub hash_value: String,
    /// Opaque range-key bytes; decoded by the schema component.
    pub range_value: Vec<u8>,
    /// Opaque value bytes; decoded by the schema component.
    pub value: Vec<u8>,
}

/// Metadata identifying one chunk without its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChunkRef {
    /// The owning tenant.
    pub tenant: String,
    /// Fingerprint of the chunk's series.
    pub fingerprint: Fingerprint,
    /// First sample time covered by the chunk.
    pub from: Time,
    /// Last sample time covered by the chunk.
    pub through: Time,
    /// CRC of the chunk bytes.
    pub checksum: u32,
}

impl ChunkRef {
    /// The key this chunk is stored under externally:
    /// `<tenant>/<fingerprint>:<from>:<through>:<checksum>`, all numeric
    /// fields in lowercase hex. Times before the epoch carry a leading `-`
    /// on their magnitude so the key round-trips exactly.
    pub fn external_key(&self) -> String {
        format!(
            "{}/{:x}:{}:{}:{:x}",
            self.tenant,
            self.fingerprint.get(),
            signed_hex(self.from.millis()),
            signed_hex(self.through.millis()),
            self.checksum
        )
    }

    /// Decode an external key, validating that it belongs to `tenant`.
    ///
    /// Tenant IDs are opaque and may themselves contain `/`; the time and
    /// checksum fields never do, so the tenant prefix ends at the last `/`.
    pub fn parse_external_key(tenant: &str, key: &str) -> Result<Self> {
        let (key_tenant, rest) = key.rsplit_once('/').context(InvalidChunkKeySnafu { key })?;
        ensure!(
            key_tenant == tenant,
            WrongChunkTenantSnafu { key, tenant }
        );

        let mut parts = rest.split(':');
        let mut next_hex = || parts.next().context(InvalidChunkKeySnafu { key });
        let fingerprint = u64::from_str_radix(next_hex()?, 16)
            .ok()
            .context(InvalidChunkKeySnafu { key })?;
        let from = i64::from_str_radix(next_hex()?, 16)
            .ok()
            .context(InvalidChunkKeySnafu { key })?;
        let through = i64::from_str_radix(next_hex()?, 16)
            .ok()
            .context(InvalidChunkKeySnafu { key })?;
        let checksum = u32::from_str_radix(next_hex()?, 16)
            .ok()
            .context(InvalidChunkKeySnafu { key })?;
        ensure!(parts.next().is_none(), InvalidChunkKeySnafu { key });

        Ok(Self {
            tenant: tenant.to_string(),
            fingerprint: Fingerprint::new(fingerprint),
            from: Time::from_millis(from),
            through: Time::from_millis(through),
            checksum,
        })
    }

    /// Whether this chunk overlaps the inclusive window `[from, through]`.
    pub fn overlaps(&self, from: Time, through: Time) -> bool {
        self.through >= from && self.from <= through
    }
}

// Sign-magnitude hex; `{:x}` on a negative i64 emits the two's-complement
// bit pattern, which `from_str_radix` rejects.
fn signed_hex(value: i64) -> String {
    if value < 0 {
        format!("-{:x}", value.unsigned_abs())
    } else {
        format!("{:x}", value)
    }
}

/// A materialized chunk: its reference plus the label set of its series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    #[allow(missing_docs)]
    pub chunk_ref: ChunkRef,
    #[allow(missing_docs)]
    pub labels: Labels,
}

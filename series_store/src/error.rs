//! Error type shared by the store and its collaborators.

use snafu::Snafu;

/// Errors returned by the store and by collaborator implementations.
///
/// Collaborators return this type directly so that the recoverable kinds
/// ([`Error::CardinalityExceeded`], [`Error::NotSupported`]) stay
/// structurally matchable across the trait boundary; everything foreign is
/// wrapped in the `source` of the matching variant.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("query must contain a metric name equality matcher"))]
    MissingMetricName,

    #[snafu(display(
        "cardinality limit exceeded for metric {:?}, label {:?}",
        metric_name,
        label_name
    ))]
    CardinalityExceeded {
        metric_name: String,
        label_name: String,
    },

    #[snafu(display("schema error: {}", source))]
    Schema {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[snafu(display("index client error: {}", source))]
    Index {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[snafu(display("operation not supported by the index schema"))]
    NotSupported,

    #[snafu(display("invalid chunk key in index: {}", source))]
    InvalidChunkKey { source: data_types::Error },

    #[snafu(display("malformed index entry: {}", reason))]
    MalformedIndexEntry { reason: String },

    #[snafu(display("invalid shard annotation: {}", source))]
    InvalidShard { source: data_types::Error },

    #[snafu(display("chunk fetcher error: {}", source))]
    Fetcher {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[snafu(display("cannot decode label names entry: {}", source))]
    LabelNamesDecode { source: serde_json::Error },
}

/// A specialized `Result` for store operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether this is the per-matcher cardinality signal, recoverable
    /// during matcher fanout.
    pub fn is_cardinality_exceeded(&self) -> bool {
        matches!(self, Self::CardinalityExceeded { .. })
    }
}

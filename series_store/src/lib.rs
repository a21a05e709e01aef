//! Resolution of series queries against a key-range chunk index.
//!
//! The [`SeriesStore`] translates a tenant-scoped query — a metric name plus
//! label matchers over a time window — into chunk references, distinct
//! series label sets, or label name/value enumerations. It plans index
//! queries through a [`interface::Schema`], fans them out concurrently per
//! matcher against an [`interface::IndexClient`], intersects the resulting
//! series IDs and materializes series by fetching one representative chunk
//! per series through an [`interface::ChunkFetcher`].
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod error;
pub mod interface;
mod metrics;
mod pool;
mod set_matcher;
mod store;
pub mod test_util;

pub use error::{Error, Result};
pub use metrics::SeriesStoreMetrics;
pub use store::{SeriesStore, SeriesStoreConfig};

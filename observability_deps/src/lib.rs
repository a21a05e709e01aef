//! This crate exists to add a layer of indirection between the observability
//! crates used by the rest of the workspace and the workspace members
//! themselves, so that the underlying versions can be managed (and replaced)
//! in a single place.
//!
//! Use the re-exports rather than depending on the underlying crates
//! directly:
//!
//! ```
//! use observability_deps::tracing::debug;
//!
//! debug!(queries = 3, "issuing index lookups");
//! ```
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(missing_docs)]

pub use tracing;

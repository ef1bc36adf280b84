#![warn(clippy::todo)]
#![deny(
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    rustdoc::private_intra_doc_links,
    rust_2018_idioms,
    missing_docs,
    clippy::needless_borrow,
    clippy::redundant_clone,
    missing_debug_implementations
)]

//! # Topgroup
//!
//! `Topgroup` is a bounded-memory GROUP BY engine. It aggregates rows into fixed size
//! buckets that live in a caller supplied buffer and, when the query only wants the
//! top `limit` groups, keeps track of them with a bounded min-max heap instead of
//! sorting every distinct group at the end.

pub mod common;
pub mod error;
pub mod exec;

//! Common utilities shared by the whole crate

pub mod config;
pub mod profiler;
pub mod query_context;
pub mod types;
pub mod utils;

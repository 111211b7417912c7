//! csvq Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types and logging for the csvq workspace.
//!
//! - **Types**: [`Header`](types::Header) and [`Record`](types::Record), the unit of work that
//!   flows from an upload through the broker into the store
//! - **Logging**: tracing subscriber setup driven by `LOG_*` environment variables

pub mod logging;
pub mod types;

pub use types::{Header, Record};

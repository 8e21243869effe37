//! Common building blocks for consist controllers: errors, events, batching, backoff and logging

#![deny(missing_docs)]

pub mod backoff;
pub mod batch;
pub mod error;
pub mod events;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

//! Domain layer for webhook capture: record types, request normalization and
//! the ingestion rate limiter. Nothing in this crate performs I/O.

use std::sync::Arc;

use chrono::{DateTime, Utc};

pub mod normalizer;
pub mod rate_limit;
pub mod types;

/// Injectable time source.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

//! Metric names for flowline.
//!
//! Crates record through the `metrics` crate facade when built with their
//! `metrics` feature. Nothing here installs a recorder; the embedding binary
//! decides where (or whether) metrics are exported.
//!
//! ```rust,ignore
//! use flowline_metrics::{counter, definitions::pipeline, labels};
//!
//! counter!(pipeline::MESSAGES_HANDLED_TOTAL, labels::DEVICE => "orders").increment(1);
//! ```

pub mod definitions;

pub use {
    definitions::{buckets, devices, labels, pipeline, runner},
    metrics::{counter, gauge, histogram},
};

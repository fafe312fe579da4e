//! Prediction aggregation.
//!
//! This module holds the aggregator core, result normalization, the
//! health gate and the batch runner built on top of them.

pub mod aggregator;
pub mod batch;
pub mod health;
pub mod normalizer;

pub use aggregator::Aggregator;
pub use batch::predict_batch;
pub use health::HealthReport;

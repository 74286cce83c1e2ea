//! Metric names for wxrelay.
//!
//! Crates record through the re-exported `metrics` facade macros behind their
//! own optional `metrics` feature. Nothing is exported unless the embedding
//! binary installs a recorder.
//!
//! ```rust,ignore
//! use wxrelay_metrics::{counter, labels, listener};
//!
//! counter!(listener::MESSAGES_PERSISTED_TOTAL, labels::INSTANCE => "wx1").increment(1);
//! ```

mod definitions;

pub use definitions::*;

pub use metrics::{counter, gauge, histogram};

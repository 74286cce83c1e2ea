//! Shared types, error definitions, and utilities used across all wxrelay crates.

pub mod error;
pub mod notify;
pub mod time;

pub use {
    error::{Error, Result, bounded},
    notify::{ConfigChangeEvent, ConfigChangeKind, ConfigNotifier, ConfigSubscriber},
    time::now_ms,
};

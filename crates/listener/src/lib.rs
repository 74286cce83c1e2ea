//! Listener registry: which conversations each instance is polling, the
//! polling loops themselves, and timeout-based eviction.

pub mod error;
pub mod model;
pub mod pause;
pub mod registry;
pub mod store;
pub mod store_memory;
pub mod store_sqlite;

pub use {
    error::{Error, Result},
    model::{FixedListener, ListenerKey, ListenerSubscription},
    pause::{PauseGate, PauseGuard},
    registry::ListenerRegistry,
    store::ListenerStore,
    store_memory::InMemoryListenerStore,
    store_sqlite::SqliteListenerStore,
};

/// Run database migrations for the listener store.
///
/// Creates the `listeners` and `fixed_listeners` tables. Call at startup
/// before using [`SqliteListenerStore`].
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}

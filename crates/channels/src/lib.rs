//! Message model and the seams between wxrelay and the outside world.
//!
//! An [`Endpoint`] is one managed WeChat automation instance; a [`Platform`]
//! is a backend that turns an inbound message into a reply. Between them
//! sit the message filter, the @-mention gate, content pre-processing, echo
//! suppression and the message store.

pub mod echo;
pub mod endpoint;
pub mod error;
pub mod filter;
pub mod gating;
pub mod model;
pub mod platform;
pub mod preprocess;
pub mod registry;
pub mod store;
pub mod store_memory;
pub mod store_sqlite;

pub use {
    echo::EchoGuard,
    endpoint::{Endpoint, FetchOptions, SendOptions, SendOutcome},
    error::{Error, Result},
    filter::{FilterDecision, classify, filter_batch, split_at_marker},
    gating::{at_mention_gate, parse_at_names},
    model::{DeliveryStatus, Message, RawMessage, ReplyStatus},
    platform::{Platform, PlatformReply},
    preprocess::{Attachment, AttachmentKind, Prepared, prepare},
    registry::{EndpointRegistry, PlatformRegistry, Registry},
    store::MessageStore,
    store_memory::InMemoryMessageStore,
    store_sqlite::SqliteMessageStore,
    wxrelay_config::SendMode,
};

/// Run database migrations for the message store.
///
/// Creates the `messages` table. Call at startup before using
/// [`SqliteMessageStore`].
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}

use {anyhow::Result, async_trait::async_trait};

use crate::model::{FixedListener, ListenerSubscription};

/// Persistent storage for subscriptions and fixed listeners.
#[async_trait]
pub trait ListenerStore: Send + Sync {
    /// Every subscription, active or not.
    async fn load_all(&self) -> Result<Vec<ListenerSubscription>>;

    /// Insert or replace the row for `(instance_id, who)`.
    async fn upsert(&self, sub: &ListenerSubscription) -> Result<()>;

    async fn delete(&self, instance_id: &str, who: &str) -> Result<bool>;

    async fn list_fixed(&self) -> Result<Vec<FixedListener>>;

    /// Returns `false` when the session name is taken.
    async fn insert_fixed(&self, fixed: &FixedListener) -> Result<bool>;

    async fn update_fixed(&self, fixed: &FixedListener) -> Result<bool>;

    async fn delete_fixed(&self, session_name: &str) -> Result<bool>;
}

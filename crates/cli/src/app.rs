//! Process wiring: config, database, stores and the two long-running
//! services.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use {
    anyhow::Context,
    sqlx::SqlitePool,
    tracing::{info, warn},
    wxrelay_channels::{
        EchoGuard, EndpointRegistry, MessageStore, PlatformRegistry, SqliteMessageStore,
    },
    wxrelay_common::{ConfigNotifier, ConfigSubscriber},
    wxrelay_config::WxRelayConfig,
    wxrelay_delivery::{DeliveryPipeline, MessageSender},
    wxrelay_listener::{ListenerRegistry, SqliteListenerStore},
    wxrelay_routing::{RuleEngine, SqliteRuleStore},
};

/// Load the config at `path`, or discover it in the standard locations.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<WxRelayConfig> {
    match path {
        Some(path) => wxrelay_config::load_config(path),
        None => Ok(wxrelay_config::discover_and_load()),
    }
}

pub fn db_path(config: &WxRelayConfig) -> PathBuf {
    config
        .database
        .path
        .clone()
        .unwrap_or_else(|| wxrelay_config::data_dir().join("wxrelay.db"))
}

/// Open (creating if needed) the SQLite database at `path`.
pub async fn open_database(path: &Path) -> anyhow::Result<SqlitePool> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create data dir {}", parent.display()))?;
    }
    let url = format!("sqlite:{}?mode=rwc", path.display());
    SqlitePool::connect(&url)
        .await
        .with_context(|| format!("open database {}", path.display()))
}

/// Run every store's migrations against `pool`.
pub async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    wxrelay_channels::run_migrations(pool)
        .await
        .context("messages migrations failed")?;
    wxrelay_routing::run_migrations(pool)
        .await
        .context("rules migrations failed")?;
    wxrelay_listener::run_migrations(pool)
        .await
        .context("listener migrations failed")?;
    Ok(())
}

/// Open and migrate the configured database.
pub async fn prepare_database(config: &WxRelayConfig) -> anyhow::Result<SqlitePool> {
    let pool = open_database(&db_path(config)).await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Rule engine over the SQLite rule store, with its snapshot loaded.
pub async fn rule_engine(pool: &SqlitePool) -> anyhow::Result<RuleEngine> {
    let engine = RuleEngine::new(Arc::new(SqliteRuleStore::with_pool(pool.clone())));
    engine.reload().await?;
    Ok(engine)
}

/// Run both services until Ctrl-C.
pub async fn run(config: WxRelayConfig) -> anyhow::Result<()> {
    let pool = prepare_database(&config).await?;
    info!(path = %db_path(&config).display(), "database ready");

    let notifier = Arc::new(ConfigNotifier::new());
    let messages = Arc::new(SqliteMessageStore::with_pool(pool.clone()));
    let rules = Arc::new(
        RuleEngine::new(Arc::new(SqliteRuleStore::with_pool(pool.clone())))
            .with_notifier(Arc::clone(&notifier)),
    );
    let seeded = rules.seed(&config.rules).await?;
    if seeded > 0 {
        info!(seeded, "rules seeded from config");
    }

    let endpoints = Arc::new(EndpointRegistry::new());
    wxrelay_wxauto::register_instances(
        &config.instances,
        &endpoints,
        config.listener.endpoint_timeout(),
    );
    if endpoints.is_empty() {
        warn!("no instances configured, nothing will be listened to");
    }

    let platforms = Arc::new(PlatformRegistry::new());
    wxrelay_platforms::register_platforms(&config.platforms, &platforms);

    let echo = Arc::new(EchoGuard::new(config.sender.echo_window()));
    let registry = ListenerRegistry::new(
        Arc::clone(&endpoints),
        Arc::clone(&messages) as Arc<dyn MessageStore>,
        Arc::new(SqliteListenerStore::with_pool(pool.clone())),
        Arc::clone(&rules),
        Arc::clone(&echo),
        config.listener.clone(),
    );
    registry
        .seed_fixed_listeners(&config.fixed_listeners)
        .await?;
    notifier.subscribe_all(Arc::clone(&registry) as Arc<dyn ConfigSubscriber>);

    let sender = Arc::new(MessageSender::new(
        endpoints,
        Arc::clone(&platforms),
        registry.pause_gate(),
        echo,
        config.sender.clone(),
    ));
    let pipeline = DeliveryPipeline::new(
        messages,
        rules,
        platforms,
        sender,
        config.delivery.clone(),
    );
    pipeline.initialize().await?;

    registry.start().await?;
    pipeline.start().await;
    info!("wxrelay running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    info!("shutting down");

    registry.stop().await;
    pipeline.stop().await;
    pool.close().await;
    info!("stopped");
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, tempfile::TempDir, wxrelay_config::DatabaseConfig};

    #[test]
    fn db_path_prefers_config() {
        let config = WxRelayConfig {
            database: DatabaseConfig {
                path: Some(PathBuf::from("/tmp/custom.db")),
            },
            ..Default::default()
        };
        assert_eq!(db_path(&config), PathBuf::from("/tmp/custom.db"));
        assert!(db_path(&WxRelayConfig::default()).ends_with("wxrelay.db"));
    }

    #[tokio::test]
    async fn migrations_create_tables_and_are_idempotent() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("wxrelay.db");
        let pool = open_database(&path).await.unwrap();
        migrate(&pool).await.unwrap();
        migrate(&pool).await.unwrap();

        for table in ["messages", "delivery_rules", "listeners", "fixed_listeners"] {
            let _: (i64,) = sqlx::query_as(&format!("SELECT count(*) FROM {table}"))
                .fetch_one(&pool)
                .await
                .unwrap();
        }
        pool.close().await;
        assert!(path.exists());
    }

    #[tokio::test]
    async fn load_config_reads_explicit_path() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("wxrelay.toml");
        std::fs::write(
            &path,
            "[delivery]\nmerge_enabled = true\n\n[[instances]]\nid = \"wx1\"\nbase_url = \"http://127.0.0.1:5000\"\n",
        )
        .unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert!(config.delivery.merge_enabled);
        assert_eq!(config.instances[0].id, "wx1");
        assert!(load_config(Some(&temp.path().join("missing.toml"))).is_err());
    }
}

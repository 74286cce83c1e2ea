mod app;
mod config_commands;
mod db_commands;
mod listener_commands;
mod messages_commands;
mod rules_commands;

use std::path::PathBuf;

use {
    clap::{Parser, Subcommand},
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
    wxrelay_channels::SqliteMessageStore,
    wxrelay_listener::SqliteListenerStore,
};

#[derive(Parser)]
#[command(
    name = "wxrelay",
    version,
    about = "Relay WeChat conversations to chat bots"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Config file (overrides discovery of ./wxrelay.toml and friends).
    #[arg(long, short, global = true, env = "WXRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Custom data directory (overrides default data dir).
    #[arg(long, global = true, env = "WXRELAY_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen and deliver until Ctrl-C (default when no subcommand is provided).
    Run,
    /// Validate the configuration file.
    Check {
        /// Show informational diagnostics in addition to errors and warnings.
        #[arg(long)]
        verbose: bool,
    },
    /// Database management (reset, migrate).
    Db {
        #[command(subcommand)]
        action: db_commands::DbAction,
    },
    /// Delivery rule management.
    Rules {
        #[command(subcommand)]
        action: rules_commands::RulesAction,
    },
    /// Fixed listener management.
    Fixed {
        #[command(subcommand)]
        action: listener_commands::FixedAction,
    },
    /// Inspect persisted listener subscriptions.
    Listeners {
        #[command(subcommand)]
        action: listener_commands::ListenersAction,
    },
    /// Inspect stored messages.
    Messages {
        #[command(subcommand)]
        action: messages_commands::MessagesAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    if let Some(ref dir) = cli.data_dir {
        wxrelay_config::set_data_dir(dir.clone());
    }

    // Validation reads the file itself so parse errors become diagnostics.
    if let Some(Commands::Check { verbose }) = cli.command {
        return config_commands::check(cli.config.as_deref(), verbose);
    }

    let config = app::load_config(cli.config.as_deref())?;

    match cli.command {
        None | Some(Commands::Run) => {
            info!(version = env!("CARGO_PKG_VERSION"), "wxrelay starting");
            app::run(config).await
        },
        Some(Commands::Check { .. }) => Ok(()),
        Some(Commands::Db { action }) => db_commands::handle_db(action, &config).await,
        Some(Commands::Rules { action }) => {
            let pool = app::prepare_database(&config).await?;
            let result = rules_commands::handle_rules(action, &pool).await;
            pool.close().await;
            result
        },
        Some(Commands::Fixed { action }) => {
            let pool = app::prepare_database(&config).await?;
            let store = SqliteListenerStore::with_pool(pool.clone());
            let result = listener_commands::handle_fixed(action, &store).await;
            pool.close().await;
            result
        },
        Some(Commands::Listeners { action }) => {
            let pool = app::prepare_database(&config).await?;
            let store = SqliteListenerStore::with_pool(pool.clone());
            let result = listener_commands::handle_listeners(action, &store).await;
            pool.close().await;
            result
        },
        Some(Commands::Messages { action }) => {
            let pool = app::prepare_database(&config).await?;
            let store = SqliteMessageStore::with_pool(pool.clone());
            let result = messages_commands::handle_messages(action, &store).await;
            pool.close().await;
            result
        },
    }
}

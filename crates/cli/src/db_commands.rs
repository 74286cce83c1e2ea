use std::path::{Path, PathBuf};

use {clap::Subcommand, wxrelay_config::WxRelayConfig};

use crate::app;

#[derive(Subcommand)]
pub enum DbAction {
    /// Delete the database file and its WAL/SHM companions.
    Reset,
    /// Run all pending database migrations.
    Migrate,
}

pub async fn handle_db(action: DbAction, config: &WxRelayConfig) -> anyhow::Result<()> {
    let path = app::db_path(config);
    match action {
        DbAction::Reset => reset_database(&path),
        DbAction::Migrate => run_migrations(&path).await,
    }
}

/// The database file plus the files SQLite may create next to it.
fn database_files(path: &Path) -> Vec<PathBuf> {
    let mut files = vec![path.to_path_buf()];
    for suffix in ["-wal", "-shm"] {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        files.push(PathBuf::from(name));
    }
    files
}

fn reset_database(path: &Path) -> anyhow::Result<()> {
    let mut deleted = false;
    for file in database_files(path) {
        if file.exists() {
            std::fs::remove_file(&file)?;
            println!("Deleted: {}", file.display());
            deleted = true;
        }
    }

    if deleted {
        println!("Database deleted. Run `wxrelay db migrate` to recreate it.");
    } else {
        println!("No database found at {}.", path.display());
    }
    Ok(())
}

async fn run_migrations(path: &Path) -> anyhow::Result<()> {
    println!("Running migrations for {}...", path.display());
    let pool = app::open_database(path).await?;
    app::migrate(&pool).await?;
    pool.close().await;
    println!("All migrations complete.");
    Ok(())
}

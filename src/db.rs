//! SQLite connection management and index file handling.
//!
//! Pools are opened in WAL mode, so readers keep working while a sync
//! writes. A full reindex builds into a sibling temp file and then swaps it
//! into place with [`swap_index_files`]; the `-wal` and `-shm` side files
//! always travel with their database.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{ConnectOptions, Connection};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

/// Suffixes of every file that makes up one SQLite database in WAL mode.
const DB_FILE_SUFFIXES: [&str; 3] = ["", "-wal", "-shm"];

/// Open a pool on `db_path`, creating the file and parent directories.
///
/// When `extension` is given, every pooled connection loads it; a missing
/// or broken extension fails the connect.
pub async fn connect(db_path: &Path, extension: Option<&Path>) -> Result<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let options = connect_options(db_path, extension)?;

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open index database {}", db_path.display()))?;

    Ok(pool)
}

fn connect_options(db_path: &Path, extension: Option<&Path>) -> Result<SqliteConnectOptions> {
    let mut options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(false);
    if let Some(ext) = extension {
        options = options.extension(ext.to_string_lossy().into_owned());
    }
    Ok(options)
}

/// Load `extension` on a throwaway connection and check `vec_version()`.
pub async fn probe_vector_extension(db_path: &Path, extension: &Path) -> Result<String> {
    let options = connect_options(db_path, Some(extension))?;
    let mut conn = options
        .connect()
        .await
        .with_context(|| format!("Failed to load vector extension {}", extension.display()))?;
    let version: String = sqlx::query_scalar("SELECT vec_version()")
        .fetch_one(&mut conn)
        .await
        .context("vector extension loaded but vec_version() failed")?;
    conn.close().await?;
    Ok(version)
}

/// Sibling path used for a reindex build: `<path>.tmp-<uuid>`.
pub fn temp_index_path(db_path: &Path) -> PathBuf {
    sibling(db_path, &format!(".tmp-{}", uuid::Uuid::new_v4()))
}

fn sibling(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Remove a database and its WAL side files. Missing files are fine.
pub fn remove_index_files(db_path: &Path) -> Result<()> {
    for suffix in DB_FILE_SUFFIXES {
        let path = sibling(db_path, suffix);
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed index file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to remove {}", path.display()))
            }
        }
    }
    Ok(())
}

fn move_index_files(from: &Path, to: &Path) -> Result<()> {
    for suffix in DB_FILE_SUFFIXES {
        let src = sibling(from, suffix);
        let dst = sibling(to, suffix);
        match std::fs::rename(&src, &dst) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to move {} to {}", src.display(), dst.display())
                })
            }
        }
    }
    Ok(())
}

/// Replace the live database at `live` with the one built at `temp`.
///
/// Both pools must be closed first. The live files are moved to a backup,
/// the temp files moved into place, then the backup is deleted. If moving
/// the temp files fails the backup is restored.
pub fn swap_index_files(live: &Path, temp: &Path) -> Result<()> {
    let backup = sibling(live, &format!(".backup-{}", uuid::Uuid::new_v4()));
    move_index_files(live, &backup)?;
    if let Err(e) = move_index_files(temp, live) {
        if let Err(restore_err) = move_index_files(&backup, live) {
            warn!(error = %restore_err, "failed to restore index backup after swap error");
        }
        return Err(e);
    }
    remove_index_files(&backup)?;
    Ok(())
}

//! Index schema creation.
//!
//! All statements are idempotent so the schema can be ensured every time a
//! database is opened, including fresh reindex temp files. The FTS5 table
//! and the sqlite-vec table are optional: failing to create them degrades
//! search instead of failing the open.

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::warn;

use crate::error::MemoryError;

/// Entity and relation tables of the knowledge graph. Relations are keyed
/// by both endpoints and the relation name, so re-adding one updates it.
async fn ensure_graph_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entities (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            type TEXT NOT NULL,
            description TEXT,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS relations (
            source_id TEXT NOT NULL,
            target_id TEXT NOT NULL,
            relation TEXT NOT NULL,
            description TEXT,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (source_id, target_id, relation)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entities_name ON entities(lower(name))")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_relations_target ON relations(target_id)")
        .execute(pool)
        .await?;
    Ok(())
}

/// Outcome of creating the optional FTS5 table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FtsState {
    pub available: bool,
    pub error: Option<String>,
}

pub async fn ensure_schema(pool: &SqlitePool, fts_enabled: bool) -> Result<FtsState> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            path TEXT NOT NULL,
            source TEXT NOT NULL DEFAULT 'memory',
            hash TEXT NOT NULL,
            mtime INTEGER NOT NULL,
            size INTEGER NOT NULL,
            PRIMARY KEY (path, source)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            path TEXT NOT NULL,
            source TEXT NOT NULL DEFAULT 'memory',
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            hash TEXT NOT NULL,
            model TEXT NOT NULL,
            text TEXT NOT NULL,
            embedding BLOB NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS embedding_cache (
            provider TEXT NOT NULL,
            model TEXT NOT NULL,
            provider_key TEXT NOT NULL,
            hash TEXT NOT NULL,
            embedding BLOB NOT NULL,
            dims INTEGER,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (provider, model, provider_key, hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_path ON chunks(path)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_embedding_cache_updated_at ON embedding_cache(updated_at)",
    )
    .execute(pool)
    .await?;

    ensure_graph_schema(pool).await?;

    if !fts_enabled {
        return Ok(FtsState::default());
    }

    // FTS5 may be compiled out of the linked SQLite.
    let created = sqlx::query(
        r#"
        CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
            text,
            id UNINDEXED,
            path UNINDEXED,
            source UNINDEXED,
            model UNINDEXED,
            start_line UNINDEXED,
            end_line UNINDEXED
        )
        "#,
    )
    .execute(pool)
    .await;

    Ok(match created {
        Ok(_) => FtsState {
            available: true,
            error: None,
        },
        Err(e) => {
            warn!(error = %e, "full-text index unavailable; keyword search disabled");
            FtsState {
                available: false,
                error: Some(e.to_string()),
            }
        }
    })
}

/// Dimensionality declared by an existing `chunks_vec` table, if any.
pub async fn vector_table_dims(pool: &SqlitePool) -> Result<Option<usize>> {
    let sql: Option<String> =
        sqlx::query_scalar("SELECT sql FROM sqlite_master WHERE type = 'table' AND name = 'chunks_vec'")
            .fetch_optional(pool)
            .await?;
    Ok(sql.as_deref().and_then(parse_vec_dims))
}

fn parse_vec_dims(sql: &str) -> Option<usize> {
    let lower = sql.to_ascii_lowercase();
    let start = lower.find("float[")? + "float[".len();
    let end = lower[start..].find(']')? + start;
    lower[start..end].trim().parse().ok()
}

/// Create `chunks_vec` for `dims`. An existing table for another size is
/// left alone and reported as [`MemoryError::DimensionsChanged`]; only a
/// full rebuild replaces it. Requires the vector extension on every
/// connection.
pub async fn ensure_vector_table(pool: &SqlitePool, dims: usize) -> Result<()> {
    match vector_table_dims(pool).await? {
        Some(existing) if existing == dims => Ok(()),
        Some(existing) => Err(MemoryError::DimensionsChanged {
            expected: existing,
            actual: dims,
        }
        .into()),
        None => {
            sqlx::query(&format!(
                "CREATE VIRTUAL TABLE IF NOT EXISTS chunks_vec USING vec0(id TEXT PRIMARY KEY, embedding float[{}])",
                dims
            ))
            .execute(pool)
            .await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_vec_dims() {
        assert_eq!(
            parse_vec_dims("CREATE VIRTUAL TABLE chunks_vec USING vec0(id TEXT PRIMARY KEY, embedding FLOAT[1536])"),
            Some(1536)
        );
        assert_eq!(parse_vec_dims("CREATE TABLE t (x)"), None);
    }

    #[tokio::test]
    async fn test_schema_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect(&dir.path().join("s.sqlite"), None)
            .await
            .unwrap();
        let first = ensure_schema(&pool, true).await.unwrap();
        let second = ensure_schema(&pool, true).await.unwrap();
        assert_eq!(first, second);
        assert!(first.available, "bundled SQLite ships FTS5");

        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .unwrap();
        for t in [
            "chunks",
            "embedding_cache",
            "files",
            "meta",
            "chunks_fts",
            "entities",
            "relations",
        ] {
            assert!(tables.iter().any(|n| n == t), "missing table {}", t);
        }
        assert_eq!(vector_table_dims(&pool).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fts_disabled_skips_table() {
        let dir = tempfile::tempdir().unwrap();
        let pool = crate::db::connect(&dir.path().join("s.sqlite"), None)
            .await
            .unwrap();
        let state = ensure_schema(&pool, false).await.unwrap();
        assert!(!state.available);
        assert!(state.error.is_none());
    }
}

//! SQLite-backed index store.
//!
//! Wraps one [`SqlitePool`] and owns every SQL statement the index runs:
//! metadata, per-file chunk replacement, the tombstone sweep, the
//! embedding cache, and both retrieval strategies.
//!
//! # Tables
//!
//! | Table | Contents |
//! |-------|----------|
//! | `meta` | `memory_index_meta_v1` → [`IndexMeta`] JSON |
//! | `files` | one row per indexed file (`path`, `source`, content `hash`) |
//! | `chunks` | chunk text plus its embedding BLOB |
//! | `chunks_fts` | FTS5 mirror of `chunks.text` (optional) |
//! | `chunks_vec` | sqlite-vec mirror of embeddings (optional) |
//! | `embedding_cache` | embeddings keyed by provider, model, provider key, chunk hash |
//!
//! Without the vector extension, [`IndexStore::vector_search`] scans the
//! embeddings stored on `chunks` and ranks them in process.

use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use memory_index_core::chunk::hash_text;
use memory_index_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use memory_index_core::hybrid::{truncate_snippet, vector_score, Candidate};
use memory_index_core::models::{FileEntry, IndexMeta, MemoryChunk, MemorySource};

use crate::db;
use crate::schema::{self, FtsState};

/// Key of the singleton metadata row.
pub const META_KEY: &str = "memory_index_meta_v1";

/// Hashes per `IN (...)` lookup against the embedding cache.
const CACHE_LOOKUP_BATCH: usize = 400;

/// Identity an embedding cache row is scoped to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheScope {
    pub provider: String,
    pub model: String,
    pub provider_key: String,
}

/// A chunk ready to be written, with its embedding.
#[derive(Debug, Clone)]
pub struct IndexedChunk {
    pub chunk: MemoryChunk,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexCounts {
    pub files: i64,
    pub chunks: i64,
    pub by_source: BTreeMap<MemorySource, SourceCount>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SourceCount {
    pub files: i64,
    pub chunks: i64,
}

/// Stable chunk id: the same chunk of the same file under the same model
/// always maps to the same row.
pub fn chunk_id(source: MemorySource, path: &str, chunk: &MemoryChunk, model: &str) -> String {
    hash_text(&format!(
        "{}:{}:{}:{}:{}:{}",
        source, path, chunk.start_line, chunk.end_line, chunk.hash, model
    ))
}

pub struct IndexStore {
    pool: SqlitePool,
    fts: FtsState,
    vector_extension: bool,
    vector_dims: Mutex<Option<usize>>,
}

impl IndexStore {
    /// Open (or create) the database at `path` and ensure the schema.
    pub async fn open(path: &Path, fts_enabled: bool, extension: Option<&Path>) -> Result<Self> {
        let pool = db::connect(path, extension).await?;
        let fts = schema::ensure_schema(&pool, fts_enabled).await?;
        let vector_dims = if extension.is_some() {
            schema::vector_table_dims(&pool).await?
        } else {
            None
        };
        Ok(Self {
            pool,
            fts,
            vector_extension: extension.is_some(),
            vector_dims: Mutex::new(vector_dims),
        })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn fts(&self) -> &FtsState {
        &self.fts
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn vector_dims(&self) -> Option<usize> {
        self.vector_dims.lock().ok().and_then(|g| *g)
    }

    /// Make sure `chunks_vec` exists for `dims`. No-op without the
    /// extension; fails with `DimensionsChanged` if it was built for
    /// another size.
    pub async fn ensure_vector_table(&self, dims: usize) -> Result<()> {
        if !self.vector_extension || dims == 0 || self.vector_dims() == Some(dims) {
            return Ok(());
        }
        schema::ensure_vector_table(&self.pool, dims).await?;
        if let Ok(mut guard) = self.vector_dims.lock() {
            *guard = Some(dims);
        }
        Ok(())
    }

    // ============ Metadata ============

    pub async fn read_meta(&self) -> Result<Option<IndexMeta>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
            .bind(META_KEY)
            .fetch_optional(&self.pool)
            .await?;
        match value {
            // An unreadable record is treated as missing, which forces a rebuild.
            Some(json) => Ok(serde_json::from_str(&json).ok()),
            None => Ok(None),
        }
    }

    pub async fn write_meta(&self, meta: &IndexMeta) -> Result<()> {
        let json = serde_json::to_string(meta)?;
        sqlx::query(
            "INSERT INTO meta (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(META_KEY)
        .bind(json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ============ Files and chunks ============

    pub async fn file_hash(&self, path: &str, source: MemorySource) -> Result<Option<String>> {
        let hash = sqlx::query_scalar("SELECT hash FROM files WHERE path = ? AND source = ?")
            .bind(path)
            .bind(source.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(hash)
    }

    pub async fn indexed_paths(&self, source: MemorySource) -> Result<Vec<String>> {
        let paths = sqlx::query_scalar("SELECT path FROM files WHERE source = ? ORDER BY path")
            .bind(source.as_str())
            .fetch_all(&self.pool)
            .await?;
        Ok(paths)
    }

    /// Replace every row belonging to `entry` in one transaction.
    pub async fn replace_file(
        &self,
        entry: &FileEntry,
        chunks: &[IndexedChunk],
        model: &str,
    ) -> Result<()> {
        let source = entry.source.as_str();
        let vector_dims = self.vector_dims();
        let now = chrono::Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;

        self.delete_file_rows(&mut tx, &entry.path, entry.source, vector_dims.is_some())
            .await?;

        for item in chunks {
            let id = chunk_id(entry.source, &entry.path, &item.chunk, model);
            let blob = vec_to_blob(&item.embedding);

            sqlx::query(
                r#"
                INSERT INTO chunks (id, path, source, start_line, end_line, hash, model, text, embedding, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    hash = excluded.hash,
                    model = excluded.model,
                    text = excluded.text,
                    embedding = excluded.embedding,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&id)
            .bind(&entry.path)
            .bind(source)
            .bind(item.chunk.start_line as i64)
            .bind(item.chunk.end_line as i64)
            .bind(&item.chunk.hash)
            .bind(model)
            .bind(&item.chunk.text)
            .bind(&blob)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if self.fts.available {
                sqlx::query(
                    "INSERT INTO chunks_fts (text, id, path, source, model, start_line, end_line) VALUES (?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&item.chunk.text)
                .bind(&id)
                .bind(&entry.path)
                .bind(source)
                .bind(model)
                .bind(item.chunk.start_line as i64)
                .bind(item.chunk.end_line as i64)
                .execute(&mut *tx)
                .await?;
            }

            if vector_dims == Some(item.embedding.len()) {
                sqlx::query("INSERT INTO chunks_vec (id, embedding) VALUES (?, ?)")
                    .bind(&id)
                    .bind(&blob)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        sqlx::query(
            r#"
            INSERT INTO files (path, source, hash, mtime, size)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(path, source) DO UPDATE SET
                hash = excluded.hash,
                mtime = excluded.mtime,
                size = excluded.size
            "#,
        )
        .bind(&entry.path)
        .bind(source)
        .bind(&entry.hash)
        .bind(entry.mtime_ms)
        .bind(entry.size as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(path = %entry.path, source, chunks = chunks.len(), "indexed file");
        Ok(())
    }

    /// Remove a file and everything derived from it.
    pub async fn delete_file(&self, path: &str, source: MemorySource) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.delete_file_rows(&mut tx, path, source, self.vector_dims().is_some())
            .await?;
        sqlx::query("DELETE FROM files WHERE path = ? AND source = ?")
            .bind(path)
            .bind(source.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn delete_file_rows(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        path: &str,
        source: MemorySource,
        has_vector_table: bool,
    ) -> Result<()> {
        if has_vector_table {
            sqlx::query(
                "DELETE FROM chunks_vec WHERE id IN (SELECT id FROM chunks WHERE path = ? AND source = ?)",
            )
            .bind(path)
            .bind(source.as_str())
            .execute(&mut **tx)
            .await?;
        }
        if self.fts.available {
            sqlx::query("DELETE FROM chunks_fts WHERE path = ? AND source = ?")
                .bind(path)
                .bind(source.as_str())
                .execute(&mut **tx)
                .await?;
        }
        sqlx::query("DELETE FROM chunks WHERE path = ? AND source = ?")
            .bind(path)
            .bind(source.as_str())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Tombstone sweep: drop files of `source` that are no longer listed.
    /// Returns the removed paths.
    pub async fn remove_stale(&self, source: MemorySource, live: &[String]) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for path in self.indexed_paths(source).await? {
            if !live.contains(&path) {
                self.delete_file(&path, source).await?;
                removed.push(path);
            }
        }
        Ok(removed)
    }

    pub async fn counts(&self, sources: &[MemorySource]) -> Result<IndexCounts> {
        let mut counts = IndexCounts::default();

        let file_rows = sqlx::query("SELECT source, COUNT(*) AS n FROM files GROUP BY source")
            .fetch_all(&self.pool)
            .await?;
        let chunk_rows = sqlx::query("SELECT source, COUNT(*) AS n FROM chunks GROUP BY source")
            .fetch_all(&self.pool)
            .await?;

        for source in sources {
            counts.by_source.insert(*source, SourceCount::default());
        }
        for row in &file_rows {
            let Ok(source) = row.get::<String, _>("source").parse::<MemorySource>() else {
                continue;
            };
            if let Some(c) = counts.by_source.get_mut(&source) {
                c.files = row.get("n");
            }
        }
        for row in &chunk_rows {
            let Ok(source) = row.get::<String, _>("source").parse::<MemorySource>() else {
                continue;
            };
            if let Some(c) = counts.by_source.get_mut(&source) {
                c.chunks = row.get("n");
            }
        }
        counts.files = counts.by_source.values().map(|c| c.files).sum();
        counts.chunks = counts.by_source.values().map(|c| c.chunks).sum();
        Ok(counts)
    }

    // ============ Embedding cache ============

    /// Look up cached embeddings for `hashes`, keyed by hash.
    pub async fn load_cached(
        &self,
        scope: &CacheScope,
        hashes: &[String],
    ) -> Result<HashMap<String, Vec<f32>>> {
        let mut found = HashMap::new();
        for batch in hashes.chunks(CACHE_LOOKUP_BATCH) {
            let placeholders = vec!["?"; batch.len()].join(", ");
            let sql = format!(
                "SELECT hash, embedding FROM embedding_cache WHERE provider = ? AND model = ? AND provider_key = ? AND hash IN ({})",
                placeholders
            );
            let mut query = sqlx::query(&sql)
                .bind(&scope.provider)
                .bind(&scope.model)
                .bind(&scope.provider_key);
            for hash in batch {
                query = query.bind(hash);
            }
            for row in query.fetch_all(&self.pool).await? {
                let blob: Vec<u8> = row.get("embedding");
                found.insert(row.get::<String, _>("hash"), blob_to_vec(&blob));
            }
        }
        Ok(found)
    }

    pub async fn upsert_cached(&self, scope: &CacheScope, entries: &[(String, Vec<f32>)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let now = chrono::Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await?;
        for (hash, embedding) in entries {
            sqlx::query(
                r#"
                INSERT INTO embedding_cache (provider, model, provider_key, hash, embedding, dims, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(provider, model, provider_key, hash) DO UPDATE SET
                    embedding = excluded.embedding,
                    dims = excluded.dims,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&scope.provider)
            .bind(&scope.model)
            .bind(&scope.provider_key)
            .bind(hash)
            .bind(vec_to_blob(embedding))
            .bind(embedding.len() as i64)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn cache_entries(&self) -> Result<i64> {
        let n = sqlx::query_scalar("SELECT COUNT(*) FROM embedding_cache")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// Delete the oldest rows until at most `max_entries` remain.
    pub async fn prune_cache(&self, max_entries: usize) -> Result<u64> {
        let total = self.cache_entries().await?;
        let excess = total - max_entries as i64;
        if excess <= 0 {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            DELETE FROM embedding_cache WHERE rowid IN (
                SELECT rowid FROM embedding_cache ORDER BY updated_at ASC LIMIT ?
            )
            "#,
        )
        .bind(excess)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Copy `other`'s embedding cache into this store. With `dims`, only
    /// vectors of that size are copied.
    pub async fn seed_cache_from(&self, other: &IndexStore, dims: Option<usize>) -> Result<u64> {
        let dims = dims.map(|d| d as i64);
        let rows = sqlx::query(
            r#"
            SELECT provider, model, provider_key, hash, embedding, dims, updated_at
            FROM embedding_cache
            WHERE ? IS NULL OR dims = ?
            "#,
        )
        .bind(dims)
        .bind(dims)
        .fetch_all(&other.pool)
        .await
        .context("Failed to read embedding cache from live index")?;

        let mut tx = self.pool.begin().await?;
        for row in &rows {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO embedding_cache (provider, model, provider_key, hash, embedding, dims, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(row.get::<String, _>("provider"))
            .bind(row.get::<String, _>("model"))
            .bind(row.get::<String, _>("provider_key"))
            .bind(row.get::<String, _>("hash"))
            .bind(row.get::<Vec<u8>, _>("embedding"))
            .bind(row.get::<Option<i64>, _>("dims"))
            .bind(row.get::<i64, _>("updated_at"))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(rows.len() as u64)
    }

    // ============ Retrieval ============

    /// FTS5 search. `fts_query` comes from `build_fts_query`.
    pub async fn keyword_search(
        &self,
        fts_query: &str,
        model: &str,
        sources: &[MemorySource],
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        if !self.fts.available || sources.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            r#"
            SELECT c.id, c.path, c.source, c.start_line, c.end_line, c.text,
                   bm25(chunks_fts) AS rank
            FROM chunks_fts
            JOIN chunks c ON c.id = chunks_fts.id
            WHERE chunks_fts MATCH ? AND c.model = ? AND c.source IN ({})
            ORDER BY rank ASC
            LIMIT ?
            "#,
            source_placeholders(sources)
        );
        let mut query = sqlx::query(&sql).bind(fts_query).bind(model);
        for s in sources {
            query = query.bind(s.as_str());
        }
        let rows = query.bind(limit as i64).fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                row_to_candidate(row, -rank)
            })
            .collect()
    }

    /// Nearest chunks by cosine similarity; scores clamped to `[0, 1]`.
    pub async fn vector_search(
        &self,
        query_vec: &[f32],
        model: &str,
        sources: &[MemorySource],
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        if sources.is_empty() {
            return Ok(Vec::new());
        }
        if self.vector_dims() == Some(query_vec.len()) {
            return self
                .vector_search_extension(query_vec, model, sources, limit)
                .await;
        }

        let sql = format!(
            "SELECT id, path, source, start_line, end_line, text, embedding FROM chunks WHERE model = ? AND source IN ({})",
            source_placeholders(sources)
        );
        let mut query = sqlx::query(&sql).bind(model);
        for s in sources {
            query = query.bind(s.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut candidates = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let similarity = cosine_similarity(query_vec, &blob_to_vec(&blob));
                row_to_candidate(row, vector_score(similarity))
            })
            .collect::<Result<Vec<_>>>()?;

        candidates.sort_by(|a, b| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn vector_search_extension(
        &self,
        query_vec: &[f32],
        model: &str,
        sources: &[MemorySource],
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        let sql = format!(
            r#"
            SELECT c.id, c.path, c.source, c.start_line, c.end_line, c.text,
                   vec_distance_cosine(v.embedding, ?) AS dist
            FROM chunks_vec v
            JOIN chunks c ON c.id = v.id
            WHERE c.model = ? AND c.source IN ({})
            ORDER BY dist ASC
            LIMIT ?
            "#,
            source_placeholders(sources)
        );
        let mut query = sqlx::query(&sql).bind(vec_to_blob(query_vec)).bind(model);
        for s in sources {
            query = query.bind(s.as_str());
        }
        let rows = query.bind(limit as i64).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                let dist: f64 = row.get("dist");
                row_to_candidate(row, (1.0 - dist).clamp(0.0, 1.0))
            })
            .collect()
    }
}

fn source_placeholders(sources: &[MemorySource]) -> String {
    vec!["?"; sources.len()].join(", ")
}

fn row_to_candidate(row: &sqlx::sqlite::SqliteRow, score: f64) -> Result<Candidate> {
    let text: String = row.get("text");
    Ok(Candidate {
        id: row.get("id"),
        path: row.get("path"),
        start_line: row.get::<i64, _>("start_line") as usize,
        end_line: row.get::<i64, _>("end_line") as usize,
        source: row.get::<String, _>("source").parse()?,
        snippet: truncate_snippet(&text),
        raw_score: score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use memory_index_core::chunk::hash_text;

    async fn open_store(dir: &tempfile::TempDir) -> IndexStore {
        IndexStore::open(&dir.path().join("index.sqlite"), true, None)
            .await
            .unwrap()
    }

    fn entry(path: &str, source: MemorySource) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            abs_path: std::path::PathBuf::from(path),
            source,
            hash: hash_text(path),
            mtime_ms: 0,
            size: 10,
        }
    }

    fn chunk(text: &str, line: usize, embedding: Vec<f32>) -> IndexedChunk {
        IndexedChunk {
            chunk: MemoryChunk {
                start_line: line,
                end_line: line,
                text: text.to_string(),
                hash: hash_text(text),
            },
            embedding,
        }
    }

    fn scope() -> CacheScope {
        CacheScope {
            provider: "mock".into(),
            model: "m1".into(),
            provider_key: "k1".into(),
        }
    }

    #[tokio::test]
    async fn test_meta_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        assert!(store.read_meta().await.unwrap().is_none());
        let meta = IndexMeta {
            model: "m1".into(),
            provider: "mock".into(),
            provider_key: "k1".into(),
            chunk_tokens: 400,
            chunk_overlap: 80,
            vector_dims: Some(2),
        };
        store.write_meta(&meta).await.unwrap();
        store.write_meta(&meta).await.unwrap();
        assert_eq!(store.read_meta().await.unwrap(), Some(meta));
    }

    #[tokio::test]
    async fn test_replace_file_replaces_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let e = entry("memory/a.md", MemorySource::Memory);

        store
            .replace_file(&e, &[chunk("alpha one", 1, vec![1.0, 0.0]), chunk("alpha two", 2, vec![0.5, 0.5])], "m1")
            .await
            .unwrap();
        store
            .replace_file(&e, &[chunk("beta", 1, vec![0.0, 1.0])], "m1")
            .await
            .unwrap();

        let counts = store.counts(&[MemorySource::Memory]).await.unwrap();
        assert_eq!(counts.files, 1);
        assert_eq!(counts.chunks, 1);
        assert_eq!(store.file_hash("memory/a.md", MemorySource::Memory).await.unwrap(), Some(e.hash.clone()));

        let hits = store
            .keyword_search("\"alpha\"", "m1", &[MemorySource::Memory], 10)
            .await
            .unwrap();
        assert!(hits.is_empty(), "FTS rows must be replaced with the chunks");
    }

    #[tokio::test]
    async fn test_remove_stale_sweeps_unlisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        for p in ["a.md", "b.md"] {
            store
                .replace_file(&entry(p, MemorySource::Memory), &[chunk(p, 1, vec![1.0])], "m1")
                .await
                .unwrap();
        }
        let removed = store
            .remove_stale(MemorySource::Memory, &["a.md".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, vec!["b.md".to_string()]);
        let counts = store.counts(&[MemorySource::Memory]).await.unwrap();
        assert_eq!((counts.files, counts.chunks), (1, 1));
    }

    #[tokio::test]
    async fn test_counts_by_source() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        store
            .replace_file(&entry("MEMORY.md", MemorySource::Memory), &[chunk("x", 1, vec![1.0])], "m1")
            .await
            .unwrap();
        store
            .replace_file(
                &entry("sessions/s.jsonl", MemorySource::Sessions),
                &[chunk("User: hi", 1, vec![1.0]), chunk("Assistant: yo", 2, vec![1.0])],
                "m1",
            )
            .await
            .unwrap();

        let only_memory = store.counts(&[MemorySource::Memory]).await.unwrap();
        assert_eq!((only_memory.files, only_memory.chunks), (1, 1));

        let both = store
            .counts(&[MemorySource::Memory, MemorySource::Sessions])
            .await
            .unwrap();
        assert_eq!((both.files, both.chunks), (2, 3));
        assert_eq!(both.by_source[&MemorySource::Sessions].chunks, 2);
    }

    #[tokio::test]
    async fn test_cache_upsert_load_and_scope() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        store
            .upsert_cached(&scope(), &[("h1".into(), vec![1.0, 2.0]), ("h2".into(), vec![3.0, 4.0])])
            .await
            .unwrap();

        let found = store
            .load_cached(&scope(), &["h1".into(), "h3".into()])
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found["h1"], vec![1.0, 2.0]);

        let other = CacheScope {
            provider_key: "k2".into(),
            ..scope()
        };
        assert!(store.load_cached(&other, &["h1".into()]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cache_lookup_spans_batches() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let entries: Vec<(String, Vec<f32>)> =
            (0..450).map(|i| (format!("h{}", i), vec![i as f32])).collect();
        store.upsert_cached(&scope(), &entries).await.unwrap();
        let hashes: Vec<String> = entries.iter().map(|(h, _)| h.clone()).collect();
        assert_eq!(store.load_cached(&scope(), &hashes).await.unwrap().len(), 450);
    }

    #[tokio::test]
    async fn test_prune_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        for i in 0..5 {
            store
                .upsert_cached(&scope(), &[(format!("h{}", i), vec![i as f32])])
                .await
                .unwrap();
            sqlx::query("UPDATE embedding_cache SET updated_at = ? WHERE hash = ?")
                .bind(i as i64)
                .bind(format!("h{}", i))
                .execute(store.pool())
                .await
                .unwrap();
        }
        assert_eq!(store.prune_cache(2).await.unwrap(), 3);
        let left = store
            .load_cached(&scope(), &(0..5).map(|i| format!("h{}", i)).collect::<Vec<_>>())
            .await
            .unwrap();
        let mut keys: Vec<_> = left.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["h3".to_string(), "h4".to_string()]);
        assert_eq!(store.prune_cache(10).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_seed_cache_from_other_store() {
        let dir = tempfile::tempdir().unwrap();
        let live = open_store(&dir).await;
        live.upsert_cached(&scope(), &[("h1".into(), vec![1.0])]).await.unwrap();
        let fresh = IndexStore::open(&dir.path().join("fresh.sqlite"), true, None)
            .await
            .unwrap();
        assert_eq!(fresh.seed_cache_from(&live, None).await.unwrap(), 1);
        assert_eq!(fresh.load_cached(&scope(), &["h1".into()]).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_seed_cache_keeps_only_requested_size() {
        let dir = tempfile::tempdir().unwrap();
        let live = open_store(&dir).await;
        live.upsert_cached(&scope(), &[("old".into(), vec![1.0, 0.0, 0.0])])
            .await
            .unwrap();
        live.upsert_cached(&scope(), &[("new".into(), vec![1.0, 0.0])])
            .await
            .unwrap();
        let fresh = IndexStore::open(&dir.path().join("fresh.sqlite"), true, None)
            .await
            .unwrap();
        assert_eq!(fresh.seed_cache_from(&live, Some(2)).await.unwrap(), 1);
        let cached = fresh
            .load_cached(&scope(), &["old".into(), "new".into()])
            .await
            .unwrap();
        assert_eq!(cached.keys().collect::<Vec<_>>(), vec!["new"]);
    }

    #[tokio::test]
    async fn test_keyword_search_scoped_by_model_and_source() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        store
            .replace_file(&entry("a.md", MemorySource::Memory), &[chunk("deploy the cluster", 3, vec![1.0])], "m1")
            .await
            .unwrap();
        store
            .replace_file(&entry("sessions/s.jsonl", MemorySource::Sessions), &[chunk("User: deploy now", 1, vec![1.0])], "m1")
            .await
            .unwrap();
        store
            .replace_file(&entry("b.md", MemorySource::Memory), &[chunk("deploy elsewhere", 1, vec![1.0])], "m2")
            .await
            .unwrap();

        let hits = store
            .keyword_search("\"deploy\"", "m1", &[MemorySource::Memory], 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "a.md");
        assert_eq!(hits[0].start_line, 3);
        assert_eq!(hits[0].source, MemorySource::Memory);
    }

    #[tokio::test]
    async fn test_vector_search_without_extension_ranks_by_cosine() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        store
            .replace_file(
                &entry("a.md", MemorySource::Memory),
                &[chunk("near", 1, vec![1.0, 0.1]), chunk("far", 2, vec![-1.0, 0.0]), chunk("mid", 3, vec![0.5, 0.5])],
                "m1",
            )
            .await
            .unwrap();
        let hits = store
            .vector_search(&[1.0, 0.0], "m1", &[MemorySource::Memory], 2)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].snippet, "near");
        assert_eq!(hits[1].snippet, "mid");
        assert!(hits.iter().all(|h| (0.0..=1.0).contains(&h.raw_score)));
    }
}

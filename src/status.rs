//! Status snapshot returned by [`crate::manager::MemoryIndexManager::status`].

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

use memory_index_core::models::MemorySource;

use crate::store::SourceCount;

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStatus {
    pub agent_id: String,
    pub workspace_dir: PathBuf,
    pub db_path: PathBuf,
    /// Provider in use; differs from `requested_provider` after a fallback.
    pub provider: String,
    pub requested_provider: String,
    pub model: String,
    pub sources: Vec<MemorySource>,
    pub files: i64,
    pub chunks: i64,
    pub source_counts: BTreeMap<MemorySource, SourceCount>,
    pub dirty: bool,
    pub vector: VectorSection,
    pub fts: FtsSection,
    pub cache: CacheSection,
    pub batch: BatchSection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback: Option<FallbackSection>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VectorSection {
    pub enabled: bool,
    pub available: bool,
    pub dims: Option<usize>,
    pub load_error: Option<String>,
    pub extension_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FtsSection {
    pub enabled: bool,
    pub available: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheSection {
    pub enabled: bool,
    pub max_entries: Option<usize>,
    pub entries: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSection {
    pub enabled: bool,
    pub failures: u32,
    pub limit: u32,
    pub last_error: Option<String>,
}

/// Recorded when the primary provider was replaced after an embedding
/// failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FallbackSection {
    pub from: String,
    pub reason: String,
}

impl MemoryStatus {
    /// Plain-text rendering for the CLI.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Agent:      {}\n", self.agent_id));
        out.push_str(&format!("Workspace:  {}\n", self.workspace_dir.display()));
        out.push_str(&format!("Database:   {}\n", self.db_path.display()));
        out.push_str(&format!("Provider:   {} ({})\n", self.provider, self.model));
        if let Some(fb) = &self.fallback {
            out.push_str(&format!("Fallback:   from {} ({})\n", fb.from, fb.reason));
        }
        out.push_str(&format!("Files:      {}\n", self.files));
        out.push_str(&format!("Chunks:     {}\n", self.chunks));
        for (source, counts) in &self.source_counts {
            out.push_str(&format!(
                "  {:<9} {} files, {} chunks\n",
                source.as_str(),
                counts.files,
                counts.chunks
            ));
        }
        out.push_str(&format!("Dirty:      {}\n", self.dirty));
        out.push_str(&format!(
            "Vector:     {}{}\n",
            availability(self.vector.enabled, self.vector.available),
            self.vector
                .dims
                .map(|d| format!(", {} dims", d))
                .unwrap_or_default()
        ));
        if let Some(err) = &self.vector.load_error {
            out.push_str(&format!("  load error: {}\n", err));
        }
        out.push_str(&format!(
            "FTS:        {}\n",
            availability(self.fts.enabled, self.fts.available)
        ));
        if let Some(err) = &self.fts.error {
            out.push_str(&format!("  error: {}\n", err));
        }
        out.push_str(&format!(
            "Cache:      {} ({} entries{})\n",
            if self.cache.enabled { "on" } else { "off" },
            self.cache.entries,
            self.cache
                .max_entries
                .map(|m| format!(", max {}", m))
                .unwrap_or_default()
        ));
        out.push_str(&format!(
            "Batch:      {} ({}/{} failures)\n",
            if self.batch.enabled { "on" } else { "off" },
            self.batch.failures,
            self.batch.limit
        ));
        if let Some(err) = &self.batch.last_error {
            out.push_str(&format!("  last error: {}\n", err));
        }
        out
    }
}

fn availability(enabled: bool, available: bool) -> &'static str {
    match (enabled, available) {
        (false, _) => "disabled",
        (true, true) => "available",
        (true, false) => "unavailable",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MemoryStatus {
        let mut source_counts = BTreeMap::new();
        source_counts.insert(MemorySource::Memory, SourceCount { files: 2, chunks: 5 });
        MemoryStatus {
            agent_id: "main".into(),
            workspace_dir: PathBuf::from("/ws"),
            db_path: PathBuf::from("/db/main.sqlite"),
            provider: "openai".into(),
            requested_provider: "openai".into(),
            model: "text-embedding-3-small".into(),
            sources: vec![MemorySource::Memory],
            files: 2,
            chunks: 5,
            source_counts,
            dirty: false,
            vector: VectorSection {
                enabled: true,
                available: false,
                dims: None,
                load_error: Some("no extension".into()),
                extension_path: None,
            },
            fts: FtsSection {
                enabled: true,
                available: true,
                error: None,
            },
            cache: CacheSection {
                enabled: true,
                max_entries: None,
                entries: 5,
            },
            batch: BatchSection {
                enabled: false,
                failures: 0,
                limit: 2,
                last_error: None,
            },
            fallback: None,
        }
    }

    #[test]
    fn test_json_omits_absent_fallback() {
        let json = serde_json::to_value(sample()).unwrap();
        assert!(json.get("fallback").is_none());
        assert_eq!(json["source_counts"]["memory"]["chunks"], 5);
        assert_eq!(json["vector"]["load_error"], "no extension");
    }

    #[test]
    fn test_render_mentions_degraded_vector() {
        let text = sample().render();
        assert!(text.contains("Vector:     unavailable"));
        assert!(text.contains("memory    2 files, 5 chunks"));
    }
}

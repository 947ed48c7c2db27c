//! Memory file discovery, file entries, and workspace-confined reads.
//!
//! Memory files are `MEMORY.md` / `memory.md` at the workspace root, every
//! `*.md` under `memory/`, and any configured extra paths. Symlinks are
//! never followed.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use memory_index_core::chunk::hash_text;
use memory_index_core::models::{FileEntry, MemorySource};

use crate::error::MemoryError;

const ROOT_MEMORY_FILES: [&str; 2] = ["MEMORY.md", "memory.md"];
const MEMORY_DIR: &str = "memory";

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid exclude glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

fn is_markdown(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("md"))
}

/// Collect `*.md` files under `dir` without following symlinks.
fn walk_markdown(dir: &Path, out: &mut Vec<PathBuf>) {
    for entry in WalkDir::new(dir).follow_links(false).into_iter().flatten() {
        if entry.file_type().is_file() && is_markdown(entry.path()) {
            out.push(entry.into_path());
        }
    }
}

/// Absolute paths of every memory file, deduplicated and sorted.
pub fn list_memory_files(
    workspace: &Path,
    extra_paths: &[PathBuf],
    exclude_globs: &[String],
) -> Result<Vec<PathBuf>> {
    let excludes = build_globset(exclude_globs)?;
    let mut found = Vec::new();

    for name in ROOT_MEMORY_FILES {
        let path = workspace.join(name);
        if let Ok(meta) = std::fs::symlink_metadata(&path) {
            if meta.file_type().is_file() {
                found.push(path);
            }
        }
    }
    let memory_dir = workspace.join(MEMORY_DIR);
    if memory_dir.is_dir() {
        walk_markdown(&memory_dir, &mut found);
    }
    for extra in extra_paths {
        let extra = if extra.is_absolute() {
            extra.clone()
        } else {
            workspace.join(extra)
        };
        let Ok(meta) = std::fs::symlink_metadata(&extra) else {
            continue;
        };
        if meta.is_dir() {
            walk_markdown(&extra, &mut found);
        } else if meta.file_type().is_file() && is_markdown(&extra) {
            found.push(extra);
        }
    }

    // Case-insensitive filesystems report MEMORY.md and memory.md as one file.
    let mut seen = BTreeSet::new();
    let mut files: Vec<PathBuf> = found
        .into_iter()
        .filter(|p| {
            let rel = relative_path(p, workspace);
            !excludes.is_match(&rel)
        })
        .filter(|p| seen.insert(std::fs::canonicalize(p).unwrap_or_else(|_| p.clone())))
        .collect();
    files.sort();
    Ok(files)
}

/// `path` relative to `base`, with forward slashes. Paths outside `base`
/// climb with `..`.
pub fn relative_path(path: &Path, base: &Path) -> String {
    if let Ok(rel) = path.strip_prefix(base) {
        return normalize_rel_path(&rel.to_string_lossy());
    }
    let path_parts: Vec<Component> = path.components().collect();
    let base_parts: Vec<Component> = base.components().collect();
    let common = path_parts
        .iter()
        .zip(base_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut parts: Vec<String> = vec!["..".to_string(); base_parts.len() - common];
    parts.extend(
        path_parts[common..]
            .iter()
            .map(|c| c.as_os_str().to_string_lossy().to_string()),
    );
    parts.join("/")
}

/// Forward slashes, no leading `./` or `/`.
pub fn normalize_rel_path(raw: &str) -> String {
    let unified = raw.trim().replace('\\', "/");
    let mut s = unified.as_str();
    loop {
        if let Some(rest) = s.strip_prefix("./") {
            s = rest;
        } else if let Some(rest) = s.strip_prefix('/') {
            s = rest;
        } else {
            break;
        }
    }
    s.to_string()
}

/// A file's entry together with the exact text that was hashed, so the
/// chunks stored for a hash always come from that content.
#[derive(Debug, Clone)]
pub struct SourceFile {
    pub entry: FileEntry,
    pub content: String,
}

pub(crate) fn mtime_ms(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Read a file once and hash its text. Invalid UTF-8 is replaced rather
/// than rejected.
pub async fn build_file_entry(abs_path: &Path, rel_path: String, source: MemorySource) -> Result<SourceFile> {
    let meta = tokio::fs::metadata(abs_path)
        .await
        .with_context(|| format!("Failed to stat {}", abs_path.display()))?;
    let raw = tokio::fs::read(abs_path)
        .await
        .with_context(|| format!("Failed to read {}", abs_path.display()))?;
    let content = String::from_utf8_lossy(&raw).into_owned();
    Ok(SourceFile {
        entry: FileEntry {
            path: rel_path,
            abs_path: abs_path.to_path_buf(),
            source,
            hash: hash_text(&content),
            mtime_ms: mtime_ms(&meta),
            size: meta.len(),
        },
        content,
    })
}

/// Load a memory file, with its path relative to the workspace.
pub async fn memory_file_entry(abs_path: &Path, workspace: &Path) -> Result<SourceFile> {
    build_file_entry(abs_path, relative_path(abs_path, workspace), MemorySource::Memory).await
}

#[derive(Debug, Clone)]
pub struct ReadFileRequest {
    pub rel_path: String,
    /// 1-based first line; `None` reads from the start.
    pub from: Option<usize>,
    /// Number of lines; `None` reads to the end.
    pub lines: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadFileResult {
    pub text: String,
    pub path: String,
}

/// Lexically resolve `.` and `..` without touching the filesystem.
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn escapes(rel: &Path) -> bool {
    let mut depth: i64 = 0;
    for component in rel.components() {
        match component {
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return true;
                }
            }
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => return true,
        }
    }
    false
}

/// Resolve `rel_path` to a markdown file inside `workspace` or one of
/// `extra_paths`. Both the lexical path and its canonical form (after
/// symlinks) must stay inside an allowed root.
pub fn resolve_read_path(workspace: &Path, extra_paths: &[PathBuf], rel_path: &str) -> Result<PathBuf> {
    let raw = rel_path.trim();
    if raw.is_empty() {
        return Err(MemoryError::InvalidPath("empty path".into()).into());
    }
    let requested = Path::new(raw);
    let roots: Vec<PathBuf> = std::iter::once(workspace.to_path_buf())
        .chain(extra_paths.iter().map(|p| {
            if p.is_absolute() {
                p.clone()
            } else {
                workspace.join(p)
            }
        }))
        .map(|p| lexical_normalize(&p))
        .collect();

    let candidate = if requested.is_absolute() {
        lexical_normalize(requested)
    } else {
        if escapes(requested) {
            return Err(MemoryError::PathOutsideWorkspace(raw.to_string()).into());
        }
        lexical_normalize(&workspace.join(requested))
    };
    if !roots.iter().any(|root| candidate.starts_with(root)) {
        return Err(MemoryError::PathOutsideWorkspace(raw.to_string()).into());
    }
    if !is_markdown(&candidate) {
        return Err(MemoryError::InvalidPath(format!("{} (only .md files can be read)", raw)).into());
    }
    if !candidate.exists() {
        return Err(MemoryError::NotFound(candidate).into());
    }

    let canonical = std::fs::canonicalize(&candidate)?;
    let canonical_roots: Vec<PathBuf> = roots
        .iter()
        .filter_map(|r| std::fs::canonicalize(r).ok())
        .collect();
    if !canonical_roots.iter().any(|root| canonical.starts_with(root)) {
        return Err(MemoryError::PathOutsideWorkspace(raw.to_string()).into());
    }
    if !canonical.is_file() {
        bail!("{} is not a file", raw);
    }
    Ok(canonical)
}

/// Read a memory file, optionally a line window of it.
pub fn read_memory_file(
    workspace: &Path,
    extra_paths: &[PathBuf],
    request: &ReadFileRequest,
) -> Result<ReadFileResult> {
    let path = resolve_read_path(workspace, extra_paths, &request.rel_path)?;
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let text = match (request.from, request.lines) {
        (None, None) => content,
        (from, lines) => {
            let skip = from.unwrap_or(1).max(1) - 1;
            let take = lines.unwrap_or(usize::MAX);
            content
                .lines()
                .skip(skip)
                .take(take)
                .collect::<Vec<_>>()
                .join("\n")
        }
    };
    Ok(ReadFileResult {
        text,
        path: normalize_rel_path(&request.rel_path),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn workspace() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("MEMORY.md"), "# root\n").unwrap();
        fs::create_dir_all(dir.path().join("memory/daily")).unwrap();
        fs::write(dir.path().join("memory/a.md"), "alpha\n").unwrap();
        fs::write(dir.path().join("memory/daily/2026-01-01.md"), "day\n").unwrap();
        fs::write(dir.path().join("memory/notes.txt"), "skip\n").unwrap();
        fs::write(dir.path().join("README.md"), "not memory\n").unwrap();
        dir
    }

    fn rels(dir: &TempDir, files: &[PathBuf]) -> Vec<String> {
        files.iter().map(|p| relative_path(p, dir.path())).collect()
    }

    #[test]
    fn test_lists_memory_files_only() {
        let dir = workspace();
        let files = list_memory_files(dir.path(), &[], &[]).unwrap();
        let names = rels(&dir, &files);
        assert!(names.contains(&"MEMORY.md".to_string()));
        assert!(names.contains(&"memory/a.md".to_string()));
        assert!(names.contains(&"memory/daily/2026-01-01.md".to_string()));
        assert!(!names.iter().any(|n| n.ends_with(".txt") || n == "README.md"));
        let mut sorted = files.clone();
        sorted.sort();
        assert_eq!(files, sorted);
    }

    #[test]
    fn test_excludes_and_extra_paths() {
        let dir = workspace();
        fs::create_dir_all(dir.path().join("notes")).unwrap();
        fs::write(dir.path().join("notes/extra.md"), "extra\n").unwrap();
        let files = list_memory_files(
            dir.path(),
            &[PathBuf::from("notes")],
            &["memory/daily/**".to_string()],
        )
        .unwrap();
        let names = rels(&dir, &files);
        assert!(names.contains(&"notes/extra.md".to_string()));
        assert!(!names.iter().any(|n| n.starts_with("memory/daily")));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_not_followed() {
        let dir = workspace();
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret.md"), "secret\n").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("memory/linked")).unwrap();
        let files = list_memory_files(dir.path(), &[], &[]).unwrap();
        assert!(!rels(&dir, &files).iter().any(|n| n.contains("linked")));
    }

    #[tokio::test]
    async fn test_entry_hash_is_content_only() {
        let dir = workspace();
        let a = memory_file_entry(&dir.path().join("memory/a.md"), dir.path()).await.unwrap();
        fs::write(dir.path().join("memory/b.md"), "alpha\n").unwrap();
        let b = memory_file_entry(&dir.path().join("memory/b.md"), dir.path()).await.unwrap();
        assert_eq!(a.entry.hash, b.entry.hash);
        assert_eq!(a.entry.path, "memory/a.md");
        assert_eq!(a.entry.size, 6);
        assert_eq!(a.content, "alpha\n");
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_replaced() {
        let dir = workspace();
        let path = dir.path().join("memory/latin1.md");
        fs::write(&path, b"caf\xe9 notes").unwrap();
        let file = memory_file_entry(&path, dir.path()).await.unwrap();
        assert_eq!(file.content, "caf\u{FFFD} notes");
        assert_eq!(file.entry.hash, hash_text(&file.content));
        assert_eq!(file.entry.size, 10);
    }

    #[test]
    fn test_read_window() {
        let dir = workspace();
        fs::write(dir.path().join("memory/lines.md"), "one\ntwo\nthree\nfour\n").unwrap();
        let out = read_memory_file(
            dir.path(),
            &[],
            &ReadFileRequest {
                rel_path: "memory/lines.md".into(),
                from: Some(2),
                lines: Some(2),
            },
        )
        .unwrap();
        assert_eq!(out.text, "two\nthree");
        assert_eq!(out.path, "memory/lines.md");
    }

    #[test]
    fn test_read_rejects_escape_and_non_markdown() {
        let dir = workspace();
        for bad in ["../outside.md", "/etc/passwd", "memory/../../x.md"] {
            let err = read_memory_file(
                dir.path(),
                &[],
                &ReadFileRequest {
                    rel_path: bad.into(),
                    from: None,
                    lines: None,
                },
            )
            .unwrap_err();
            assert!(
                matches!(err.downcast_ref::<MemoryError>(), Some(MemoryError::PathOutsideWorkspace(_))),
                "{}: {}",
                bad,
                err
            );
        }
        let err = read_memory_file(
            dir.path(),
            &[],
            &ReadFileRequest {
                rel_path: "memory/notes.txt".into(),
                from: None,
                lines: None,
            },
        )
        .unwrap_err();
        assert!(matches!(err.downcast_ref::<MemoryError>(), Some(MemoryError::InvalidPath(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_read_rejects_symlink_escape() {
        let dir = workspace();
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("secret.md"), "secret\n").unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("secret.md"),
            dir.path().join("memory/escape.md"),
        )
        .unwrap();
        let err = read_memory_file(
            dir.path(),
            &[],
            &ReadFileRequest {
                rel_path: "memory/escape.md".into(),
                from: None,
                lines: None,
            },
        )
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MemoryError>(),
            Some(MemoryError::PathOutsideWorkspace(_))
        ));
    }

    #[test]
    fn test_relative_path_outside_base() {
        assert_eq!(
            relative_path(Path::new("/a/b/c.md"), Path::new("/a/d")),
            "../b/c.md"
        );
        assert_eq!(normalize_rel_path("./memory\\x.md"), "memory/x.md");
    }
}

//! Local filesystem lister.
//!
//! Walks `root` recursively, applying include/exclude globs on paths
//! relative to the root. Document ids are those relative paths, so a
//! rename or move is seen as one deletion plus one new document.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use docsync_core::models::SourceDocument;
use futures::stream::{self, StreamExt};
use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::config::FilesystemSourceConfig;
use crate::lister::{DocumentStream, SourceLister};

pub struct FilesystemLister {
    scope: String,
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    follow_symlinks: bool,
}

impl FilesystemLister {
    pub fn new(scope: String, config: &FilesystemSourceConfig) -> Result<Self> {
        let mut excludes = vec!["**/.git/**".to_string(), "**/node_modules/**".to_string()];
        excludes.extend(config.exclude_globs.iter().cloned());
        Ok(Self {
            scope,
            root: config.root.clone(),
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&excludes)?,
            follow_symlinks: config.follow_symlinks,
        })
    }

    fn describe(&self, path: &Path) -> Option<Result<SourceDocument>> {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        let rel = relative.to_string_lossy().replace('\\', "/");
        if self.exclude.is_match(&rel) || !self.include.is_match(&rel) {
            return None;
        }
        Some(file_document(path, &rel))
    }
}

fn file_document(path: &Path, relative: &str) -> Result<SourceDocument> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?;
    // Millisecond resolution, the finest every index backend keeps.
    let modified: DateTime<Utc> = metadata
        .modified()
        .map(|t| DateTime::<Utc>::from(t).trunc_subsecs(3))
        .unwrap_or_default();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| relative.to_string());
    Ok(
        SourceDocument::new(relative, name, relative, metadata.len(), modified)
            .with_url(format!("file://{}", path.display())),
    )
}

#[async_trait]
impl SourceLister for FilesystemLister {
    fn scope(&self) -> &str {
        &self.scope
    }

    fn list(&self) -> DocumentStream<'_> {
        if !self.root.is_dir() {
            let err = anyhow::anyhow!(
                "filesystem root does not exist: {}",
                self.root.display()
            );
            return stream::once(async move { Err(err) }).boxed();
        }
        let walker = WalkDir::new(&self.root)
            .follow_links(self.follow_symlinks)
            .sort_by_file_name()
            .into_iter();
        stream::iter(walker.filter_map(move |entry| match entry {
            Ok(entry) if entry.file_type().is_file() => self.describe(entry.path()),
            Ok(_) => None,
            Err(e) => Some(Err(anyhow::Error::new(e).context("filesystem walk failed"))),
        }))
        .boxed()
    }

    async fn fetch(&self, doc: &SourceDocument) -> Result<Vec<u8>> {
        if Path::new(&doc.id)
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            bail!("refusing to read outside the root: {}", doc.id);
        }
        let path = self.root.join(&doc.id);
        tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid glob '{}'", pattern))?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use std::fs;

    fn lister(root: &Path, exclude: &[&str]) -> FilesystemLister {
        let config = FilesystemSourceConfig {
            root: root.to_path_buf(),
            include_globs: vec!["**/*".to_string()],
            exclude_globs: exclude.iter().map(|s| s.to_string()).collect(),
            follow_symlinks: false,
        };
        FilesystemLister::new("filesystem:test".to_string(), &config).unwrap()
    }

    #[tokio::test]
    async fn lists_nested_files_with_relative_ids() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("sub/deeper")).unwrap();
        fs::write(tmp.path().join("a.txt"), "a").unwrap();
        fs::write(tmp.path().join("sub/deeper/b.PDF"), "b").unwrap();
        fs::write(tmp.path().join("sub/skip.log"), "x").unwrap();

        let l = lister(tmp.path(), &["**/*.log"]);
        let docs: Vec<SourceDocument> = l.list().try_collect().await.unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a.txt", "sub/deeper/b.PDF"]);
        assert_eq!(docs[1].extension, "pdf");
        assert_eq!(docs[1].name, "b.PDF");
        assert_eq!(l.fetch(&docs[1]).await.unwrap(), b"b");
    }

    #[tokio::test]
    async fn missing_root_fails_the_listing() {
        let l = lister(Path::new("/definitely/not/here"), &[]);
        let result: Result<Vec<SourceDocument>> = l.list().try_collect().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn fetch_rejects_parent_components() {
        let tmp = tempfile::TempDir::new().unwrap();
        let l = lister(tmp.path(), &[]);
        let doc = SourceDocument::new("../x", "x", "../x", 0, Utc::now());
        assert!(l.fetch(&doc).await.is_err());
    }
}

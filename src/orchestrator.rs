//! Drives one synchronization run.
//!
//! ```text
//! Idle ─► Listing ─► Processing ─► Reconciling ─► Done
//!            │                          │
//!            └──────────► Failed ◄──────┘
//! ```
//!
//! Listed documents are handed to a fixed pool of `concurrency` workers
//! through a bounded queue while the listing is still being consumed, so
//! a slow listing and slow documents overlap. The run is in `Processing`
//! from the end of the listing until the last worker has finished, and
//! reconciliation only starts after that.
//!
//! | Situation | Outcome |
//! |-----------|---------|
//! | extension not in the allow-list | not processed, never purged |
//! | one document fails to fetch, transform, extract or upsert | counted, run continues |
//! | a worker panics | counted as a failure, outcomes already recorded are kept |
//! | listing fails (at any page) | in-flight work finishes, purge skipped, `Failed` |
//! | cancellation | no new documents start, in-flight finish, `Failed` |
//! | index id set unavailable | `Failed` |
//! | single purge fails | counted, run continues |

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use docsync_core::models::SourceDocument;
use docsync_core::reconcile::IndexReconciler;
use docsync_core::rules::{chain_hash, TransformRuleEngine};
use docsync_core::store::SearchIndex;
use futures::StreamExt;
use serde::{Serialize, Serializer};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::backend::open_index;
use crate::config::{Config, SyncSettings};
use crate::error::{DocumentError, RelocationError, SyncError};
use crate::lister::{build_lister, AllowList, SourceLister};
use crate::progress::{NoProgress, SyncProgressEvent, SyncProgressReporter};
use crate::relocation::build_storage;
use crate::secrets::SecretProvider;
use crate::transform::{OperationRegistry, TransformExecutor, TransformedArtifact};
use crate::writer::IndexWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Listing,
    Processing,
    Reconciling,
    Done,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Listing => "listing",
            RunState::Processing => "processing",
            RunState::Reconciling => "reconciling",
            RunState::Done => "done",
            RunState::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-run switches.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Ignore stored fingerprints and re-process everything.
    pub full: bool,
    /// List and resolve rules only; nothing is fetched, written or purged.
    pub dry_run: bool,
    /// Skip reconciliation.
    pub no_purge: bool,
    pub concurrency: usize,
    pub progress_interval: u64,
    pub max_content_bytes: usize,
}

impl SyncOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_content_bytes: config.index.max_content_bytes,
            ..Self::from_settings(&config.sync)
        }
    }

    pub fn from_settings(settings: &SyncSettings) -> Self {
        Self {
            full: settings.full,
            dry_run: false,
            no_purge: false,
            concurrency: settings.concurrency.max(1),
            progress_interval: settings.progress_interval,
            max_content_bytes: usize::MAX,
        }
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from_settings(&SyncSettings::default())
    }
}

/// A document or index entry that could not be handled, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedItem {
    pub name: String,
    pub error: String,
}

/// Record of one run, printed by the CLI and optionally written as JSON.
#[derive(Debug, Serialize)]
pub struct SyncSummary {
    pub run_id: Uuid,
    pub scope: String,
    pub started_at: DateTime<Utc>,
    pub state: RunState,
    /// Set when `state` is `Failed`.
    #[serde(serialize_with = "error_message")]
    pub error: Option<SyncError>,
    /// Distinct documents in the listing that passed the allow-list.
    pub listed: u64,
    /// Documents present at the source whose extension is not allowed.
    pub excluded: u64,
    /// Documents written to the index (or found unchanged).
    pub succeeded: u64,
    pub skipped_unchanged: u64,
    /// Documents that would have been processed (dry run).
    pub planned: u64,
    pub failed: u64,
    pub failed_documents: Vec<FailedItem>,
    /// Successful `move` uploads, including those of documents that then
    /// failed to index.
    pub relocated: u64,
    pub relocation_failures: Vec<FailedItem>,
    /// Index entries with no counterpart in the listing.
    pub stale: u64,
    pub purged: u64,
    pub purge_failed: u64,
    pub purge_failures: Vec<FailedItem>,
    #[serde(rename = "duration_ms", serialize_with = "duration_ms")]
    pub duration: Duration,
}

fn error_message<S: Serializer>(error: &Option<SyncError>, s: S) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => s.serialize_some(&e.to_string()),
        None => s.serialize_none(),
    }
}

fn duration_ms<S: Serializer>(duration: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

impl SyncSummary {
    fn new(run_id: Uuid, scope: String) -> Self {
        Self {
            run_id,
            scope,
            started_at: Utc::now(),
            state: RunState::Idle,
            error: None,
            listed: 0,
            excluded: 0,
            succeeded: 0,
            skipped_unchanged: 0,
            planned: 0,
            failed: 0,
            failed_documents: Vec::new(),
            relocated: 0,
            relocation_failures: Vec::new(),
            stale: 0,
            purged: 0,
            purge_failed: 0,
            purge_failures: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    /// Summary of a run that never started because the source is disabled.
    pub fn disabled(scope: String) -> Self {
        let mut summary = Self::new(Uuid::new_v4(), scope);
        summary.state = RunState::Done;
        summary
    }

    pub fn is_success(&self) -> bool {
        self.state == RunState::Done
    }

    /// Write the summary as pretty-printed JSON, creating parent
    /// directories as needed.
    pub async fn write_json(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("failed to write run summary to {}", path.display()))?;
        debug!(path = %path.display(), "run summary written");
        Ok(())
    }

    fn transition(&mut self, to: RunState) {
        info!(from = %self.state, to = %to, "run state");
        self.state = to;
    }

    fn record(&mut self, name: String, outcome: DocOutcome) {
        let relocations = match outcome {
            DocOutcome::Indexed(relocations) => {
                self.succeeded += 1;
                relocations
            }
            DocOutcome::Unchanged => {
                self.succeeded += 1;
                self.skipped_unchanged += 1;
                return;
            }
            DocOutcome::Planned => {
                self.planned += 1;
                return;
            }
            DocOutcome::Failed(e, relocations) => {
                warn!(document = %name, error = %e, "document failed");
                self.failed += 1;
                self.failed_documents.push(FailedItem {
                    name: name.clone(),
                    error: e.to_string(),
                });
                relocations
            }
        };
        self.relocated += relocations.done as u64;
        self.relocation_failures
            .extend(relocations.failures.into_iter().map(|e| FailedItem {
                name: name.clone(),
                error: e.to_string(),
            }));
    }

    fn fail(mut self, err: SyncError, started: Instant) -> Self {
        error!(error = %err, "run failed");
        self.transition(RunState::Failed);
        self.error = Some(err);
        self.duration = started.elapsed();
        self
    }

    fn done(mut self, started: Instant) -> Self {
        self.transition(RunState::Done);
        self.duration = started.elapsed();
        info!(
            listed = self.listed,
            excluded = self.excluded,
            succeeded = self.succeeded,
            skipped_unchanged = self.skipped_unchanged,
            failed = self.failed,
            relocated = self.relocated,
            purged = self.purged,
            purge_failed = self.purge_failed,
            duration_ms = self.duration.as_millis() as u64,
            "sync complete"
        );
        self
    }
}

// ============ Per-document work ============

/// Everything a worker needs to process one document.
struct Pipeline {
    lister: Arc<dyn SourceLister>,
    index: Arc<dyn SearchIndex>,
    rules: TransformRuleEngine,
    executor: TransformExecutor,
    writer: IndexWriter,
    full: bool,
    dry_run: bool,
}

/// `move` results of one document, kept whether or not it gets indexed.
#[derive(Default)]
struct Relocations {
    done: usize,
    failures: Vec<RelocationError>,
}

enum DocOutcome {
    Indexed(Relocations),
    Unchanged,
    Planned,
    Failed(DocumentError, Relocations),
}

impl Pipeline {
    async fn process(&self, doc: &SourceDocument) -> DocOutcome {
        match self.try_process(doc).await {
            Ok(outcome) => outcome,
            Err(e) => DocOutcome::Failed(e, Relocations::default()),
        }
    }

    async fn try_process(&self, doc: &SourceDocument) -> Result<DocOutcome, DocumentError> {
        let rules = self.rules.resolve(&doc.extension);
        if !self.full {
            let id = self.writer.index_id(&doc.id);
            match self.index.fingerprint(&id).await {
                Ok(Some(fp)) if fp.matches(doc, &chain_hash(rules)) => {
                    debug!(document = %doc.path, "unchanged since last run");
                    return Ok(DocOutcome::Unchanged);
                }
                Ok(_) => {}
                Err(e) => warn!(
                    document = %doc.path,
                    error = %format!("{:#}", e),
                    "fingerprint lookup failed, re-processing"
                ),
            }
        }

        if self.dry_run {
            let ops: Vec<&str> = rules.iter().map(|r| r.operation.as_str()).collect();
            info!(document = %doc.path, rules = ?ops, "would index");
            return Ok(DocOutcome::Planned);
        }

        let raw = self
            .lister
            .fetch(doc)
            .await
            .map_err(|e| DocumentError::Fetch(format!("{:#}", e)))?;
        let artifact = self.executor.apply(doc, &raw, rules).await?;
        let written = self.write(doc, &raw, &artifact).await;
        let relocations = Relocations {
            done: artifact.relocated(),
            failures: artifact.relocation_failures,
        };
        Ok(match written {
            Ok(()) => DocOutcome::Indexed(relocations),
            Err(e) => DocOutcome::Failed(e, relocations),
        })
    }

    async fn write(
        &self,
        doc: &SourceDocument,
        raw: &[u8],
        artifact: &TransformedArtifact,
    ) -> Result<(), DocumentError> {
        let indexed = self.writer.build(doc, raw, artifact).await?;
        self.writer.upsert(&indexed).await?;
        debug!(document = %doc.path, id = %indexed.id, "indexed");
        Ok(())
    }
}

struct ProgressState {
    scope: String,
    reporter: Arc<dyn SyncProgressReporter>,
    interval: u64,
    listed: AtomicU64,
    done: AtomicU64,
    failed: AtomicU64,
}

impl ProgressState {
    fn document_done(&self, failed: bool) {
        if failed {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        if self.interval > 0 && done % self.interval == 0 {
            let listed = self.listed.load(Ordering::Relaxed);
            let failed = self.failed.load(Ordering::Relaxed);
            info!(done, listed, failed, "progress");
            self.reporter.report(SyncProgressEvent::Processing {
                scope: self.scope.clone(),
                done,
                listed,
                failed,
            });
        }
    }
}

/// Outcomes leave the worker one document at a time, so a worker that
/// dies mid-run loses only the document it was holding.
type OutcomeSender = mpsc::UnboundedSender<(String, DocOutcome)>;

async fn worker(
    pipeline: Arc<Pipeline>,
    jobs: Arc<Mutex<mpsc::Receiver<SourceDocument>>>,
    outcomes: OutcomeSender,
    progress: Arc<ProgressState>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let next = jobs.lock().await.recv().await;
        let Some(doc) = next else { break };
        if cancel.is_cancelled() {
            break;
        }
        let outcome = pipeline.process(&doc).await;
        progress.document_done(matches!(outcome, DocOutcome::Failed(..)));
        if outcomes.send((doc.path, outcome)).is_err() {
            break;
        }
    }
}

// ============ Orchestrator ============

pub struct SyncOrchestrator {
    pipeline: Arc<Pipeline>,
    allow: AllowList,
    options: SyncOptions,
    progress: Arc<dyn SyncProgressReporter>,
}

impl SyncOrchestrator {
    pub fn new(
        lister: Arc<dyn SourceLister>,
        index: Arc<dyn SearchIndex>,
        rules: TransformRuleEngine,
        executor: TransformExecutor,
        options: SyncOptions,
    ) -> Self {
        let writer = IndexWriter::new(index.clone(), lister.scope(), options.max_content_bytes);
        Self {
            pipeline: Arc::new(Pipeline {
                lister,
                index,
                rules,
                executor,
                writer,
                full: options.full,
                dry_run: options.dry_run,
            }),
            allow: AllowList::default(),
            options,
            progress: Arc::new(NoProgress),
        }
    }

    /// Wire up the configured source, index, rules and relocation target.
    pub async fn from_config(
        config: &Config,
        secrets: &dyn SecretProvider,
        options: SyncOptions,
    ) -> Result<Self, SyncError> {
        let lister = build_lister(config, secrets).await?;
        let index = open_index(config, secrets).await?;
        let storage = build_storage(&config.relocation, secrets)
            .await
            .map_err(|e| SyncError::config(format!("{:#}", e)))?;
        if let Some(ref storage) = storage {
            info!(destination = %storage.describe(), "relocation enabled");
        }
        let executor = TransformExecutor::new(OperationRegistry::with_builtins(), storage.map(Arc::from));
        Ok(Self::new(
            Arc::from(lister),
            index,
            TransformRuleEngine::new(&config.transform),
            executor,
            options,
        )
        .with_allow_list(AllowList::new(&config.source.allowed_formats)))
    }

    /// Only documents whose extension passes `allow` are processed.
    pub fn with_allow_list(mut self, allow: AllowList) -> Self {
        self.allow = allow;
        self
    }

    pub fn with_progress(mut self, reporter: Arc<dyn SyncProgressReporter>) -> Self {
        self.progress = reporter;
        self
    }

    pub fn scope(&self) -> &str {
        self.pipeline.writer.scope()
    }

    /// Run one full pass: list, process, reconcile.
    pub async fn run(&self, cancel: CancellationToken) -> SyncSummary {
        let run_id = Uuid::new_v4();
        let scope = self.scope().to_string();
        let span = info_span!("sync", run_id = %run_id, scope = %scope);
        self.run_inner(run_id, scope, cancel).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, scope: String, cancel: CancellationToken) -> SyncSummary {
        let started = Instant::now();
        let mut summary = SyncSummary::new(run_id, scope.clone());
        info!(
            full = self.options.full,
            dry_run = self.options.dry_run,
            concurrency = self.options.concurrency,
            "starting sync"
        );

        summary.transition(RunState::Listing);
        self.progress.report(SyncProgressEvent::Listing {
            scope: scope.clone(),
        });

        let progress = Arc::new(ProgressState {
            scope: scope.clone(),
            reporter: self.progress.clone(),
            interval: self.options.progress_interval,
            listed: AtomicU64::new(0),
            done: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });
        let concurrency = self.options.concurrency.max(1);
        let (tx, rx) = mpsc::channel::<SourceDocument>(concurrency);
        let rx = Arc::new(Mutex::new(rx));
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
        let mut workers = JoinSet::new();
        for _ in 0..concurrency {
            workers.spawn(
                worker(
                    self.pipeline.clone(),
                    rx.clone(),
                    outcome_tx.clone(),
                    progress.clone(),
                    cancel.clone(),
                )
                .instrument(Span::current()),
            );
        }
        // Workers own the only handles now: if they all die, sends fail.
        drop(rx);
        drop(outcome_tx);

        // Every id still present at the source, allowed or not.
        let mut current_ids = HashSet::new();
        let mut listing_error = None;
        {
            let mut stream = self.pipeline.lister.list();
            loop {
                let item = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        listing_error = Some(SyncError::Cancelled);
                        break;
                    }
                    item = stream.next() => item,
                };
                let doc = match item {
                    None => break,
                    Some(Ok(doc)) => doc,
                    Some(Err(e)) => {
                        let msg = format!("{:#}", e);
                        error!(error = %msg, listed = summary.listed, "listing failed");
                        listing_error = Some(SyncError::SourceUnavailable(msg));
                        break;
                    }
                };
                if !current_ids.insert(self.pipeline.writer.index_id(&doc.id)) {
                    warn!(document = %doc.path, "document listed twice, ignoring repeat");
                    continue;
                }
                if !self.allow.allows(&doc.extension) {
                    debug!(document = %doc.path, "extension not allowed, skipping");
                    summary.excluded += 1;
                    continue;
                }
                summary.listed += 1;
                progress.listed.fetch_add(1, Ordering::Relaxed);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        listing_error = Some(SyncError::Cancelled);
                        break;
                    }
                    sent = tx.send(doc) => {
                        if sent.is_err() {
                            listing_error = Some(SyncError::SourceUnavailable(
                                "document workers stopped".to_string(),
                            ));
                            break;
                        }
                    }
                }
            }
        }
        drop(tx);
        info!(listed = summary.listed, excluded = summary.excluded, "listing finished");

        if listing_error.is_none() {
            summary.transition(RunState::Processing);
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "document worker aborted");
                summary.failed += 1;
                summary.failed_documents.push(FailedItem {
                    name: "(worker)".to_string(),
                    error: format!("document worker aborted: {}", e),
                });
            }
        }
        while let Some((name, outcome)) = outcome_rx.recv().await {
            summary.record(name, outcome);
        }

        if listing_error.is_none() && cancel.is_cancelled() {
            listing_error = Some(SyncError::Cancelled);
        }
        if let Some(err) = listing_error {
            warn!("skipping reconciliation after incomplete run");
            return summary.fail(err, started);
        }

        summary.transition(RunState::Reconciling);
        if self.options.no_purge {
            info!("purge disabled, skipping reconciliation");
            return summary.done(started);
        }

        let reconciler = IndexReconciler::new(self.pipeline.index.as_ref());
        if self.options.dry_run {
            match reconciler.stale_ids(&current_ids, &scope).await {
                Ok((_, stale)) => {
                    for id in &stale {
                        info!(id = %id, "would purge");
                    }
                    summary.stale = stale.len() as u64;
                }
                Err(e) => {
                    return summary.fail(SyncError::IndexUnavailable(format!("{:#}", e)), started)
                }
            }
        } else {
            match reconciler.purge(&current_ids, &scope).await {
                Ok(report) => {
                    summary.purged = report.removed as u64;
                    summary.purge_failed = report.failures.len() as u64;
                    summary.stale = summary.purged + summary.purge_failed;
                    summary.purge_failures = report
                        .failures
                        .into_iter()
                        .map(|f| FailedItem {
                            name: f.id,
                            error: f.error,
                        })
                        .collect();
                }
                Err(e) => {
                    return summary.fail(SyncError::IndexUnavailable(format!("{:#}", e)), started)
                }
            }
        }
        self.progress.report(SyncProgressEvent::Reconciling {
            scope,
            stale: summary.stale,
        });

        summary.done(started)
    }
}

/// Run a sync for the configured source.
///
/// A disabled source is a successful no-op: nothing is listed, written
/// or purged. Errors returned here happened before the run started.
pub async fn run_from_config(
    config: &Config,
    secrets: &dyn SecretProvider,
    options: SyncOptions,
    reporter: Arc<dyn SyncProgressReporter>,
    cancel: CancellationToken,
) -> Result<SyncSummary, SyncError> {
    if !config.source.enabled {
        info!(scope = %config.source.scope(), "source connector disabled, nothing to do");
        return Ok(SyncSummary::disabled(config.source.scope()));
    }
    let orchestrator = SyncOrchestrator::from_config(config, secrets, options)
        .await?
        .with_progress(reporter);
    Ok(orchestrator.run(cancel).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lister::testing::StaticLister;
    use crate::lister::DocumentStream;
    use crate::paginate::fixtures::pdf_with_pages;
    use crate::secrets::EnvSecretProvider;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use docsync_core::models::{derive_index_id, DocumentFingerprint, IndexedDocument};
    use crate::relocation::{LocalDirStorage, SecondaryStorage};
    use docsync_core::rules::{TransformConfig, TransformRule, OP_MAX_PAGES, OP_MOVE};
    use docsync_core::store::memory::InMemoryIndex;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Semaphore;

    const SCOPE: &str = "filesystem:test";

    fn text_doc(name: &str, body: &str) -> (SourceDocument, Vec<u8>) {
        (
            SourceDocument::new(name, name, name, body.len() as u64, Utc::now()),
            body.as_bytes().to_vec(),
        )
    }

    fn orchestrator(
        lister: impl SourceLister + 'static,
        index: Arc<dyn SearchIndex>,
        options: SyncOptions,
    ) -> SyncOrchestrator {
        SyncOrchestrator::new(
            Arc::new(lister),
            index,
            TransformRuleEngine::new(&TransformConfig::default()),
            TransformExecutor::new(OperationRegistry::with_builtins(), None),
            options,
        )
    }

    fn stale_entry(source_id: &str) -> IndexedDocument {
        IndexedDocument {
            id: derive_index_id(SCOPE, source_id),
            scope: SCOPE.to_string(),
            source_id: source_id.to_string(),
            title: source_id.to_string(),
            content: "old".to_string(),
            metadata: Default::default(),
            last_modified: Utc::now(),
            content_hash: None,
            rules_hash: None,
        }
    }

    #[tokio::test]
    async fn indexes_and_purges() {
        let index = Arc::new(InMemoryIndex::with_documents([stale_entry("gone.txt")]));
        let lister = StaticLister::new(SCOPE, vec![text_doc("a.txt", "alpha"), text_doc("b.txt", "beta")]);
        let summary = orchestrator(lister, index.clone(), SyncOptions::default())
            .run(CancellationToken::new())
            .await;

        assert_eq!(summary.state, RunState::Done);
        assert_eq!((summary.listed, summary.succeeded, summary.failed), (2, 2, 0));
        assert_eq!(summary.purged, 1);
        let stored = index.get(&derive_index_id(SCOPE, "a.txt")).await.unwrap().unwrap();
        assert_eq!(stored.content, "alpha");
        assert!(index.get(&derive_index_id(SCOPE, "gone.txt")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pdf_rules_run_before_indexing() {
        let mut config = TransformConfig::default();
        config.extensions.insert(
            "pdf".into(),
            vec![TransformRule::new(OP_MAX_PAGES).with_param("num_max_pages", 2)],
        );
        let (doc, _) = text_doc("a.pdf", "");
        let lister = StaticLister::new(SCOPE, vec![(doc, pdf_with_pages(4))]);
        let index = Arc::new(InMemoryIndex::new());

        let summary = SyncOrchestrator::new(
            Arc::new(lister),
            index.clone(),
            TransformRuleEngine::new(&config),
            TransformExecutor::new(OperationRegistry::with_builtins(), None),
            SyncOptions::default(),
        )
        .run(CancellationToken::new())
        .await;
        assert_eq!(summary.state, RunState::Done);
        assert_eq!(summary.failed, 0, "{:?}", summary.failed_documents);
        let stored = index.get(&derive_index_id(SCOPE, "a.pdf")).await.unwrap().unwrap();
        assert_eq!(stored.metadata["transforms"], serde_json::json!(["max_pages"]));
        assert!(!stored.content.contains("Page 3"));
    }

    #[tokio::test]
    async fn unchanged_documents_are_skipped_unless_full() {
        let (doc, body) = text_doc("a.txt", "alpha");
        let mut indexed = stale_entry("a.txt");
        indexed.last_modified = doc.last_modified + ChronoDuration::seconds(5);
        indexed.rules_hash = Some(chain_hash(&[]));
        let index = Arc::new(InMemoryIndex::with_documents([indexed]));

        let summary = orchestrator(
            StaticLister::new(SCOPE, vec![(doc.clone(), body.clone())]),
            index.clone(),
            SyncOptions::default(),
        )
        .run(CancellationToken::new())
        .await;
        assert_eq!(summary.skipped_unchanged, 1);
        assert_eq!(summary.succeeded, 1);
        let stored = index.get(&derive_index_id(SCOPE, "a.txt")).await.unwrap().unwrap();
        assert_eq!(stored.content, "old");

        let full = SyncOptions {
            full: true,
            ..SyncOptions::default()
        };
        let summary = orchestrator(StaticLister::new(SCOPE, vec![(doc, body)]), index.clone(), full)
            .run(CancellationToken::new())
            .await;
        assert_eq!(summary.skipped_unchanged, 0);
        let stored = index.get(&derive_index_id(SCOPE, "a.txt")).await.unwrap().unwrap();
        assert_eq!(stored.content, "alpha");
    }

    #[tokio::test]
    async fn changed_rule_chain_reprocesses_unchanged_documents() {
        let (doc, body) = text_doc("a.txt", "p1\x0Cp2");
        let index = Arc::new(InMemoryIndex::new());
        let run = |config: TransformConfig| {
            SyncOrchestrator::new(
                Arc::new(StaticLister::new(SCOPE, vec![(doc.clone(), body.clone())])),
                index.clone(),
                TransformRuleEngine::new(&config),
                TransformExecutor::new(OperationRegistry::with_builtins(), None),
                SyncOptions::default(),
            )
        };

        let summary = run(TransformConfig::default()).run(CancellationToken::new()).await;
        assert_eq!(summary.skipped_unchanged, 0);
        let summary = run(TransformConfig::default()).run(CancellationToken::new()).await;
        assert_eq!(summary.skipped_unchanged, 1);

        let mut truncating = TransformConfig::default();
        truncating.extensions.insert(
            "txt".into(),
            vec![TransformRule::new(OP_MAX_PAGES).with_param("num_max_pages", 1)],
        );
        let summary = run(truncating).run(CancellationToken::new()).await;
        assert_eq!(summary.skipped_unchanged, 0);
        let stored = index.get(&derive_index_id(SCOPE, "a.txt")).await.unwrap().unwrap();
        assert_eq!(stored.content, "p1");
    }

    #[tokio::test]
    async fn partial_listing_fails_and_skips_purge() {
        let index = Arc::new(InMemoryIndex::with_documents([stale_entry("keep-me.txt")]));
        let mut lister = StaticLister::new(SCOPE, vec![text_doc("a.txt", "a"), text_doc("b.txt", "b")]);
        lister.fail_after = Some(1);

        let summary = orchestrator(lister, index.clone(), SyncOptions::default())
            .run(CancellationToken::new())
            .await;
        assert_eq!(summary.state, RunState::Failed);
        assert!(matches!(summary.error, Some(SyncError::SourceUnavailable(_))));
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.purged, 0);
        assert!(index.get(&derive_index_id(SCOPE, "keep-me.txt")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let index = Arc::new(InMemoryIndex::with_documents([stale_entry("gone.txt")]));
        let options = SyncOptions {
            dry_run: true,
            ..SyncOptions::default()
        };
        let summary = orchestrator(StaticLister::new(SCOPE, vec![text_doc("a.txt", "a")]), index.clone(), options)
            .run(CancellationToken::new())
            .await;
        assert_eq!(summary.state, RunState::Done);
        assert_eq!((summary.planned, summary.succeeded), (1, 0));
        assert_eq!((summary.stale, summary.purged), (1, 0));
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn no_purge_keeps_stale_entries() {
        let index = Arc::new(InMemoryIndex::with_documents([stale_entry("gone.txt")]));
        let options = SyncOptions {
            no_purge: true,
            ..SyncOptions::default()
        };
        let summary = orchestrator(StaticLister::new(SCOPE, vec![]), index.clone(), options)
            .run(CancellationToken::new())
            .await;
        assert_eq!(summary.state, RunState::Done);
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn cancelled_run_fails_without_purging() {
        let index = Arc::new(InMemoryIndex::with_documents([stale_entry("gone.txt")]));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = orchestrator(StaticLister::new(SCOPE, vec![text_doc("a.txt", "a")]), index.clone(), SyncOptions::default())
            .run(cancel)
            .await;
        assert_eq!(summary.state, RunState::Failed);
        assert!(matches!(summary.error, Some(SyncError::Cancelled)));
        assert_eq!(index.len(), 1);
    }

    /// Index that rejects upserts for one id and fails enumeration on demand.
    struct FlakyIndex {
        inner: InMemoryIndex,
        reject: String,
        fail_list: bool,
    }

    #[async_trait]
    impl SearchIndex for FlakyIndex {
        async fn upsert(&self, doc: &IndexedDocument) -> Result<()> {
            if doc.source_id == self.reject {
                anyhow::bail!("schema mismatch");
            }
            self.inner.upsert(doc).await
        }
        async fn fingerprint(&self, id: &str) -> Result<Option<DocumentFingerprint>> {
            self.inner.fingerprint(id).await
        }
        async fn list_ids(&self, scope: &str) -> Result<HashSet<String>> {
            if self.fail_list {
                anyhow::bail!("index offline");
            }
            self.inner.list_ids(scope).await
        }
        async fn delete(&self, id: &str) -> Result<()> {
            self.inner.delete(id).await
        }
        async fn get(&self, id: &str) -> Result<Option<IndexedDocument>> {
            self.inner.get(id).await
        }
    }

    #[tokio::test]
    async fn one_failing_upsert_does_not_stop_the_others() {
        let index = Arc::new(FlakyIndex {
            inner: InMemoryIndex::new(),
            reject: "a.txt".into(),
            fail_list: false,
        });
        let lister = StaticLister::new(SCOPE, vec![text_doc("a.txt", "a"), text_doc("b.txt", "b")]);
        let summary = orchestrator(lister, index.clone(), SyncOptions::default())
            .run(CancellationToken::new())
            .await;
        assert_eq!(summary.state, RunState::Done);
        assert_eq!((summary.succeeded, summary.failed), (1, 1));
        assert_eq!(summary.failed_documents[0].name, "a.txt");
        assert!(summary.failed_documents[0].error.contains("schema mismatch"));
        assert!(index.get(&derive_index_id(SCOPE, "b.txt")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unavailable_index_id_set_fails_the_run() {
        let index = Arc::new(FlakyIndex {
            inner: InMemoryIndex::new(),
            reject: String::new(),
            fail_list: true,
        });
        let summary = orchestrator(StaticLister::new(SCOPE, vec![text_doc("a.txt", "a")]), index, SyncOptions::default())
            .run(CancellationToken::new())
            .await;
        assert_eq!(summary.state, RunState::Failed);
        assert!(matches!(summary.error, Some(SyncError::IndexUnavailable(_))));
        assert_eq!(summary.succeeded, 1);
    }

    /// Lister whose fetch sleeps, recording the peak number of fetches in flight.
    struct SlowLister {
        inner: StaticLister,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl SourceLister for SlowLister {
        fn scope(&self) -> &str {
            self.inner.scope()
        }
        fn list(&self) -> DocumentStream<'_> {
            self.inner.list()
        }
        async fn fetch(&self, doc: &SourceDocument) -> Result<Vec<u8>> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.inner.fetch(doc).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_is_bounded() {
        let docs = (0..12).map(|i| text_doc(&format!("{}.txt", i), "x")).collect();
        let lister = Arc::new(SlowLister {
            inner: StaticLister::new(SCOPE, docs),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let options = SyncOptions {
            concurrency: 3,
            ..SyncOptions::default()
        };
        let summary = SyncOrchestrator::new(
            lister.clone(),
            Arc::new(InMemoryIndex::new()),
            TransformRuleEngine::new(&TransformConfig::default()),
            TransformExecutor::new(OperationRegistry::with_builtins(), None),
            options,
        )
        .run(CancellationToken::new())
        .await;
        assert_eq!(summary.succeeded, 12);
        let peak = lister.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency {}", peak);
        assert!(peak >= 2, "documents were not processed in parallel");
    }

    /// Lister whose fetches block until the test opens the gate.
    struct GatedLister {
        inner: StaticLister,
        gate: Semaphore,
        started: AtomicUsize,
    }

    #[async_trait]
    impl SourceLister for GatedLister {
        fn scope(&self) -> &str {
            self.inner.scope()
        }
        fn list(&self) -> DocumentStream<'_> {
            self.inner.list()
        }
        async fn fetch(&self, doc: &SourceDocument) -> Result<Vec<u8>> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let _permit = self.gate.acquire().await?;
            self.inner.fetch(doc).await
        }
    }

    #[tokio::test]
    async fn cancellation_lets_in_flight_documents_finish() {
        let docs = (0..8).map(|i| text_doc(&format!("{}.txt", i), "x")).collect();
        let lister = Arc::new(GatedLister {
            inner: StaticLister::new(SCOPE, docs),
            gate: Semaphore::new(0),
            started: AtomicUsize::new(0),
        });
        let index = Arc::new(InMemoryIndex::with_documents([stale_entry("gone.txt")]));
        let orchestrator = SyncOrchestrator::new(
            lister.clone(),
            index.clone(),
            TransformRuleEngine::new(&TransformConfig::default()),
            TransformExecutor::new(OperationRegistry::with_builtins(), None),
            SyncOptions {
                concurrency: 2,
                ..SyncOptions::default()
            },
        );

        let cancel = CancellationToken::new();
        let (summary, ()) = tokio::join!(orchestrator.run(cancel.clone()), async {
            while lister.started.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            cancel.cancel();
            lister.gate.add_permits(8);
        });

        assert_eq!(summary.state, RunState::Failed);
        assert!(matches!(summary.error, Some(SyncError::Cancelled)));
        assert_eq!(lister.started.load(Ordering::SeqCst), 2, "queued documents were started");
        assert_eq!((summary.succeeded, summary.failed), (2, 0));
        assert_eq!(summary.purged, 0);
        assert_eq!(index.len(), 3);
        assert!(index.get(&derive_index_id(SCOPE, "gone.txt")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn relocation_is_reported_even_when_upsert_fails() {
        let tmp = tempfile::TempDir::new().unwrap();
        let storage: Arc<dyn SecondaryStorage> = Arc::new(LocalDirStorage::new(tmp.path()));
        let mut config = TransformConfig::default();
        config.extensions.insert(
            "txt".into(),
            vec![
                TransformRule::new(OP_MOVE).with_param("output_format", "same"),
                TransformRule::new(OP_MOVE).with_param("output_format", "tiff"),
            ],
        );
        let index = Arc::new(FlakyIndex {
            inner: InMemoryIndex::new(),
            reject: "a.txt".into(),
            fail_list: false,
        });
        let summary = SyncOrchestrator::new(
            Arc::new(StaticLister::new(SCOPE, vec![text_doc("a.txt", "alpha")])),
            index,
            TransformRuleEngine::new(&config),
            TransformExecutor::new(OperationRegistry::with_builtins(), Some(storage)),
            SyncOptions::default(),
        )
        .run(CancellationToken::new())
        .await;

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.relocated, 1);
        assert_eq!(summary.relocation_failures.len(), 1);
        assert_eq!(summary.relocation_failures[0].name, "a.txt");
        assert!(summary.relocation_failures[0].error.contains("tiff"));
        assert_eq!(std::fs::read(tmp.path().join("a.txt")).unwrap(), b"alpha");
    }

    /// Lister whose fetch panics for one document.
    struct PanickingLister {
        inner: StaticLister,
        poison: &'static str,
    }

    #[async_trait]
    impl SourceLister for PanickingLister {
        fn scope(&self) -> &str {
            self.inner.scope()
        }
        fn list(&self) -> DocumentStream<'_> {
            self.inner.list()
        }
        async fn fetch(&self, doc: &SourceDocument) -> Result<Vec<u8>> {
            if doc.id == self.poison {
                panic!("decoder blew up on {}", doc.id);
            }
            self.inner.fetch(doc).await
        }
    }

    #[tokio::test]
    async fn worker_panic_keeps_outcomes_already_recorded() {
        let lister = PanickingLister {
            inner: StaticLister::new(SCOPE, vec![text_doc("a.txt", "a"), text_doc("boom.txt", "b")]),
            poison: "boom.txt",
        };
        let index = Arc::new(InMemoryIndex::new());
        let options = SyncOptions {
            concurrency: 1,
            ..SyncOptions::default()
        };
        let summary = orchestrator(lister, index.clone(), options)
            .run(CancellationToken::new())
            .await;

        assert_eq!(summary.listed, 2);
        assert_eq!((summary.succeeded, summary.failed), (1, 1));
        assert!(summary.failed_documents[0].error.contains("worker aborted"));
        assert!(index.get(&derive_index_id(SCOPE, "a.txt")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn excluded_extensions_are_neither_indexed_nor_purged() {
        let mut docx = stale_entry("b.docx");
        docx.content = "indexed before the allow-list changed".into();
        let index = Arc::new(InMemoryIndex::with_documents([docx, stale_entry("gone.docx")]));
        let lister = StaticLister::new(
            SCOPE,
            vec![text_doc("a.txt", "a"), text_doc("b.docx", "still here")],
        );
        let summary = orchestrator(lister, index.clone(), SyncOptions::default())
            .with_allow_list(AllowList::new(&["txt".to_string()]))
            .run(CancellationToken::new())
            .await;

        assert_eq!(summary.state, RunState::Done);
        assert_eq!((summary.listed, summary.excluded, summary.succeeded), (1, 1, 1));
        assert_eq!(summary.purged, 1);
        let kept = index.get(&derive_index_id(SCOPE, "b.docx")).await.unwrap().unwrap();
        assert_eq!(kept.content, "indexed before the allow-list changed");
        assert!(index.get(&derive_index_id(SCOPE, "gone.docx")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn summary_is_written_as_json() {
        let tmp = tempfile::TempDir::new().unwrap();
        let index = Arc::new(FlakyIndex {
            inner: InMemoryIndex::new(),
            reject: "a.txt".into(),
            fail_list: false,
        });
        let lister = StaticLister::new(SCOPE, vec![text_doc("a.txt", "a"), text_doc("b.txt", "b")]);
        let summary = orchestrator(lister, index, SyncOptions::default())
            .run(CancellationToken::new())
            .await;

        let path = tmp.path().join("runs/last.json");
        summary.write_json(&path).await.unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["run_id"], serde_json::json!(summary.run_id.to_string()));
        assert_eq!(json["scope"], SCOPE);
        assert_eq!(json["state"], "done");
        assert!(json["error"].is_null());
        assert_eq!(json["succeeded"], 1);
        assert_eq!(json["failed_documents"][0]["name"], "a.txt");
        assert!(json["failed_documents"][0]["error"]
            .as_str()
            .unwrap()
            .contains("schema mismatch"));
        assert!(json["duration_ms"].is_u64());
    }

    struct RecordingProgress(StdMutex<Vec<SyncProgressEvent>>);

    impl SyncProgressReporter for RecordingProgress {
        fn report(&self, event: SyncProgressEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn progress_is_reported_every_interval() {
        let docs = (0..4).map(|i| text_doc(&format!("{}.txt", i), "x")).collect();
        let reporter = Arc::new(RecordingProgress(StdMutex::new(Vec::new())));
        let options = SyncOptions {
            progress_interval: 2,
            ..SyncOptions::default()
        };
        orchestrator(StaticLister::new(SCOPE, docs), Arc::new(InMemoryIndex::new()), options)
            .with_progress(reporter.clone())
            .run(CancellationToken::new())
            .await;
        let events = reporter.0.lock().unwrap();
        let processing = events
            .iter()
            .filter(|e| matches!(e, SyncProgressEvent::Processing { .. }))
            .count();
        assert_eq!(processing, 2);
        assert!(matches!(events.first(), Some(SyncProgressEvent::Listing { .. })));
        assert!(matches!(events.last(), Some(SyncProgressEvent::Reconciling { .. })));
    }

    #[tokio::test]
    async fn disabled_source_is_a_no_op() {
        let config = crate::config::parse_config(
            r#"
            [index]
            backend = "sqlite"
            path = "/nonexistent/never-created.sqlite"

            [source]
            kind = "filesystem"
            enabled = false

            [source.filesystem]
            root = "/nonexistent"
            "#,
        )
        .unwrap();
        let summary = run_from_config(
            &config,
            &EnvSecretProvider,
            SyncOptions::from_config(&config),
            Arc::new(NoProgress),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(summary.state, RunState::Done);
        assert_eq!(summary.listed, 0);
    }
}

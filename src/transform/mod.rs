//! Content transformation chain.
//!
//! A rule chain resolved by [`TransformRuleEngine`](docsync_core::rules::TransformRuleEngine)
//! is executed here, strictly in order. Each operation is a handler
//! registered by name in an [`OperationRegistry`]; the executor never
//! branches on operation names itself.
//!
//! # Operation effects
//!
//! | Effect | Main content | Manifest outcome |
//! |--------|--------------|------------------|
//! | [`OperationEffect::Replace`] | replaced for the next rule | `applied` |
//! | [`OperationEffect::Unchanged`] | passed through | `unchanged` |
//! | [`OperationEffect::Side`] | passed through, artifact kept | `side_artifact` |
//! | [`OperationEffect::Relocated`] | passed through | `relocated` |
//!
//! A [`TransformError`] from a content operation fails the document. A
//! [`RelocationError`] is recorded (`failed`) and the chain continues.
//! Unknown operation names are skipped with a warning (`skipped_unknown`).

mod ops;

pub use ops::{MaxPages, Move, PrintScreen, DEFAULT_MAX_PAGES};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use docsync_core::models::SourceDocument;
use docsync_core::rules::{chain_hash, TransformRule};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{RelocationError, TransformError};
use crate::relocation::SecondaryStorage;

/// Output of a rule chain.
#[derive(Debug, Clone)]
pub struct TransformedArtifact {
    /// Final main content, input of text extraction and indexing.
    pub content: Vec<u8>,
    pub side_artifacts: Vec<SideArtifact>,
    /// One entry per rule, in execution order.
    pub applied: Vec<AppliedOperation>,
    pub relocation_failures: Vec<RelocationError>,
    /// [`chain_hash`] of the rules that produced this artifact.
    pub rules_hash: String,
}

impl TransformedArtifact {
    fn passthrough(content: Vec<u8>, rules_hash: String) -> Self {
        Self {
            content,
            side_artifacts: Vec::new(),
            applied: Vec::new(),
            relocation_failures: Vec::new(),
            rules_hash,
        }
    }

    /// Number of `move` uploads that went through.
    pub fn relocated(&self) -> usize {
        self.applied
            .iter()
            .filter(|a| a.outcome == OperationOutcome::Relocated)
            .count()
    }

    /// Names of the operations that actually ran, for index metadata.
    pub fn applied_names(&self) -> Vec<String> {
        self.applied
            .iter()
            .filter(|a| {
                !matches!(
                    a.outcome,
                    OperationOutcome::SkippedUnknown | OperationOutcome::Failed
                )
            })
            .map(|a| a.operation.clone())
            .collect()
    }
}

/// An output produced next to the main content, e.g. a preview.
#[derive(Debug, Clone, PartialEq)]
pub struct SideArtifact {
    /// Relative name used when the artifact is uploaded.
    pub name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationOutcome {
    Applied,
    Unchanged,
    SideArtifact,
    Relocated,
    SkippedUnknown,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedOperation {
    pub operation: String,
    pub outcome: OperationOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// What one operation sees.
pub struct OperationInput<'a> {
    pub document: &'a SourceDocument,
    /// Content as fetched from the source, before any rule ran.
    pub original: &'a [u8],
    /// Output of the previous content-producing rule.
    pub content: &'a [u8],
    pub rule: &'a TransformRule,
    pub storage: Option<&'a dyn SecondaryStorage>,
}

pub enum OperationEffect {
    Replace(Vec<u8>),
    Unchanged,
    Side(SideArtifact),
    /// Content was uploaded under this name.
    Relocated(String),
}

pub enum OperationError {
    Content(TransformError),
    Relocation(RelocationError),
}

impl From<TransformError> for OperationError {
    fn from(e: TransformError) -> Self {
        OperationError::Content(e)
    }
}

impl From<RelocationError> for OperationError {
    fn from(e: RelocationError) -> Self {
        OperationError::Relocation(e)
    }
}

/// A named transformation handler.
#[async_trait]
pub trait TransformOperation: Send + Sync {
    /// Name matched against `TransformRule::operation`.
    fn name(&self) -> &'static str;

    async fn apply(&self, input: OperationInput<'_>) -> Result<OperationEffect, OperationError>;
}

/// Operation handlers keyed by name.
#[derive(Clone, Default)]
pub struct OperationRegistry {
    ops: HashMap<&'static str, Arc<dyn TransformOperation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `max_pages`, `print_screen` and `move`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(MaxPages));
        registry.register(Arc::new(PrintScreen));
        registry.register(Arc::new(Move));
        registry
    }

    /// Register a handler, replacing any handler of the same name.
    pub fn register(&mut self, op: Arc<dyn TransformOperation>) {
        self.ops.insert(op.name(), op);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn TransformOperation>> {
        self.ops.get(name)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.ops.contains_key(name)
    }
}

/// Runs rule chains against document content.
pub struct TransformExecutor {
    registry: OperationRegistry,
    storage: Option<Arc<dyn SecondaryStorage>>,
}

impl TransformExecutor {
    pub fn new(registry: OperationRegistry, storage: Option<Arc<dyn SecondaryStorage>>) -> Self {
        Self { registry, storage }
    }

    /// Apply `rules` in order to `content`, the bytes as fetched.
    ///
    /// An empty chain returns the content untouched with an empty manifest.
    pub async fn apply(
        &self,
        document: &SourceDocument,
        content: &[u8],
        rules: &[TransformRule],
    ) -> Result<TransformedArtifact, TransformError> {
        let mut artifact = TransformedArtifact::passthrough(content.to_vec(), chain_hash(rules));
        let storage = self.storage.as_deref();

        for rule in rules {
            let Some(op) = self.registry.get(&rule.operation) else {
                warn!(
                    operation = %rule.operation,
                    document = %document.path,
                    "unknown transform operation, skipping"
                );
                artifact.applied.push(AppliedOperation {
                    operation: rule.operation.clone(),
                    outcome: OperationOutcome::SkippedUnknown,
                    detail: None,
                });
                continue;
            };

            let input = OperationInput {
                document,
                original: content,
                content: &artifact.content,
                rule,
                storage,
            };
            let result = op.apply(input).await;
            let (outcome, detail) = match result {
                Ok(OperationEffect::Replace(bytes)) => {
                    artifact.content = bytes;
                    (OperationOutcome::Applied, None)
                }
                Ok(OperationEffect::Unchanged) => (OperationOutcome::Unchanged, None),
                Ok(OperationEffect::Side(side)) => {
                    let detail = Some(side.name.clone());
                    if let Some(storage) = storage {
                        if let Err(e) = storage.upload(&side.name, &side.bytes).await {
                            let err = RelocationError::Upload {
                                name: side.name.clone(),
                                message: format!("{:#}", e),
                            };
                            warn!(document = %document.path, error = %err, "side artifact upload failed");
                            artifact.relocation_failures.push(err);
                        }
                    }
                    artifact.side_artifacts.push(side);
                    (OperationOutcome::SideArtifact, detail)
                }
                Ok(OperationEffect::Relocated(target)) => (OperationOutcome::Relocated, Some(target)),
                Err(OperationError::Relocation(err)) => {
                    warn!(
                        operation = %rule.operation,
                        document = %document.path,
                        error = %err,
                        "relocation failed, continuing chain"
                    );
                    let detail = Some(err.to_string());
                    artifact.relocation_failures.push(err);
                    (OperationOutcome::Failed, detail)
                }
                Err(OperationError::Content(err)) => return Err(err),
            };
            debug!(operation = %rule.operation, ?outcome, document = %document.path, "transform step");
            artifact.applied.push(AppliedOperation {
                operation: rule.operation.clone(),
                outcome,
                detail,
            });
        }

        Ok(artifact)
    }
}

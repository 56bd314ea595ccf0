//! Built-in transform operations.

use async_trait::async_trait;
use docsync_core::models::SourceDocument;
use docsync_core::rules::{OP_MAX_PAGES, OP_MOVE, OP_PRINT_SCREEN};

use super::{OperationEffect, OperationError, OperationInput, SideArtifact, TransformOperation};
use crate::error::{RelocationError, TransformError};
use crate::{extract, paginate};

/// Page limit of `max_pages` when `num_max_pages` is not given.
pub const DEFAULT_MAX_PAGES: u64 = 10;

/// Relative upload name of a document: its path within the scope.
fn target_name(document: &SourceDocument) -> String {
    document
        .path
        .replace('\\', "/")
        .trim_start_matches('/')
        .to_string()
}

/// `target_name` with the extension replaced by `suffix`.
fn sibling_name(document: &SourceDocument, suffix: &str) -> String {
    let name = target_name(document);
    let stem = if document.extension.is_empty() {
        name.as_str()
    } else {
        name.strip_suffix(&format!(".{}", document.extension))
            .or_else(|| name.rsplit_once('.').map(|(stem, _)| stem))
            .unwrap_or(name.as_str())
    };
    format!("{}{}", stem, suffix)
}

fn content_error(operation: &str, e: impl std::fmt::Display) -> OperationError {
    OperationError::Content(TransformError::Content {
        operation: operation.to_string(),
        message: e.to_string(),
    })
}

/// Run a page-level function off the async runtime; PDF rewriting is
/// CPU-bound.
async fn paged<F>(
    operation: &'static str,
    input: &OperationInput<'_>,
    f: F,
) -> Result<Option<Vec<u8>>, OperationError>
where
    F: FnOnce(&[u8], &str) -> anyhow::Result<Option<Vec<u8>>> + Send + 'static,
{
    let bytes = input.content.to_vec();
    let extension = input.document.extension.clone();
    tokio::task::spawn_blocking(move || f(&bytes, &extension))
        .await
        .map_err(|e| content_error(operation, e))?
        .map_err(|e| content_error(operation, format!("{:#}", e)))
}

/// `max_pages(num_max_pages)`: keep at most N pages.
pub struct MaxPages;

#[async_trait]
impl TransformOperation for MaxPages {
    fn name(&self) -> &'static str {
        OP_MAX_PAGES
    }

    async fn apply(&self, input: OperationInput<'_>) -> Result<OperationEffect, OperationError> {
        let max = match input.rule.param("num_max_pages") {
            None => DEFAULT_MAX_PAGES,
            Some(_) => match input.rule.param_u64("num_max_pages") {
                Some(n) if n > 0 => n,
                _ => {
                    return Err(TransformError::InvalidParameter {
                        operation: OP_MAX_PAGES.to_string(),
                        message: "num_max_pages must be a positive integer".to_string(),
                    }
                    .into())
                }
            },
        };
        let max = usize::try_from(max).unwrap_or(usize::MAX);
        let truncated = paged(OP_MAX_PAGES, &input, move |bytes, ext| {
            paginate::truncate(bytes, ext, max)
        })
        .await?;
        Ok(match truncated {
            Some(bytes) => OperationEffect::Replace(bytes),
            None => OperationEffect::Unchanged,
        })
    }
}

/// `print_screen()`: first-page preview as a side artifact.
pub struct PrintScreen;

#[async_trait]
impl TransformOperation for PrintScreen {
    fn name(&self) -> &'static str {
        OP_PRINT_SCREEN
    }

    async fn apply(&self, input: OperationInput<'_>) -> Result<OperationEffect, OperationError> {
        let preview = paged(OP_PRINT_SCREEN, &input, paginate::first_page).await?;
        Ok(match preview {
            Some(bytes) => {
                let suffix = if input.document.extension.is_empty() {
                    ".preview".to_string()
                } else {
                    format!(".preview.{}", input.document.extension)
                };
                OperationEffect::Side(SideArtifact {
                    name: sibling_name(input.document, &suffix),
                    bytes,
                })
            }
            None => OperationEffect::Unchanged,
        })
    }
}

/// `move(output_format)`: upload the document as fetched (`same`) or
/// the text extracted from it (`txt`) to the secondary storage. Earlier
/// rules in the chain only shape what gets indexed.
pub struct Move;

#[async_trait]
impl TransformOperation for Move {
    fn name(&self) -> &'static str {
        OP_MOVE
    }

    async fn apply(&self, input: OperationInput<'_>) -> Result<OperationEffect, OperationError> {
        let storage = input.storage.ok_or(RelocationError::NoDestination)?;
        let format = input
            .rule
            .param_str("output_format")
            .unwrap_or("same")
            .trim()
            .to_ascii_lowercase();

        let (name, bytes) = match format.as_str() {
            "same" => (target_name(input.document), input.original.to_vec()),
            "txt" => {
                let text = extract::extract_text(input.original, &input.document.extension)
                    .map_err(|e| RelocationError::Transcode {
                        format: format.clone(),
                        message: e.to_string(),
                    })?;
                (sibling_name(input.document, ".txt"), text.into_bytes())
            }
            _ => return Err(RelocationError::UnsupportedFormat(format).into()),
        };

        storage
            .upload(&name, &bytes)
            .await
            .map_err(|e| RelocationError::Upload {
                name: name.clone(),
                message: format!("{:#}", e),
            })?;
        Ok(OperationEffect::Relocated(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn doc(path: &str) -> SourceDocument {
        let name = path.rsplit('/').next().unwrap_or(path);
        SourceDocument::new("id", name, path, 0, Utc::now())
    }

    #[test]
    fn sibling_names_replace_extension() {
        assert_eq!(sibling_name(&doc("/a/Report.PDF"), ".txt"), "a/Report.txt");
        assert_eq!(sibling_name(&doc("notes"), ".preview"), "notes.preview");
        assert_eq!(
            sibling_name(&doc("x/b.pdf"), ".preview.pdf"),
            "x/b.preview.pdf"
        );
    }
}

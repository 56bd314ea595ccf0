//! Page-level access to document content.
//!
//! Only two formats are paginated: PDF (real pages, via `lopdf`) and the
//! plain text formats, whose pages are separated by form feed (`\x0C`).
//! For everything else [`Pagination::None`] is returned and page-based
//! operations leave the content untouched.

use anyhow::{Context, Result};
use lopdf::Document;

use crate::extract::is_text_extension;

/// Form feed, the page separator of plain text content.
pub const PAGE_BREAK: u8 = 0x0C;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pagination {
    Pdf,
    Text,
    None,
}

impl Pagination {
    pub fn for_extension(extension: &str) -> Self {
        match extension {
            "pdf" => Pagination::Pdf,
            ext if is_text_extension(ext) => Pagination::Text,
            _ => Pagination::None,
        }
    }
}

/// Number of pages, or `None` for unpaginated formats.
pub fn page_count(bytes: &[u8], extension: &str) -> Result<Option<usize>> {
    match Pagination::for_extension(extension) {
        Pagination::Pdf => Ok(Some(load_pdf(bytes)?.get_pages().len())),
        Pagination::Text => Ok(Some(text_pages(bytes).len())),
        Pagination::None => Ok(None),
    }
}

/// Keep the first `max` pages. Returns `None` when nothing had to be
/// removed (or the format is not paginated).
pub fn truncate(bytes: &[u8], extension: &str, max: usize) -> Result<Option<Vec<u8>>> {
    match Pagination::for_extension(extension) {
        Pagination::Pdf => truncate_pdf(bytes, max),
        Pagination::Text => {
            let pages = text_pages(bytes);
            if pages.len() <= max {
                return Ok(None);
            }
            Ok(Some(pages[..max].join(&PAGE_BREAK)))
        }
        Pagination::None => Ok(None),
    }
}

/// The first page on its own, or `None` for unpaginated formats.
pub fn first_page(bytes: &[u8], extension: &str) -> Result<Option<Vec<u8>>> {
    match Pagination::for_extension(extension) {
        Pagination::Pdf => Ok(Some(
            truncate_pdf(bytes, 1)?.unwrap_or_else(|| bytes.to_vec()),
        )),
        Pagination::Text => Ok(text_pages(bytes).first().map(|p| p.to_vec())),
        Pagination::None => Ok(None),
    }
}

fn load_pdf(bytes: &[u8]) -> Result<Document> {
    Document::load_mem(bytes).context("content is not a readable PDF")
}

fn truncate_pdf(bytes: &[u8], max: usize) -> Result<Option<Vec<u8>>> {
    let mut doc = load_pdf(bytes)?;
    let pages = doc.get_pages();
    if pages.len() <= max {
        return Ok(None);
    }
    let surplus: Vec<u32> = pages.keys().copied().skip(max).collect();
    doc.delete_pages(&surplus);
    doc.prune_objects();
    let mut out = Vec::new();
    doc.save_to(&mut out).context("failed to write truncated PDF")?;
    Ok(Some(out))
}

/// Split text content on form feeds. A trailing form feed does not open
/// an empty page.
fn text_pages(bytes: &[u8]) -> Vec<&[u8]> {
    let mut pages: Vec<&[u8]> = bytes.split(|b| *b == PAGE_BREAK).collect();
    if pages.len() > 1 && pages.last().is_some_and(|p| p.is_empty()) {
        pages.pop();
    }
    pages
}

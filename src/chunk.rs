//! Paragraph-boundary text chunker for the SQLite full-text index.
//!
//! Paragraphs (`\n\n`-separated) are packed greedily into chunks of at
//! most `max_tokens` (approximated as 4 characters per token). A single
//! paragraph longer than that is cut at the last newline or space before
//! the limit. Chunk ids are `<document_id>_<index>`, so re-indexing a
//! document replaces exactly the same chunk rows.

use sha2::{Digest, Sha256};

const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub index: i64,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
}

/// Split `text` into chunks. Always returns at least one chunk, with
/// contiguous indices from 0.
pub fn chunk_text(document_id: &str, text: &str, max_tokens: usize) -> Vec<Chunk> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let mut pieces: Vec<String> = Vec::new();
    let mut buf = String::new();

    for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if !buf.is_empty() && buf.len() + 2 + para.len() > max_chars {
            pieces.push(std::mem::take(&mut buf));
        }
        if para.len() > max_chars {
            if !buf.is_empty() {
                pieces.push(std::mem::take(&mut buf));
            }
            pieces.extend(hard_split(para, max_chars));
            continue;
        }
        if !buf.is_empty() {
            buf.push_str("\n\n");
        }
        buf.push_str(para);
    }
    if !buf.is_empty() {
        pieces.push(buf);
    }
    if pieces.is_empty() {
        pieces.push(text.trim().to_string());
    }

    pieces
        .into_iter()
        .enumerate()
        .map(|(i, piece)| make_chunk(document_id, i as i64, piece))
        .collect()
}

/// Cut an oversized paragraph at whitespace near `max_chars`, never
/// inside a UTF-8 sequence.
fn hard_split(para: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = para;
    while !rest.is_empty() {
        if rest.len() <= max_chars {
            out.push(rest.trim().to_string());
            break;
        }
        let mut limit = max_chars;
        while !rest.is_char_boundary(limit) {
            limit -= 1;
        }
        let cut = rest[..limit]
            .rfind(|c: char| c == '\n' || c == ' ')
            .map(|pos| pos + 1)
            .unwrap_or(limit.max(rest.chars().next().map_or(1, char::len_utf8)));
        let piece = rest[..cut].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        rest = &rest[cut..];
    }
    out
}

fn make_chunk(document_id: &str, index: i64, text: String) -> Chunk {
    Chunk {
        id: format!("{}_{}", document_id, index),
        document_id: document_id.to_string(),
        index,
        hash: format!("{:x}", Sha256::digest(text.as_bytes())),
        text,
    }
}

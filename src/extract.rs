//! Indexable text from transformed document bytes.
//!
//! Runs once per document, after the transform chain, on the final
//! content. Dispatch is by file extension:
//!
//! | Extension | Strategy |
//! |-----------|----------|
//! | `pdf` | `pdf-extract`, falling back to `lopdf` |
//! | `docx` | `word/document.xml` text runs, one line per paragraph |
//! | `pptx` | `ppt/slides/slideN.xml` text runs, slides in order |
//! | `xlsx` | shared-string cells of every worksheet |
//! | text formats | UTF-8 (lossy), form feeds become blank lines |
//!
//! Anything else must already be valid UTF-8 or it is rejected.

use std::io::Read;

use quick_xml::events::Event;
use thiserror::Error;

/// Extensions treated as plain text.
pub const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "csv", "tsv", "json", "xml", "html", "htm", "log", "rst", "yaml",
    "yml",
];

const XLSX_MAX_SHEETS: usize = 100;
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Upper bound on a decompressed ZIP entry.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("no text extractor for '{0}' content")]
    Unsupported(String),

    #[error("PDF: {0}")]
    Pdf(String),

    #[error("Office document: {0}")]
    Ooxml(String),

    #[error("extraction task aborted: {0}")]
    Aborted(String),
}

fn ooxml<E: std::fmt::Display>(e: E) -> ExtractError {
    ExtractError::Ooxml(e.to_string())
}

pub fn is_text_extension(extension: &str) -> bool {
    TEXT_EXTENSIONS.contains(&extension)
}

/// Extract searchable text from `bytes` according to `extension`.
pub fn extract_text(bytes: &[u8], extension: &str) -> Result<String, ExtractError> {
    match extension {
        "pdf" => extract_pdf(bytes),
        "docx" => extract_docx(bytes),
        "pptx" => extract_pptx(bytes),
        "xlsx" => extract_xlsx(bytes),
        ext if is_text_extension(ext) => {
            Ok(String::from_utf8_lossy(bytes).replace('\x0C', "\n\n"))
        }
        ext => match std::str::from_utf8(bytes) {
            Ok(s) => Ok(s.to_string()),
            Err(_) => Err(ExtractError::Unsupported(if ext.is_empty() {
                "extensionless".to_string()
            } else {
                ext.to_string()
            })),
        },
    }
}

/// `pdf-extract` first; `lopdf`'s simpler extractor when it errors or
/// panics on an unusual file.
fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    let primary = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        pdf_extract::extract_text_from_mem(bytes)
    }));
    let reason = match primary {
        Ok(Ok(text)) => return Ok(text),
        Ok(Err(e)) => e.to_string(),
        Err(_) => "pdf-extract panicked".to_string(),
    };
    let doc = lopdf::Document::load_mem(bytes).map_err(|_| ExtractError::Pdf(reason.clone()))?;
    let pages: Vec<u32> = doc.get_pages().keys().copied().collect();
    doc.extract_text(&pages)
        .map_err(|e| ExtractError::Pdf(format!("{}; fallback: {}", reason, e)))
}

type Archive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_archive(bytes: &[u8]) -> Result<Archive<'_>, ExtractError> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(ooxml)
}

fn read_entry(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::Ooxml(format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(ooxml)?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::Ooxml(format!(
            "{} exceeds {} bytes",
            name, MAX_XML_ENTRY_BYTES
        )));
    }
    Ok(out)
}

/// Entries named `<prefix><n>.xml`, ordered by `n`.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(str::to_string)
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Concatenate the text of every `<*:t>` element, breaking lines at the
/// end of each `paragraph` element.
fn collect_text_runs(xml: &[u8], paragraph: &[u8]) -> Result<String, ExtractError> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf).map_err(ooxml)? {
            Event::Start(e) if e.local_name().as_ref() == b"t" => in_text = true,
            Event::Text(t) if in_text => {
                out.push_str(&t.unescape().map_err(ooxml)?);
            }
            Event::End(e) => {
                let name = e.local_name();
                if name.as_ref() == b"t" {
                    in_text = false;
                } else if name.as_ref() == paragraph && !out.ends_with('\n') && !out.is_empty() {
                    out.push('\n');
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let xml = read_entry(&mut archive, "word/document.xml")?;
    collect_text_runs(&xml, b"p")
}

fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let mut slides = Vec::new();
    for name in numbered_entries(&archive, "ppt/slides/slide") {
        let xml = read_entry(&mut archive, &name)?;
        let text = collect_text_runs(&xml, b"p")?;
        if !text.is_empty() {
            slides.push(text);
        }
    }
    Ok(slides.join("\n\n"))
}

fn extract_xlsx(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut archive = open_archive(bytes)?;
    let shared = if archive.file_names().any(|n| n == "xl/sharedStrings.xml") {
        shared_strings(&read_entry(&mut archive, "xl/sharedStrings.xml")?)?
    } else {
        Vec::new()
    };
    let mut sheets = Vec::new();
    for name in numbered_entries(&archive, "xl/worksheets/sheet")
        .into_iter()
        .take(XLSX_MAX_SHEETS)
    {
        let xml = read_entry(&mut archive, &name)?;
        let cells = sheet_cells(&xml, &shared)?;
        if !cells.is_empty() {
            sheets.push(cells.join(" "));
        }
    }
    Ok(sheets.join("\n"))
}

fn shared_strings(xml: &[u8]) -> Result<Vec<String>, ExtractError> {
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf).map_err(ooxml)? {
            Event::Start(e) if e.local_name().as_ref() == b"si" => current.clear(),
            Event::Start(e) if e.local_name().as_ref() == b"t" => in_text = true,
            Event::Text(t) if in_text => current.push_str(&t.unescape().map_err(ooxml)?),
            Event::End(e) if e.local_name().as_ref() == b"t" => in_text = false,
            Event::End(e) if e.local_name().as_ref() == b"si" => {
                strings.push(std::mem::take(&mut current))
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn sheet_cells(xml: &[u8], shared: &[String]) -> Result<Vec<String>, ExtractError> {
    let mut cells = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut in_value = false;
    let mut shared_ref = false;
    while cells.len() < XLSX_MAX_CELLS_PER_SHEET {
        match reader.read_event_into(&mut buf).map_err(ooxml)? {
            Event::Start(e) if e.local_name().as_ref() == b"c" => {
                shared_ref = e.attributes().flatten().any(|a| {
                    a.key.as_ref() == b"t" && a.value.as_ref() == b"s"
                });
            }
            Event::Start(e) if e.local_name().as_ref() == b"v" => in_value = true,
            Event::Text(t) if in_value => {
                let raw = t.unescape().map_err(ooxml)?;
                let value = raw.trim();
                if shared_ref {
                    if let Some(s) = value.parse::<usize>().ok().and_then(|i| shared.get(i)) {
                        cells.push(s.clone());
                    }
                } else if !value.is_empty() {
                    cells.push(value.to_string());
                }
            }
            Event::End(e) if e.local_name().as_ref() == b"v" => in_value = false,
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(cells)
}

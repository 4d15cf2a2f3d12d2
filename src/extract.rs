//! Format detection and per-format text extraction.
//!
//! Detection goes by magic bytes first and falls back to the filename
//! extension. Extractors are pure functions of bytes: they yield a
//! sequence of [`Segment`]s (text plus page/paragraph hints) that the
//! chunker consumes as a stream, and persist nothing.
//!
//! PDF extraction uses the text layer; pages with no text layer are
//! skipped with a warning (OCR for embedded scans is not attempted).
//! Images go straight to OCR, which shells out to a `tesseract`
//! executable when one is on `PATH` and reports `unsupported_format`
//! otherwise.

use std::io::Read;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::models::DocumentFormat;

/// A piece of extracted text with optional provenance hints.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub text: String,
    pub page: Option<i64>,
    pub paragraph: Option<i64>,
}

/// Lazily-consumed extraction output.
pub type SegmentStream = Box<dyn Iterator<Item = Segment> + Send>;

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "py", "js", "rs", "html", "css", "json", "xml", "csv", "log",
];
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tiff", "gif"];

/// Detect the document format from magic bytes, falling back to the
/// filename extension, then to `text` when the bytes look like UTF-8.
pub fn detect_format(filename: &str, bytes: &[u8]) -> DocumentFormat {
    if bytes.starts_with(b"%PDF-") {
        return DocumentFormat::Pdf;
    }
    if bytes.starts_with(b"PK\x03\x04") && zip_contains(bytes, "word/document.xml") {
        return DocumentFormat::Docx;
    }
    if bytes.starts_with(&[0x89, b'P', b'N', b'G'])
        || bytes.starts_with(&[0xFF, 0xD8, 0xFF])
        || bytes.starts_with(b"GIF8")
        || bytes.starts_with(b"BM")
        || bytes.starts_with(&[0x49, 0x49, 0x2A, 0x00])
        || bytes.starts_with(&[0x4D, 0x4D, 0x00, 0x2A])
    {
        return DocumentFormat::Image;
    }

    let ext = filename
        .rsplit('.')
        .next()
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    if TEXT_EXTENSIONS.contains(&ext.as_str()) {
        return DocumentFormat::Text;
    }
    if ext == "pdf" {
        return DocumentFormat::Pdf;
    }
    if ext == "docx" || ext == "doc" {
        return DocumentFormat::Docx;
    }
    if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
        return DocumentFormat::Image;
    }

    if std::str::from_utf8(bytes).is_ok() {
        DocumentFormat::Text
    } else {
        DocumentFormat::Other
    }
}

fn zip_contains(bytes: &[u8], name: &str) -> bool {
    match zip::ZipArchive::new(std::io::Cursor::new(bytes)) {
        Ok(archive) => archive.file_names().any(|n| n == name),
        Err(_) => false,
    }
}

/// Run the extractor for `format` over `bytes`.
pub fn extract(format: DocumentFormat, bytes: &[u8], ocr: &Ocr) -> Result<SegmentStream> {
    match format {
        DocumentFormat::Text => Ok(extract_text_plain(bytes)),
        DocumentFormat::Pdf => extract_pdf(bytes),
        DocumentFormat::Docx => extract_docx(bytes),
        DocumentFormat::Image => extract_image(bytes, ocr),
        DocumentFormat::Other => Err(Error::UnsupportedFormat(
            "no extractor for this file type".into(),
        )),
    }
}

// ── Plain text ──────────────────────────────────────────────────────────

fn extract_text_plain(bytes: &[u8]) -> SegmentStream {
    let text = String::from_utf8_lossy(bytes).into_owned();
    Box::new(paragraphs(text, None))
}

/// Split a body into paragraph segments lazily, numbering non-empty
/// paragraphs from zero.
fn paragraphs(text: String, page: Option<i64>) -> impl Iterator<Item = Segment> + Send {
    let parts: Vec<String> = text.split("\n\n").map(|p| p.to_string()).collect();
    parts
        .into_iter()
        .filter(|p| !p.trim().is_empty())
        .enumerate()
        .map(move |(i, p)| Segment {
            text: p.trim().to_string(),
            page,
            paragraph: Some(i as i64),
        })
}

// ── PDF ─────────────────────────────────────────────────────────────────

fn extract_pdf(bytes: &[u8]) -> Result<SegmentStream> {
    let text = pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| Error::ExtractionFailed(format!("pdf: {}", e)))?;

    // The text layer separates pages with form feeds when present.
    let mut segments: Vec<Segment> = Vec::new();
    for (page_no, page_text) in text.split('\u{c}').enumerate() {
        if page_text.trim().is_empty() {
            tracing::warn!(page = page_no + 1, "pdf page has no text layer, skipping");
            continue;
        }
        for seg in paragraphs(page_text.to_string(), Some(page_no as i64 + 1)) {
            segments.push(seg);
        }
    }
    Ok(Box::new(segments.into_iter()))
}

// ── DOCX ────────────────────────────────────────────────────────────────

fn extract_docx(bytes: &[u8]) -> Result<SegmentStream> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| Error::ExtractionFailed(format!("docx: {}", e)))?;

    let mut doc_xml = Vec::new();
    {
        let entry = archive
            .by_name("word/document.xml")
            .map_err(|_| Error::ExtractionFailed("word/document.xml not found".into()))?;
        // 50 MiB cap guards against zip bombs.
        entry
            .take(50 * 1024 * 1024)
            .read_to_end(&mut doc_xml)
            .map_err(|e| Error::ExtractionFailed(format!("docx: {}", e)))?;
    }

    let paragraphs = docx_paragraphs(&doc_xml)?;
    let segments: Vec<Segment> = paragraphs
        .into_iter()
        .filter(|p| !p.trim().is_empty())
        .enumerate()
        .map(|(i, p)| Segment {
            text: p.trim().to_string(),
            page: None,
            paragraph: Some(i as i64),
        })
        .collect();
    Ok(Box::new(segments.into_iter()))
}

/// Collect the text runs of each `w:p` paragraph in document order.
fn docx_paragraphs(xml: &[u8]) -> Result<Vec<String>> {
    use quick_xml::events::Event;

    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut out: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_text_run = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"p" => current.clear(),
                b"t" => in_text_run = true,
                _ => {}
            },
            Ok(Event::Text(t)) if in_text_run => {
                current.push_str(t.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text_run = false,
                b"p" => {
                    if !current.trim().is_empty() {
                        out.push(std::mem::take(&mut current));
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(Error::ExtractionFailed(format!("docx xml: {}", e))),
            _ => {}
        }
        buf.clear();
    }

    Ok(out)
}

// ── Images (OCR) ────────────────────────────────────────────────────────

/// OCR engine handle. Resolves a `tesseract` executable from `PATH` once;
/// absence is not an error until an image actually needs it.
#[derive(Debug, Clone, Default)]
pub struct Ocr {
    binary: Option<PathBuf>,
}

impl Ocr {
    pub fn detect() -> Ocr {
        let binary = std::env::var_os("PATH").and_then(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join("tesseract"))
                .find(|candidate| candidate.is_file())
        });
        Ocr { binary }
    }

    pub fn available(&self) -> bool {
        self.binary.is_some()
    }

    /// Run OCR over raw image bytes, returning recognized text.
    pub fn image_to_text(&self, bytes: &[u8]) -> Result<String> {
        let binary = self
            .binary
            .as_ref()
            .ok_or_else(|| Error::UnsupportedFormat("OCR not available (tesseract not found)".into()))?;

        let dir = tempdir_for_ocr()?;
        let input = dir.join("page.img");
        std::fs::write(&input, bytes)?;

        let output = std::process::Command::new(binary)
            .arg(&input)
            .arg("stdout")
            .output()
            .map_err(|e| Error::ExtractionFailed(format!("tesseract: {}", e)))?;

        std::fs::remove_file(&input).ok();
        std::fs::remove_dir(&dir).ok();

        if !output.status.success() {
            return Err(Error::ExtractionFailed(format!(
                "tesseract exited with {}",
                output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn tempdir_for_ocr() -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!("docbase-ocr-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn extract_image(bytes: &[u8], ocr: &Ocr) -> Result<SegmentStream> {
    let text = ocr.image_to_text(bytes)?;
    Ok(Box::new(paragraphs(text, None)))
}

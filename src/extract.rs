//! Per-file-type content processors.
//!
//! Each processor turns raw document bytes into plain text plus metadata.
//! Binary formats that cannot be read here yield a placeholder token and a
//! flag so a later stage can fill in the real text. A failing processor never
//! aborts a scan: [`ProcessorRegistry::process`] degrades to empty content
//! with a `processing_error` entry in the metadata.

use serde_json::{Map, Value};
use tracing::debug;

use crate::source::DocumentEntry;

pub const PDF_PLACEHOLDER: &str = "[PDF_CONTENT_PLACEHOLDER]";
pub const IMAGE_PLACEHOLDER: &str = "[IMAGE_OCR_PLACEHOLDER]";

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "tiff", "tif", "webp"];

#[derive(Debug)]
pub enum ExtractError {
    Pdf(String),
    Encoding(String),
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::Pdf(e) => write!(f, "PDF extraction failed: {}", e),
            ExtractError::Encoding(e) => write!(f, "decoding failed: {}", e),
        }
    }
}

impl std::error::Error for ExtractError {}

/// Text and metadata produced for one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Processed {
    pub content: String,
    pub metadata: Map<String, Value>,
}

pub trait ContentProcessor: Send + Sync {
    fn name(&self) -> &str;
    fn can_process(&self, entry: &DocumentEntry) -> bool;
    fn process(&self, entry: &DocumentEntry, bytes: &[u8]) -> Result<Processed, ExtractError>;
}

/// Ordered processor list; the first one that accepts a document wins.
pub struct ProcessorRegistry {
    processors: Vec<Box<dyn ContentProcessor>>,
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self {
            processors: vec![
                Box::new(MarkdownProcessor),
                Box::new(PdfProcessor),
                Box::new(ImageProcessor),
                Box::new(PlainTextProcessor),
            ],
        }
    }
}

impl ProcessorRegistry {
    pub fn empty() -> Self {
        Self {
            processors: Vec::new(),
        }
    }

    /// Register a processor ahead of the existing ones.
    pub fn register(&mut self, processor: Box<dyn ContentProcessor>) {
        self.processors.insert(0, processor);
    }

    pub fn process(&self, entry: &DocumentEntry, bytes: &[u8]) -> Processed {
        let Some(processor) = self.processors.iter().find(|p| p.can_process(entry)) else {
            return PlainTextProcessor
                .process(entry, bytes)
                .unwrap_or_else(failed);
        };
        match processor.process(entry, bytes) {
            Ok(processed) => processed,
            Err(e) => {
                debug!(path = %entry.path, processor = processor.name(), error = %e, "Processor failed");
                failed(e)
            }
        }
    }
}

fn failed(e: ExtractError) -> Processed {
    let mut metadata = Map::new();
    metadata.insert("processing_error".into(), Value::String(e.to_string()));
    Processed {
        content: String::new(),
        metadata,
    }
}

pub struct PlainTextProcessor;

impl ContentProcessor for PlainTextProcessor {
    fn name(&self) -> &str {
        "text"
    }

    fn can_process(&self, _entry: &DocumentEntry) -> bool {
        true
    }

    fn process(&self, _entry: &DocumentEntry, bytes: &[u8]) -> Result<Processed, ExtractError> {
        Ok(Processed {
            content: String::from_utf8_lossy(bytes).into_owned(),
            metadata: Map::new(),
        })
    }
}

/// Markdown with an optional leading `---` front-matter block of
/// `key: value` lines (and `- item` lists under an empty key).
pub struct MarkdownProcessor;

impl ContentProcessor for MarkdownProcessor {
    fn name(&self) -> &str {
        "markdown"
    }

    fn can_process(&self, entry: &DocumentEntry) -> bool {
        matches!(entry.extension().as_str(), "md" | "markdown")
    }

    fn process(&self, _entry: &DocumentEntry, bytes: &[u8]) -> Result<Processed, ExtractError> {
        let text = std::str::from_utf8(bytes).map_err(|e| ExtractError::Encoding(e.to_string()))?;
        let (metadata, body) = split_front_matter(text);
        Ok(Processed {
            content: body.to_string(),
            metadata,
        })
    }
}

/// Split a leading front-matter block off `text`. Without a closed block the
/// whole text is the body.
pub fn split_front_matter(text: &str) -> (Map<String, Value>, &str) {
    let mut metadata = Map::new();
    let Some(rest) = text
        .strip_prefix("---\n")
        .or_else(|| text.strip_prefix("---\r\n"))
    else {
        return (metadata, text);
    };

    let mut offset = 0;
    let mut body_start = None;
    for line in rest.split_inclusive('\n') {
        offset += line.len();
        if line.trim_end() == "---" {
            body_start = Some(offset);
            break;
        }
    }
    let Some(body_start) = body_start else {
        return (metadata, text);
    };

    let block = &rest[..body_start];
    let mut list_key: Option<String> = None;
    for line in block.lines() {
        let trimmed = line.trim();
        if trimmed == "---" || trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some(item) = trimmed.strip_prefix("- ") {
            if let Some(key) = &list_key {
                if let Some(Value::Array(items)) = metadata.get_mut(key) {
                    items.push(parse_scalar(item));
                }
            }
            continue;
        }
        if let Some((key, value)) = trimmed.split_once(':') {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            let value = value.trim();
            if value.is_empty() {
                metadata.insert(key.to_string(), Value::Array(Vec::new()));
                list_key = Some(key.to_string());
            } else {
                metadata.insert(key.to_string(), parse_scalar(value));
                list_key = None;
            }
        }
    }

    (metadata, &rest[body_start..])
}

fn parse_scalar(raw: &str) -> Value {
    let unquoted = raw
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .or_else(|| raw.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')));
    if let Some(s) = unquoted {
        return Value::String(s.to_string());
    }
    match raw {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        if f.is_finite() {
            return Value::from(f);
        }
    }
    Value::String(raw.to_string())
}

/// PDF text via `pdf-extract`; the placeholder when nothing usable comes out.
pub struct PdfProcessor;

impl ContentProcessor for PdfProcessor {
    fn name(&self) -> &str {
        "pdf"
    }

    fn can_process(&self, entry: &DocumentEntry) -> bool {
        entry.extension() == "pdf"
    }

    fn process(&self, entry: &DocumentEntry, bytes: &[u8]) -> Result<Processed, ExtractError> {
        let mut metadata = Map::new();
        match extract_pdf(bytes) {
            Ok(text) if !text.trim().is_empty() => Ok(Processed {
                content: text,
                metadata,
            }),
            outcome => {
                if let Err(e) = outcome {
                    debug!(path = %entry.path, error = %e, "PDF text unavailable, using placeholder");
                }
                metadata.insert("requiresExtraction".into(), Value::Bool(true));
                Ok(Processed {
                    content: PDF_PLACEHOLDER.to_string(),
                    metadata,
                })
            }
        }
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    // pdf-extract panics on some malformed inputs.
    std::panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes))
        .map_err(|_| ExtractError::Pdf("extractor panicked".to_string()))?
        .map_err(|e| ExtractError::Pdf(e.to_string()))
}

pub struct ImageProcessor;

impl ContentProcessor for ImageProcessor {
    fn name(&self) -> &str {
        "image"
    }

    fn can_process(&self, entry: &DocumentEntry) -> bool {
        IMAGE_EXTENSIONS.contains(&entry.extension().as_str())
    }

    fn process(&self, _entry: &DocumentEntry, _bytes: &[u8]) -> Result<Processed, ExtractError> {
        let mut metadata = Map::new();
        metadata.insert("requiresOCR".into(), Value::Bool(true));
        Ok(Processed {
            content: IMAGE_PLACEHOLDER.to_string(),
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str) -> DocumentEntry {
        DocumentEntry {
            path: path.to_string(),
            mtime: 0,
            size: 0,
        }
    }

    #[test]
    fn markdown_front_matter_folds_into_metadata() {
        let text = "---\ntitle: \"Daily\"\ncount: 3\ndraft: false\ntags:\n  - a\n  - b\n---\n# Body\n";
        let processed = ProcessorRegistry::default().process(&entry("n.md"), text.as_bytes());
        assert_eq!(processed.content, "# Body\n");
        assert_eq!(processed.metadata["title"], "Daily");
        assert_eq!(processed.metadata["count"], 3);
        assert_eq!(processed.metadata["draft"], false);
        assert_eq!(processed.metadata["tags"], serde_json::json!(["a", "b"]));
    }

    #[test]
    fn unterminated_front_matter_is_body() {
        let text = "---\ntitle: x\nno close";
        let (meta, body) = split_front_matter(text);
        assert!(meta.is_empty());
        assert_eq!(body, text);
    }

    #[test]
    fn plain_text_passes_through() {
        let processed = ProcessorRegistry::default().process(&entry("a.txt"), b"hello\n");
        assert_eq!(processed.content, "hello\n");
        assert!(processed.metadata.is_empty());
    }

    #[test]
    fn invalid_pdf_yields_placeholder() {
        let processed = ProcessorRegistry::default().process(&entry("doc.pdf"), b"not a pdf");
        assert_eq!(processed.content, PDF_PLACEHOLDER);
        assert_eq!(processed.metadata["requiresExtraction"], true);
    }

    #[test]
    fn images_yield_ocr_placeholder() {
        let processed = ProcessorRegistry::default().process(&entry("pic.PNG"), b"\x89PNG");
        assert_eq!(processed.content, IMAGE_PLACEHOLDER);
        assert_eq!(processed.metadata["requiresOCR"], true);
    }

    #[test]
    fn failing_processor_degrades_to_error_marker() {
        let processed = ProcessorRegistry::default().process(&entry("bad.md"), &[0xff, 0xfe, 0x00]);
        assert_eq!(processed.content, "");
        assert!(processed.metadata.contains_key("processing_error"));
    }
}

//! Text extraction for ingested files
//! Format-specific extraction sits behind `TextExtractor`; the built-in
//! extractor handles plain text and Markdown

use std::path::Path;

use thiserror::Error;

use crate::error::ErrorCategory;
use crate::validation::file_extension;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("No extractor for file type: {0}")]
    Unsupported(String),
    #[error("Failed to decode file: {0}")]
    Decode(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExtractError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Unsupported(_) | Self::Decode(_) => ErrorCategory::Validation,
            Self::Io(_) => ErrorCategory::Storage,
        }
    }
}

/// Produces plain text from a stored file
pub trait TextExtractor: Send + Sync {
    /// Whether this extractor handles the (lowercase) extension
    fn supports(&self, extension: &str) -> bool;

    fn extract(&self, path: &Path) -> Result<String, ExtractError>;
}

/// Plain text, CSV/JSON/log files and Markdown
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextExtractor;

const PLAIN_EXTENSIONS: &[&str] = &["txt", "text", "log", "csv", "json"];
const MARKDOWN_EXTENSIONS: &[&str] = &["md", "markdown"];

impl TextExtractor for PlainTextExtractor {
    fn supports(&self, extension: &str) -> bool {
        PLAIN_EXTENSIONS.contains(&extension) || MARKDOWN_EXTENSIONS.contains(&extension)
    }

    fn extract(&self, path: &Path) -> Result<String, ExtractError> {
        let ext = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(file_extension)
            .unwrap_or_default();
        if !self.supports(&ext) {
            return Err(ExtractError::Unsupported(ext));
        }

        let bytes = std::fs::read(path)?;
        let text = decode_text(&bytes);

        if MARKDOWN_EXTENSIONS.contains(&ext.as_str()) {
            Ok(markdown_to_text(&text))
        } else {
            Ok(text)
        }
    }
}

/// UTF-8 (BOM stripped), falling back to Windows-1252 for legacy files
pub fn decode_text(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (decoded, _, had_errors) = encoding_rs::WINDOWS_1252.decode(bytes);
            if had_errors {
                tracing::debug!("Lossy Windows-1252 decode of non-UTF-8 input");
            }
            decoded.into_owned()
        }
    }
}

/// Render Markdown as readable plain text
pub fn markdown_to_text(markdown: &str) -> String {
    use pulldown_cmark::{Event, Tag, TagEnd};

    let mut out = String::with_capacity(markdown.len());
    for event in pulldown_cmark::Parser::new(markdown) {
        match event {
            Event::Text(text) | Event::Code(text) => out.push_str(&text),
            Event::SoftBreak | Event::HardBreak => out.push('\n'),
            Event::End(TagEnd::Heading(_)) | Event::End(TagEnd::Paragraph) => {
                out.push_str("\n\n");
            }
            Event::Start(Tag::Item) => out.push_str("- "),
            Event::End(TagEnd::Item) => out.push('\n'),
            Event::End(TagEnd::List(_)) | Event::End(TagEnd::CodeBlock) => out.push('\n'),
            _ => {}
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_markdown_to_text() {
        let md = "# Title\n\nSome *emphasis* and `code`.\n\n- one\n- two\n";
        let text = markdown_to_text(md);
        assert!(text.starts_with("Title"));
        assert!(text.contains("Some emphasis and code."));
        assert!(text.contains("- one\n- two"));
        assert!(!text.contains('#'));
        assert!(!text.contains('*'));
    }

    #[test]
    fn test_decode_strips_bom() {
        assert_eq!(decode_text(b"\xEF\xBB\xBFhello"), "hello");
    }

    #[test]
    fn test_decode_windows_1252_fallback() {
        // "café" with 0xE9 for é
        assert_eq!(decode_text(b"caf\xE9"), "café");
    }

    #[test]
    fn test_extract_plain_and_markdown() {
        let dir = TempDir::new().unwrap();
        let txt = dir.path().join("f1_notes.txt");
        std::fs::write(&txt, "plain body").unwrap();
        let md = dir.path().join("f2_readme.md");
        std::fs::write(&md, "## Setup\n\nRun it.").unwrap();

        let extractor = PlainTextExtractor;
        assert_eq!(extractor.extract(&txt).unwrap(), "plain body");
        assert_eq!(extractor.extract(&md).unwrap(), "Setup\n\nRun it.");
    }

    #[test]
    fn test_extract_unsupported() {
        let dir = TempDir::new().unwrap();
        let pdf = dir.path().join("doc.pdf");
        std::fs::write(&pdf, b"%PDF-1.7").unwrap();
        assert!(matches!(
            PlainTextExtractor.extract(&pdf),
            Err(ExtractError::Unsupported(_))
        ));
    }
}

//! Input validation module for LocalRAG
//! Upload allow-listing, identifier checks and storage path confinement

use std::path::{Component, Path, PathBuf};
use thiserror::Error;

use crate::config::IngestConfig;

/// Maximum size for note bodies and queries (10MB)
pub const MAX_TEXT_INPUT_BYTES: usize = 10 * 1024 * 1024;

/// Maximum length for collection/file identifiers
pub const MAX_ID_LEN: usize = 256;

/// Maximum length kept from an uploaded file name
const MAX_FILE_NAME_LEN: usize = 120;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Path traversal detected: path escapes allowed directory")]
    PathTraversal,
    #[error("Input exceeds size limit: {size} bytes (max: {max} bytes)")]
    InputTooLarge { size: u64, max: u64 },
    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),
    #[error("Invalid identifier: {0}")]
    InvalidId(String),
    #[error("Invalid input format: {0}")]
    InvalidFormat(String),
    #[error("Empty input not allowed")]
    EmptyInput,
}

/// Validate an identifier used for collections, files and records.
///
/// Allowlist approach: only `[a-zA-Z0-9_-]`, 1..=256 chars. Rejects rather than
/// sanitizes, so ids can be embedded in vector-store filter expressions as-is.
pub fn sanitize_id(id: &str) -> Option<String> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return None;
    }

    if id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        Some(id.to_string())
    } else {
        None
    }
}

/// Like [`sanitize_id`] but returns a validation error naming the field
pub fn validate_id(field: &str, id: &str) -> Result<String, ValidationError> {
    sanitize_id(id).ok_or_else(|| ValidationError::InvalidId(format!("{}: {:?}", field, id)))
}

/// Extension of a file name, lowercased
pub fn file_extension(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

/// Check an upload against the size limit and extension allow-list.
/// Performs no I/O.
pub fn validate_upload(
    file_name: &str,
    size_bytes: u64,
    config: &IngestConfig,
) -> Result<(), ValidationError> {
    if file_name.trim().is_empty() {
        return Err(ValidationError::EmptyInput);
    }
    if size_bytes == 0 {
        return Err(ValidationError::EmptyInput);
    }
    if size_bytes > config.max_file_bytes {
        return Err(ValidationError::InputTooLarge {
            size: size_bytes,
            max: config.max_file_bytes,
        });
    }

    let ext = file_extension(file_name)
        .ok_or_else(|| ValidationError::UnsupportedFileType(file_name.to_string()))?;
    if !config.allowed_extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(&ext)) {
        return Err(ValidationError::UnsupportedFileType(ext));
    }

    Ok(())
}

/// Reduce a user-supplied file name to a safe single path component
pub fn sanitize_file_name(file_name: &str) -> String {
    let base = Path::new(file_name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');

    if cleaned.is_empty() {
        return "upload".to_string();
    }

    // Keep the extension when truncating
    if cleaned.chars().count() > MAX_FILE_NAME_LEN {
        let ext = file_extension(cleaned).unwrap_or_default();
        let keep = MAX_FILE_NAME_LEN.saturating_sub(ext.len() + 1);
        let stem: String = cleaned.chars().take(keep).collect();
        if ext.is_empty() {
            return stem;
        }
        return format!("{}.{}", stem, ext);
    }

    cleaned.to_string()
}

/// Join `relative` onto `root`, refusing anything that could escape `root`
pub fn confined_join(root: &Path, relative: &Path) -> Result<PathBuf, ValidationError> {
    for component in relative.components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(ValidationError::PathTraversal),
        }
    }
    Ok(root.join(relative))
}

/// Validate text input size
pub fn validate_text_size(text: &str, max_bytes: usize) -> Result<(), ValidationError> {
    let size = text.len();
    if size > max_bytes {
        return Err(ValidationError::InputTooLarge {
            size: size as u64,
            max: max_bytes as u64,
        });
    }
    Ok(())
}

/// Validate non-empty input
pub fn validate_non_empty(text: &str) -> Result<(), ValidationError> {
    if text.trim().is_empty() {
        return Err(ValidationError::EmptyInput);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_id_valid() {
        assert_eq!(
            sanitize_id("550e8400-e29b-41d4-a716-446655440000"),
            Some("550e8400-e29b-41d4-a716-446655440000".to_string())
        );
        assert_eq!(sanitize_id("kb_123"), Some("kb_123".to_string()));
    }

    #[test]
    fn test_sanitize_id_rejects_special_chars() {
        assert_eq!(sanitize_id("test'id"), None);
        assert_eq!(sanitize_id("test id"), None);
        assert_eq!(sanitize_id("'; DROP TABLE --"), None);
        assert_eq!(sanitize_id("../etc"), None);
    }

    #[test]
    fn test_sanitize_id_length_limits() {
        assert_eq!(sanitize_id(""), None);
        assert_eq!(sanitize_id(&"a".repeat(300)), None);
        assert!(sanitize_id(&"a".repeat(256)).is_some());
    }

    #[test]
    fn test_validate_upload_allows_known_types() {
        let config = IngestConfig::default();
        assert!(validate_upload("notes.md", 10, &config).is_ok());
        assert!(validate_upload("REPORT.TXT", 10, &config).is_ok());
    }

    #[test]
    fn test_validate_upload_rejects() {
        let config = IngestConfig::default();
        assert!(matches!(
            validate_upload("malware.exe", 10, &config),
            Err(ValidationError::UnsupportedFileType(_))
        ));
        assert!(matches!(
            validate_upload("noext", 10, &config),
            Err(ValidationError::UnsupportedFileType(_))
        ));
        assert!(matches!(
            validate_upload("big.txt", config.max_file_bytes + 1, &config),
            Err(ValidationError::InputTooLarge { .. })
        ));
        assert!(matches!(
            validate_upload("empty.txt", 0, &config),
            Err(ValidationError::EmptyInput)
        ));
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("report.txt"), "report.txt");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("my notes (v2).md"), "my_notes__v2_.md");
        assert_eq!(sanitize_file_name(".hidden"), "hidden");
        assert_eq!(sanitize_file_name(""), "upload");
    }

    #[test]
    fn test_sanitize_file_name_truncates_keeping_extension() {
        let long = format!("{}.md", "a".repeat(500));
        let cleaned = sanitize_file_name(&long);
        assert!(cleaned.chars().count() <= 120);
        assert!(cleaned.ends_with(".md"));
    }

    #[test]
    fn test_confined_join() {
        let root = Path::new("/data/files");
        assert_eq!(
            confined_join(root, Path::new("kb1/f1_a.txt")).unwrap(),
            PathBuf::from("/data/files/kb1/f1_a.txt")
        );
        assert!(matches!(
            confined_join(root, Path::new("../escape.txt")),
            Err(ValidationError::PathTraversal)
        ));
        assert!(matches!(
            confined_join(root, Path::new("/etc/passwd")),
            Err(ValidationError::PathTraversal)
        ));
    }

    #[test]
    fn test_validate_text_size() {
        assert!(validate_text_size("hello", 1000).is_ok());
        assert!(matches!(
            validate_text_size(&"x".repeat(1001), 1000),
            Err(ValidationError::InputTooLarge { .. })
        ));
    }

    #[test]
    fn test_validate_non_empty() {
        assert!(validate_non_empty("hello").is_ok());
        assert!(matches!(validate_non_empty("   "), Err(ValidationError::EmptyInput)));
    }
}

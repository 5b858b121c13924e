//! Application error types for LocalRAG
//!
//! Provides a unified error model across the pipelines with:
//! - Stable error codes for UI/CLI handling
//! - User-friendly messages
//! - Optional internal details for logging
//! - Retry hints

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::ConfigError;
use crate::jobs::QueueError;
use crate::kb::embeddings::EmbeddingError;
use crate::kb::ingest::extract::ExtractError;
use crate::kb::ingest::IngestError;
use crate::kb::lifecycle::LifecycleError;
use crate::kb::metadata::MetadataError;
use crate::kb::search::SearchError;
use crate::kb::vectors::VectorError;
use crate::runtime::ProvisionError;
use crate::validation::ValidationError;

/// Error categories for grouping and UI display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Bad input; nothing was changed, retrying will not help
    Validation,
    /// Runtime answered with a failure
    Upstream,
    /// Runtime did not answer in time
    Timeout,
    /// Bundled assets missing or model never became available
    Provisioning,
    /// Disk or vector-store failure
    Storage,
    NotFound,
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::Upstream => write!(f, "upstream"),
            Self::Timeout => write!(f, "timeout"),
            Self::Provisioning => write!(f, "provisioning"),
            Self::Storage => write!(f, "storage"),
            Self::NotFound => write!(f, "not_found"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

impl ErrorCategory {
    /// Upstream failures and timeouts may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Upstream | Self::Timeout)
    }
}

/// Stable error codes
/// Format: CATEGORY_SPECIFIC_ERROR
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCode(pub String);

impl ErrorCode {
    // Validation errors
    pub const VALIDATION_PATH_TRAVERSAL: &'static str = "VALIDATION_PATH_TRAVERSAL";
    pub const VALIDATION_EMPTY_INPUT: &'static str = "VALIDATION_EMPTY_INPUT";
    pub const VALIDATION_INPUT_TOO_LARGE: &'static str = "VALIDATION_INPUT_TOO_LARGE";
    pub const VALIDATION_UNSUPPORTED_TYPE: &'static str = "VALIDATION_UNSUPPORTED_TYPE";
    pub const VALIDATION_INVALID_ID: &'static str = "VALIDATION_INVALID_ID";
    pub const VALIDATION_INVALID_FORMAT: &'static str = "VALIDATION_INVALID_FORMAT";
    pub const VALIDATION_EMPTY_DOCUMENT: &'static str = "VALIDATION_EMPTY_DOCUMENT";

    // Runtime errors
    pub const UPSTREAM_RUNTIME_ERROR: &'static str = "UPSTREAM_RUNTIME_ERROR";
    pub const UPSTREAM_INVALID_RESPONSE: &'static str = "UPSTREAM_INVALID_RESPONSE";
    pub const TIMEOUT_RUNTIME: &'static str = "TIMEOUT_RUNTIME";

    // Provisioning errors
    pub const PROVISIONING_ASSET_MISSING: &'static str = "PROVISIONING_ASSET_MISSING";
    pub const PROVISIONING_RUNTIME_UNAVAILABLE: &'static str = "PROVISIONING_RUNTIME_UNAVAILABLE";
    pub const PROVISIONING_MODEL_UNAVAILABLE: &'static str = "PROVISIONING_MODEL_UNAVAILABLE";

    // Storage errors
    pub const STORAGE_VECTOR_FAILED: &'static str = "STORAGE_VECTOR_FAILED";
    pub const STORAGE_IO_FAILED: &'static str = "STORAGE_IO_FAILED";
    pub const STORAGE_METADATA_FAILED: &'static str = "STORAGE_METADATA_FAILED";
    pub const STORAGE_VERIFY_FAILED: &'static str = "STORAGE_VERIFY_FAILED";

    // Not found errors
    pub const NOT_FOUND_COLLECTION: &'static str = "NOT_FOUND_COLLECTION";
    pub const NOT_FOUND_RECORD: &'static str = "NOT_FOUND_RECORD";

    // Internal errors
    pub const INTERNAL_ERROR: &'static str = "INTERNAL_ERROR";
    pub const INTERNAL_QUEUE: &'static str = "INTERNAL_QUEUE";
    pub const INTERNAL_CONFIG: &'static str = "INTERNAL_CONFIG";

    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Surface error handed to the UI/CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppError {
    /// Stable error code
    pub code: String,
    /// User-friendly error message
    pub message: String,
    /// Optional internal details for logging (not shown to user)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Whether the operation can be retried
    pub retryable: bool,
    pub category: ErrorCategory,
}

impl AppError {
    pub fn new(
        code: impl Into<String>,
        message: impl Into<String>,
        category: ErrorCategory,
    ) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            detail: None,
            retryable: category.is_retryable(),
            category,
        }
    }

    /// Add internal detail for logging
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    // =========================================================================
    // Convenience constructors
    // =========================================================================

    pub fn runtime_failed(detail: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::UPSTREAM_RUNTIME_ERROR,
            "The local model runtime returned an error",
            ErrorCategory::Upstream,
        )
        .with_detail(detail)
    }

    pub fn runtime_timeout(secs: u64) -> Self {
        Self::new(
            ErrorCode::TIMEOUT_RUNTIME,
            format!("The local model runtime did not respond within {}s", secs),
            ErrorCategory::Timeout,
        )
    }

    /// Provisioning failures surface as the feature being unavailable
    pub fn feature_unavailable(code: &str, detail: impl Into<String>) -> Self {
        Self::new(
            code,
            "Offline document search is unavailable: required local assets are missing",
            ErrorCategory::Provisioning,
        )
        .with_detail(detail)
    }

    pub fn storage_failed(code: &str, detail: impl Into<String>) -> Self {
        Self::new(code, "Saving search data failed", ErrorCategory::Storage).with_detail(detail)
    }

    pub fn not_found(code: &str, what: impl Into<String>) -> Self {
        Self::new(code, format!("Not found: {}", what.into()), ErrorCategory::NotFound)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::INTERNAL_ERROR,
            "An internal error occurred",
            ErrorCategory::Internal,
        )
        .with_detail(detail)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

impl From<&ValidationError> for AppError {
    fn from(e: &ValidationError) -> Self {
        let code = match e {
            ValidationError::PathTraversal => ErrorCode::VALIDATION_PATH_TRAVERSAL,
            ValidationError::InputTooLarge { .. } => ErrorCode::VALIDATION_INPUT_TOO_LARGE,
            ValidationError::UnsupportedFileType(_) => ErrorCode::VALIDATION_UNSUPPORTED_TYPE,
            ValidationError::InvalidId(_) => ErrorCode::VALIDATION_INVALID_ID,
            ValidationError::InvalidFormat(_) => ErrorCode::VALIDATION_INVALID_FORMAT,
            ValidationError::EmptyInput => ErrorCode::VALIDATION_EMPTY_INPUT,
        };
        Self::new(code, e.to_string(), ErrorCategory::Validation)
    }
}

impl From<&ProvisionError> for AppError {
    fn from(e: &ProvisionError) -> Self {
        match e {
            ProvisionError::MissingAsset(_) => {
                Self::feature_unavailable(ErrorCode::PROVISIONING_ASSET_MISSING, e.to_string())
            }
            ProvisionError::Io(_) => Self::storage_failed(ErrorCode::STORAGE_IO_FAILED, e.to_string()),
            ProvisionError::Http(_) => Self::runtime_failed(e.to_string()),
            _ => Self::new(
                ErrorCode::PROVISIONING_RUNTIME_UNAVAILABLE,
                "The local model runtime could not be started",
                ErrorCategory::Provisioning,
            )
            .with_detail(e.to_string()),
        }
    }
}

impl From<&EmbeddingError> for AppError {
    fn from(e: &EmbeddingError) -> Self {
        match e {
            EmbeddingError::EmptyInput => Self::new(
                ErrorCode::VALIDATION_EMPTY_INPUT,
                "Text to embed cannot be empty",
                ErrorCategory::Validation,
            ),
            EmbeddingError::Timeout { secs } => Self::runtime_timeout(*secs),
            EmbeddingError::InvalidResponse(_) => Self::new(
                ErrorCode::UPSTREAM_INVALID_RESPONSE,
                "The local model runtime returned an unexpected response",
                ErrorCategory::Upstream,
            )
            .with_detail(e.to_string()),
            EmbeddingError::Provisioning(_) => {
                Self::feature_unavailable(ErrorCode::PROVISIONING_MODEL_UNAVAILABLE, e.to_string())
            }
            EmbeddingError::Upstream { .. } | EmbeddingError::Transport(_) => {
                Self::runtime_failed(e.to_string())
            }
        }
    }
}

impl From<&VectorError> for AppError {
    fn from(e: &VectorError) -> Self {
        match e {
            VectorError::CollectionNotFound(id) => {
                Self::not_found(ErrorCode::NOT_FOUND_COLLECTION, format!("collection {}", id))
            }
            VectorError::InvalidId(_) => Self::new(
                ErrorCode::VALIDATION_INVALID_ID,
                e.to_string(),
                ErrorCategory::Validation,
            ),
            VectorError::DimensionMismatch { .. } => Self::new(
                ErrorCode::VALIDATION_INVALID_FORMAT,
                e.to_string(),
                ErrorCategory::Validation,
            ),
            _ => Self::storage_failed(ErrorCode::STORAGE_VECTOR_FAILED, e.to_string()),
        }
    }
}

impl From<&ExtractError> for AppError {
    fn from(e: &ExtractError) -> Self {
        match e {
            ExtractError::Io(_) => Self::storage_failed(ErrorCode::STORAGE_IO_FAILED, e.to_string()),
            ExtractError::Unsupported(_) => Self::new(
                ErrorCode::VALIDATION_UNSUPPORTED_TYPE,
                e.to_string(),
                ErrorCategory::Validation,
            ),
            ExtractError::Decode(_) => Self::new(
                ErrorCode::VALIDATION_INVALID_FORMAT,
                e.to_string(),
                ErrorCategory::Validation,
            ),
        }
    }
}

impl From<&MetadataError> for AppError {
    fn from(e: &MetadataError) -> Self {
        match e {
            MetadataError::NotFound(what) => Self::not_found(ErrorCode::NOT_FOUND_RECORD, what.clone()),
            _ => Self::storage_failed(ErrorCode::STORAGE_METADATA_FAILED, e.to_string()),
        }
    }
}

impl From<&QueueError> for AppError {
    fn from(e: &QueueError) -> Self {
        Self::new(
            ErrorCode::INTERNAL_QUEUE,
            "The background job did not complete",
            ErrorCategory::Internal,
        )
        .with_detail(e.to_string())
    }
}

impl From<&IngestError> for AppError {
    fn from(e: &IngestError) -> Self {
        match e {
            IngestError::Validation(inner) => inner.into(),
            IngestError::Extract(inner) => inner.into(),
            IngestError::Embedding(inner) => inner.into(),
            IngestError::Vector(inner) => inner.into(),
            IngestError::Queue(inner) => inner.into(),
            IngestError::EmptyText(_) => Self::new(
                ErrorCode::VALIDATION_EMPTY_DOCUMENT,
                e.to_string(),
                ErrorCategory::Validation,
            ),
            IngestError::ModelUnavailable(_) => {
                Self::feature_unavailable(ErrorCode::PROVISIONING_MODEL_UNAVAILABLE, e.to_string())
            }
            IngestError::CountMismatch { .. } => {
                Self::storage_failed(ErrorCode::STORAGE_VERIFY_FAILED, e.to_string())
            }
            IngestError::Io(_) => Self::storage_failed(ErrorCode::STORAGE_IO_FAILED, e.to_string()),
        }
    }
}

impl From<&SearchError> for AppError {
    fn from(e: &SearchError) -> Self {
        match e {
            SearchError::Validation(inner) => inner.into(),
            SearchError::Embedding(inner) => inner.into(),
            SearchError::Queue(inner) => inner.into(),
        }
    }
}

impl From<&LifecycleError> for AppError {
    fn from(e: &LifecycleError) -> Self {
        match e {
            LifecycleError::Validation(inner) => inner.into(),
            LifecycleError::Vector(inner) => inner.into(),
            LifecycleError::Metadata(inner) => inner.into(),
            LifecycleError::Io(_) => Self::storage_failed(ErrorCode::STORAGE_IO_FAILED, e.to_string()),
        }
    }
}

impl From<&ConfigError> for AppError {
    fn from(e: &ConfigError) -> Self {
        Self::new(
            ErrorCode::INTERNAL_CONFIG,
            "Configuration is invalid",
            ErrorCategory::Internal,
        )
        .with_detail(e.to_string())
    }
}

// Owned conversions for `?` at the surface
macro_rules! from_owned {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for AppError {
                fn from(e: $ty) -> Self {
                    Self::from(&e)
                }
            }
        )*
    };
}

from_owned!(
    ValidationError,
    ProvisionError,
    EmbeddingError,
    VectorError,
    ExtractError,
    MetadataError,
    QueueError,
    IngestError,
    SearchError,
    LifecycleError,
    ConfigError,
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_error_serialization() {
        let err = AppError::from(ValidationError::PathTraversal);
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("VALIDATION_PATH_TRAVERSAL"));
        assert!(json.contains("\"validation\""));
    }

    #[test]
    fn test_timeout_is_retryable() {
        let err = AppError::from(EmbeddingError::Timeout { secs: 60 });
        assert_eq!(err.category, ErrorCategory::Timeout);
        assert!(err.retryable);
        assert_eq!(err.code, ErrorCode::TIMEOUT_RUNTIME);
    }

    #[test]
    fn test_missing_asset_is_feature_unavailable() {
        let err = AppError::from(ProvisionError::MissingAsset(PathBuf::from("/bundle/runtime")));
        assert_eq!(err.category, ErrorCategory::Provisioning);
        assert!(!err.retryable);
        assert!(err.message.contains("unavailable"));
        assert!(err.detail.unwrap().contains("/bundle/runtime"));
    }

    #[test]
    fn test_nested_ingest_error_keeps_inner_code() {
        let err = AppError::from(IngestError::Vector(VectorError::LanceDb("disk full".into())));
        assert_eq!(err.code, ErrorCode::STORAGE_VECTOR_FAILED);
        assert_eq!(err.category, ErrorCategory::Storage);
    }

    #[test]
    fn test_error_display() {
        let err = AppError::from(IngestError::ModelUnavailable("demo-model".into()));
        let display = err.to_string();
        assert!(display.contains("PROVISIONING_MODEL_UNAVAILABLE"));
    }
}

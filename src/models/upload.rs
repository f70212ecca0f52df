//! Transient per-part types used while an upload request is processed.

use serde::{Deserialize, Serialize};

/// Descriptor of one multipart part, captured before its bytes are read.
#[derive(Clone, Debug, Default)]
pub struct PartInfo {
    /// Client-declared filename. Not trusted as a storage key.
    pub filename: String,

    /// Declared `Content-Type` of the part, if any.
    pub content_type: Option<String>,
}

/// Outcome of one part. Exactly one is produced per dispatched part.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UploadResult {
    pub filename: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UploadResult {
    pub fn ok(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            error: None,
        }
    }

    pub fn failed(filename: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            error: Some(cause.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::ids::{AttachmentId, ChatEntryId, NotebookId};

/// Most entries one `chat_history` call returns, oldest first.
pub const CHAT_HISTORY_LIMIT: usize = 100;

/// Type recorded for files without an extension.
pub const FALLBACK_FILE_TYPE: &str = "bin";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notebook {
    pub id: NotebookId,
    pub title: String,
    pub created_at: i64,
    pub last_accessed: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub id: ChatEntryId,
    pub notebook_id: NotebookId,
    pub role: ChatRole,
    pub message: String,
    pub timestamp: i64,
}

/// Ingestion status written by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    #[default]
    Pending,
    Ready,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: AttachmentId,
    pub notebook_id: NotebookId,
    pub file_name: String,
    pub file_path: String,
    pub file_size: u64,
    pub file_type: String,
    pub created_at: i64,
    #[serde(default)]
    pub status: ProcessingStatus,
}

/// File metadata handed back by a file picker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PickedFile {
    pub path: String,
    pub size_bytes: u64,
}

impl PickedFile {
    pub fn new(path: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            path: path.into(),
            size_bytes,
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        Path::new(&self.path)
            .file_name()
            .and_then(|name| name.to_str())
    }

    pub fn file_type(&self) -> String {
        Path::new(&self.path)
            .extension()
            .and_then(|extension| extension.to_str())
            .unwrap_or(FALLBACK_FILE_TYPE)
            .to_string()
    }
}

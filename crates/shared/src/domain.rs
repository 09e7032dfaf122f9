use std::{
    fmt,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const FALLBACK_FILE_NAME: &str = "upload.bin";

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

id_newtype!(UploadId);

/// Lifecycle of a queued upload.
///
/// `Queued -> Uploading -> {Completed | Failed | Cancelled}`, plus
/// `Failed -> Queued` on an explicit retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Queued,
    Uploading,
    Completed,
    Failed,
    Cancelled,
}

impl UploadStatus {
    pub fn can_transition_to(self, next: UploadStatus) -> bool {
        matches!(
            (self, next),
            (UploadStatus::Queued, UploadStatus::Uploading)
                | (UploadStatus::Uploading, UploadStatus::Completed)
                | (UploadStatus::Uploading, UploadStatus::Failed)
                | (UploadStatus::Uploading, UploadStatus::Cancelled)
                | (UploadStatus::Failed, UploadStatus::Queued)
        )
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UploadStatus::Queued => "queued",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
            UploadStatus::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Where the bytes of a payload come from. Path sources are read when the
/// upload starts, not when the file is enqueued.
#[derive(Debug, Clone)]
pub enum PayloadSource {
    Bytes(Bytes),
    Path(PathBuf),
}

#[derive(Debug, Clone)]
pub struct FilePayload {
    pub file_name: String,
    pub mime_type: Option<String>,
    pub source: PayloadSource,
}

impl FilePayload {
    pub fn from_bytes(file_name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: None,
            source: PayloadSource::Bytes(bytes.into()),
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            file_name: file_name_for(&path),
            mime_type: None,
            source: PayloadSource::Path(path),
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    /// Size in bytes, when known without touching the filesystem.
    pub fn known_len(&self) -> Option<u64> {
        match &self.source {
            PayloadSource::Bytes(bytes) => Some(bytes.len() as u64),
            PayloadSource::Path(_) => None,
        }
    }
}

fn file_name_for(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string())
}

/// Aggregate counters over the items currently held by a queue.
///
/// `total` always equals the sum of the five status buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub queued: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl QueueStats {
    pub fn is_idle(&self) -> bool {
        self.queued == 0 && self.active == 0
    }
}

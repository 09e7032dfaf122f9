use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Network,
    UploadFailed,
    Aborted,
    Payload,
}

/// Why a single upload attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum UploadError {
    /// No response was received.
    #[error("network error: {message}")]
    Network { message: String },
    /// A response arrived with a non-2xx status.
    #[error("upload failed with status {status} {status_text}")]
    UploadFailed { status: u16, status_text: String },
    #[error("upload aborted")]
    Aborted,
    /// The payload could not be read before sending.
    #[error("could not read payload: {message}")]
    Payload { message: String },
}

impl UploadError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn upload_failed(status: u16, status_text: impl Into<String>) -> Self {
        Self::UploadFailed {
            status,
            status_text: status_text.into(),
        }
    }

    pub fn payload(message: impl Into<String>) -> Self {
        Self::Payload {
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            UploadError::Network { .. } => ErrorCode::Network,
            UploadError::UploadFailed { .. } => ErrorCode::UploadFailed,
            UploadError::Aborted => ErrorCode::Aborted,
            UploadError::Payload { .. } => ErrorCode::Payload,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            UploadError::UploadFailed { status, .. } => Some(*status),
            _ => None,
        }
    }
}

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_FIELD_NAME: &str = "file";

/// Per-batch upload settings. Nothing here is validated at enqueue time; a
/// bad endpoint surfaces later as a failed upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadOptions {
    pub endpoint: String,
    #[serde(default = "default_field_name")]
    pub field_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Extra text parts sent alongside the file.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

fn default_field_name() -> String {
    DEFAULT_FIELD_NAME.to_string()
}

impl UploadOptions {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            field_name: default_field_name(),
            token: None,
            extra: BTreeMap::new(),
        }
    }

    pub fn with_field_name(mut self, field_name: impl Into<String>) -> Self {
        self.field_name = field_name.into();
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

/// Body of a successful upload response: JSON when it parses, raw text
/// otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum UploadResponse {
    Json(serde_json::Value),
    Text(String),
}

impl UploadResponse {
    pub fn from_body(body: String) -> Self {
        match serde_json::from_str(&body) {
            Ok(value) => UploadResponse::Json(value),
            Err(_) => UploadResponse::Text(body),
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            UploadResponse::Json(value) => Some(value),
            UploadResponse::Text(_) => None,
        }
    }
}

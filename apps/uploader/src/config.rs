use std::{collections::BTreeMap, fs, path::Path};

use anyhow::{anyhow, bail, Context};
use serde::Deserialize;
use tracing::warn;
use upload_queue::{DEFAULT_FIELD_NAME, DEFAULT_MAX_CONCURRENT};
use url::Url;

pub const DEFAULT_CONFIG_FILE: &str = "uploader.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub endpoint: Option<String>,
    pub field_name: String,
    pub token: Option<String>,
    pub max_concurrent: usize,
    pub timeout_secs: Option<u64>,
    pub retries: u32,
    pub extra: BTreeMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            endpoint: None,
            field_name: DEFAULT_FIELD_NAME.into(),
            token: None,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            timeout_secs: None,
            retries: 0,
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileSettings {
    endpoint: Option<String>,
    field_name: Option<String>,
    token: Option<String>,
    max_concurrent: Option<usize>,
    timeout_secs: Option<u64>,
    retries: Option<u32>,
    extra: BTreeMap<String, String>,
}

/// Defaults, then the TOML file, then environment variables. An explicit
/// `config_path` must exist; the default file is optional.
pub fn load_settings(config_path: Option<&Path>) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    match config_path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file '{}'", path.display()))?;
            apply_file(&mut settings, &raw)
                .with_context(|| format!("invalid config file '{}'", path.display()))?;
        }
        None => {
            if let Ok(raw) = fs::read_to_string(DEFAULT_CONFIG_FILE) {
                apply_file(&mut settings, &raw)
                    .with_context(|| format!("invalid config file '{DEFAULT_CONFIG_FILE}'"))?;
            }
        }
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn apply_file(settings: &mut Settings, raw: &str) -> anyhow::Result<()> {
    let file_cfg: FileSettings = toml::from_str(raw)?;

    if let Some(v) = file_cfg.endpoint {
        settings.endpoint = Some(v);
    }
    if let Some(v) = file_cfg.field_name {
        settings.field_name = v;
    }
    if let Some(v) = file_cfg.token {
        settings.token = Some(v);
    }
    if let Some(v) = file_cfg.max_concurrent {
        settings.max_concurrent = v;
    }
    if let Some(v) = file_cfg.timeout_secs {
        settings.timeout_secs = Some(v);
    }
    if let Some(v) = file_cfg.retries {
        settings.retries = v;
    }
    settings.extra.extend(file_cfg.extra);

    Ok(())
}

// `APP__*` takes precedence over the `UPLOADER_*` spelling.
fn apply_env(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    let lookup = |name: &str| {
        var(&format!("APP__{name}")).or_else(|| var(&format!("UPLOADER_{name}")))
    };

    if let Some(v) = lookup("ENDPOINT") {
        settings.endpoint = Some(v);
    }
    if let Some(v) = lookup("FIELD_NAME") {
        settings.field_name = v;
    }
    if let Some(v) = lookup("TOKEN") {
        settings.token = Some(v);
    }
    if let Some(v) = lookup("MAX_CONCURRENT") {
        match v.parse::<usize>() {
            Ok(parsed) => settings.max_concurrent = parsed,
            Err(_) => warn!(value = %v, "ignoring invalid MAX_CONCURRENT"),
        }
    }
    if let Some(v) = lookup("TIMEOUT_SECS") {
        match v.parse::<u64>() {
            Ok(parsed) => settings.timeout_secs = Some(parsed),
            Err(_) => warn!(value = %v, "ignoring invalid TIMEOUT_SECS"),
        }
    }
    if let Some(v) = lookup("RETRIES") {
        match v.parse::<u32>() {
            Ok(parsed) => settings.retries = parsed,
            Err(_) => warn!(value = %v, "ignoring invalid RETRIES"),
        }
    }
}

pub fn validate_endpoint(endpoint: Option<&str>) -> anyhow::Result<Url> {
    let raw = endpoint
        .map(str::trim)
        .filter(|endpoint| !endpoint.is_empty())
        .ok_or_else(|| {
            anyhow!("no upload endpoint configured; pass --endpoint or set UPLOADER_ENDPOINT")
        })?;

    let url = Url::parse(raw).with_context(|| format!("invalid upload endpoint '{raw}'"))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("upload endpoint must be http or https, got '{}'", url.scheme());
    }
    Ok(url)
}

/// Parses a `key=value` pair given on the command line.
pub fn parse_extra_field(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty field name in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;

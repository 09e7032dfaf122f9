use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use upload_queue::{
    FilePayload, HttpTransportConfig, HttpUploadTransport, UploadOptions, UploadQueue,
    UploadResponse, UploadStatus,
};

mod config;
mod run;

use config::{load_settings, parse_extra_field, validate_endpoint, Settings};

#[derive(Parser, Debug)]
#[command(about = "Upload files to an HTTP endpoint through a bounded-concurrency queue")]
struct Args {
    /// TOML settings file (defaults to ./uploader.toml when present).
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    endpoint: Option<String>,
    #[arg(long)]
    field_name: Option<String>,
    #[arg(long)]
    token: Option<String>,
    #[arg(long)]
    max_concurrent: Option<usize>,
    /// How many times failed uploads are retried after the queue drains.
    #[arg(long)]
    retries: Option<u32>,
    #[arg(long)]
    timeout_secs: Option<u64>,
    /// Extra form field sent with every file, as key=value.
    #[arg(long = "field", value_parser = parse_extra_field)]
    fields: Vec<(String, String)>,
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

impl Args {
    fn apply(&self, settings: &mut Settings) {
        if let Some(v) = &self.endpoint {
            settings.endpoint = Some(v.clone());
        }
        if let Some(v) = &self.field_name {
            settings.field_name = v.clone();
        }
        if let Some(v) = &self.token {
            settings.token = Some(v.clone());
        }
        if let Some(v) = self.max_concurrent {
            settings.max_concurrent = v;
        }
        if let Some(v) = self.retries {
            settings.retries = v;
        }
        if let Some(v) = self.timeout_secs {
            settings.timeout_secs = Some(v);
        }
        settings.extra.extend(self.fields.iter().cloned());
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = load_settings(args.config.as_deref())?;
    args.apply(&mut settings);
    let endpoint = validate_endpoint(settings.endpoint.as_deref())?;

    let transport = HttpUploadTransport::from_config(&HttpTransportConfig {
        timeout: settings.timeout_secs.map(Duration::from_secs),
        user_agent: Some(format!("uploader/{}", env!("CARGO_PKG_VERSION"))),
    })
    .context("failed to build HTTP client")?;

    let queue = UploadQueue::builder(Arc::new(transport))
        .max_concurrent(settings.max_concurrent)
        .on_progress(|item| {
            debug!(file = %item.file.file_name, progress = item.progress, "upload progress");
        })
        .on_complete(|item| info!(file = %item.file.file_name, "uploaded"))
        .on_error(|item| {
            if let Some(error) = &item.error {
                warn!(file = %item.file.file_name, %error, "upload failed");
            }
        })
        .on_queue_update(|stats| debug!(?stats, "queue updated"))
        .build()?;

    let mut options = UploadOptions::new(endpoint.as_str()).with_field_name(&settings.field_name);
    options.token = settings.token.clone().filter(|token| !token.is_empty());
    options.extra = settings.extra.clone();

    info!(
        %endpoint,
        files = args.files.len(),
        max_concurrent = settings.max_concurrent,
        "starting uploads"
    );
    queue.add_files(args.files.iter().cloned().map(FilePayload::from_path), options);

    tokio::select! {
        _ = run::drain(&queue, settings.retries) => {}
        _ = tokio::signal::ctrl_c() => {
            run::interrupt(&queue);
            bail!("interrupted");
        }
    }

    print_summary(&queue);

    let failed = queue.stats().failed;
    if failed > 0 {
        bail!("{failed} upload(s) failed");
    }
    Ok(())
}

fn print_summary(queue: &UploadQueue) {
    for item in queue.items() {
        let detail = match (item.status, &item.result, &item.error) {
            (UploadStatus::Completed, Some(UploadResponse::Json(body)), _) => body.to_string(),
            (UploadStatus::Completed, Some(UploadResponse::Text(body)), _) => body.clone(),
            (_, _, Some(error)) => error.to_string(),
            _ => String::new(),
        };
        println!("{}\t{}\t{}", item.status, item.file.file_name, detail);
    }

    let stats = queue.stats();
    println!(
        "total: {} | completed: {} | failed: {} | cancelled: {}",
        stats.total, stats.completed, stats.failed, stats.cancelled
    );
}

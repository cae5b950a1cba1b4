use anyhow::Result;
use async_trait::async_trait;
use background_uploader::file_config::FileConfig;
use background_uploader::{
    ManagerConfig, Notifier, UploadManager, UploadProgress, UploadRequest, UploadResult,
};
use clap::{Parser, Subcommand};
use env_logger::Env;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "bgupload")]
#[command(about = "Upload files as multipart/form-data with progress and retry", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload one or more files
    Upload {
        /// Files to upload (can specify multiple files)
        files: Vec<PathBuf>,

        /// Endpoint receiving the multipart request
        #[arg(short, long, env = "BGUPLOAD_URL")]
        url: Option<String>,

        /// HTTP method (default: POST)
        #[arg(short = 'X', long)]
        method: Option<String>,

        /// Extra request header, as NAME=VALUE (repeatable)
        #[arg(short = 'H', long = "header", value_parser = parse_key_value)]
        headers: Vec<(String, String)>,

        /// Extra form field, as NAME=VALUE (repeatable)
        #[arg(short = 'F', long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,

        /// Form field name of the file part (default: file)
        #[arg(long)]
        file_field: Option<String>,

        /// Number of parallel uploads (1-32, default: 4)
        #[arg(long, default_value = "4")]
        parallel: usize,

        /// Retries after a transient network failure (overrides config file)
        #[arg(long)]
        retries: Option<u32>,

        /// Path to a JSON config file
        #[arg(short, long, env = "BGUPLOAD_CONFIG")]
        config: Option<PathBuf>,

        /// Log events instead of drawing progress bars
        #[arg(short, long)]
        quiet: bool,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got '{raw}'")),
    }
}

/// Generate an upload id that stays unique when the same file name appears twice
fn upload_id_for(index: usize, file_path: &Path) -> String {
    let filename = file_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload");
    format!("{}-{filename}", index + 1)
}

/// Draws one progress bar per upload
struct ProgressBars {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl ProgressBars {
    fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn bar_for(&self, upload_id: &str, total_bytes: u64) -> ProgressBar {
        let mut bars = self
            .bars
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        bars.entry(upload_id.to_string())
            .or_insert_with(|| {
                let pb = self.multi.add(ProgressBar::new(total_bytes));
                #[allow(clippy::expect_used)]
                pb.set_style(
                    ProgressStyle::default_bar()
                        .template(
                            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}"
                        )
                        .expect("Failed to set progress bar template")
                        .progress_chars("#>-"),
                );
                pb.set_message(upload_id.to_string());
                pb
            })
            .clone()
    }
}

#[async_trait]
impl Notifier for ProgressBars {
    async fn on_progress(&self, progress: &UploadProgress) {
        let pb = self.bar_for(&progress.upload_id, progress.total_bytes);
        pb.set_length(progress.total_bytes);
        pb.set_position(progress.bytes_uploaded);
    }

    async fn on_result(&self, result: &UploadResult) {
        let pb = self.bar_for(&result.upload_id, 0);
        match &result.error {
            None if result.is_success() => {
                pb.finish_with_message(format!("{} uploaded", result.upload_id));
            }
            None => pb.abandon_with_message(format!("{} {}", result.upload_id, result.status)),
            Some(error) => pb.abandon_with_message(format!("{} failed: {error}", result.upload_id)),
        }
    }
}

#[allow(clippy::too_many_lines)]
#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.to_string().contains("not found") {
            debug!("Error loading .env file: {e}");
        }
    } else {
        debug!("Loaded environment from .env file");
    }

    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let Commands::Upload {
        files,
        url,
        method,
        headers,
        fields,
        file_field,
        parallel,
        retries,
        config,
        quiet,
    } = cli.command;

    if files.is_empty() {
        return Err(anyhow::anyhow!("No files specified for upload"));
    }

    // Validate parallel value
    if !(1..=32).contains(&parallel) {
        return Err(anyhow::anyhow!(
            "Parallel value must be between 1 and 32, got {parallel}"
        ));
    }

    // An explicit config file overrides the project and user files it is layered on
    let fallback_config = FileConfig::load_with_fallback(None)?;
    let file_config = match &config {
        Some(path) => FileConfig::load_from_path(path)?.merge_with(&fallback_config),
        None => fallback_config,
    };
    let Some(url) = url.or_else(|| file_config.url.clone()) else {
        return Err(anyhow::anyhow!(
            "No upload URL given. Pass --url, set BGUPLOAD_URL or add \"url\" to the config file"
        ));
    };

    let mut manager_config = file_config
        .apply_to(ManagerConfig::default())
        .with_max_concurrent_uploads(parallel);
    if let Some(retries) = retries {
        manager_config.retry.max_retries = retries;
    }

    info!("Using upload URL: {url}");
    info!("Parallel uploads: {parallel}");
    let manager = UploadManager::new(manager_config)?;

    let (result_tx, mut result_rx) = mpsc::unbounded_channel();
    manager.subscribe_result(move |result| {
        let _ = result_tx.send(result.clone());
    });
    if quiet {
        manager.subscribe(Arc::new(background_uploader::LogNotifier));
    } else {
        manager.subscribe(Arc::new(ProgressBars::new()));
    }

    let mut submitted = 0usize;
    let mut errors = Vec::new();
    for (index, file_path) in files.iter().enumerate() {
        let mut request = UploadRequest::new(upload_id_for(index, file_path), file_path, &url)
            .with_show_notification(false);
        if let Some(method) = method.clone().or_else(|| file_config.method.clone()) {
            request = request.with_method(method);
        }
        if let Some(name) = file_field
            .clone()
            .or_else(|| file_config.file_field_name.clone())
        {
            request = request.with_file_field_name(name);
        }
        // Command-line headers override those from the config file
        let cli_headers = headers.iter().map(|(name, value)| (name, value));
        for (name, value) in file_config.headers.iter().chain(cli_headers) {
            request = request.with_header(name.clone(), value.clone());
        }
        for (name, value) in &fields {
            request = request.with_field(name.clone(), value.clone());
        }

        match manager.submit(request) {
            Ok(upload_id) => {
                debug!("Submitted {} as {upload_id}", file_path.display());
                submitted += 1;
            }
            Err(e) => errors.push(format!("{}: {e}", file_path.display())),
        }
    }

    // Collect results, cancelling everything on Ctrl-C
    let mut completed = Vec::new();
    let mut interrupted = false;
    while completed.len() + errors.len() < files.len() && submitted > 0 {
        tokio::select! {
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                if let Err(e) = signal {
                    warn!("Failed to listen for Ctrl-C: {e}");
                }
                interrupted = true;
                warn!("Interrupted, cancelling {} upload(s)", manager.cancel_all());
            }
            result = result_rx.recv() => {
                let Some(result) = result else { break };
                if result.is_success() {
                    completed.push(result);
                } else {
                    errors.push(format!(
                        "{}: {}",
                        result.upload_id,
                        result.error.clone().unwrap_or_else(|| result.status.to_string())
                    ));
                }
            }
        }
    }

    // Report results
    if !completed.is_empty() {
        println!("\n✅ Successfully uploaded {} file(s):", completed.len());
        for result in &completed {
            println!(
                "  {} → HTTP {}",
                result.upload_id,
                result.status_code.unwrap_or_default()
            );
        }
    }

    if !errors.is_empty() {
        eprintln!("\n❌ Failed to upload {} file(s):", errors.len());
        for error in &errors {
            eprintln!("  {error}");
        }
        error!("{} file(s) failed to upload", errors.len());
        std::process::exit(1);
    }

    Ok(())
}

//! Observer side of the upload manager.
//!
//! Events are produced by the manager's tasks and delivered in order by a
//! single dispatcher, so an observer never runs on an upload's own task.

use crate::model::{UploadProgress, UploadResult};
use async_trait::async_trait;
use futures::FutureExt;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

const DEFAULT_PROGRESS_TITLE: &str = "Uploading file";
const DEFAULT_COMPLETE_TITLE: &str = "Upload complete";
const DEFAULT_FAILED_TITLE: &str = "Upload failed";

/// Something the host may want to show the user, emitted only for requests
/// with `show_notification` set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum DisplayIntent {
    #[serde(rename_all = "camelCase")]
    Progress {
        upload_id: String,
        title: String,
        description: String,
        percent: u8,
    },
    #[serde(rename_all = "camelCase")]
    Finished {
        upload_id: String,
        title: String,
        description: String,
        success: bool,
    },
    #[serde(rename_all = "camelCase")]
    Dismiss { upload_id: String },
}

impl DisplayIntent {
    #[must_use]
    pub fn upload_id(&self) -> &str {
        match self {
            DisplayIntent::Progress { upload_id, .. }
            | DisplayIntent::Finished { upload_id, .. }
            | DisplayIntent::Dismiss { upload_id } => upload_id,
        }
    }
}

/// Caller-supplied display strings for one task.
#[derive(Debug, Clone)]
pub(crate) struct DisplayText {
    pub title: Option<String>,
    pub description: Option<String>,
    pub file_name: String,
}

impl DisplayText {
    pub(crate) fn progress(&self, upload_id: &str, percent: u8) -> DisplayIntent {
        DisplayIntent::Progress {
            upload_id: upload_id.to_string(),
            title: self
                .title
                .clone()
                .unwrap_or_else(|| DEFAULT_PROGRESS_TITLE.to_string()),
            description: self
                .description
                .clone()
                .unwrap_or_else(|| self.file_name.clone()),
            percent,
        }
    }

    pub(crate) fn finished(&self, result: &UploadResult) -> DisplayIntent {
        let success = result.is_success();
        let title = self.title.clone().unwrap_or_else(|| {
            if success {
                DEFAULT_COMPLETE_TITLE.to_string()
            } else {
                DEFAULT_FAILED_TITLE.to_string()
            }
        });
        let description = match (&result.error, &self.description) {
            (Some(error), _) => error.clone(),
            (None, Some(description)) => description.clone(),
            (None, None) => self.file_name.clone(),
        };
        DisplayIntent::Finished {
            upload_id: result.upload_id.clone(),
            title,
            description,
            success,
        }
    }
}

/// Sink for upload events. Every method defaults to a no-op so hosts only
/// implement what they render.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn on_progress(&self, _progress: &UploadProgress) {}

    async fn on_result(&self, _result: &UploadResult) {}

    async fn on_display(&self, _intent: &DisplayIntent) {}
}

/// Writes every event to the `log` facade.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn on_progress(&self, progress: &UploadProgress) {
        info!(
            "Upload {} {}: {}/{} bytes ({}%)",
            progress.upload_id,
            progress.status,
            progress.bytes_uploaded,
            progress.total_bytes,
            progress.percent()
        );
    }

    async fn on_result(&self, result: &UploadResult) {
        match &result.error {
            Some(error) => warn!("Upload {} {}: {error}", result.upload_id, result.status),
            None => info!("Upload {} {}", result.upload_id, result.status),
        }
    }
}

struct ProgressCallback<F>(F);

#[async_trait]
impl<F> Notifier for ProgressCallback<F>
where
    F: Fn(&UploadProgress) + Send + Sync,
{
    async fn on_progress(&self, progress: &UploadProgress) {
        (self.0)(progress);
    }
}

struct ResultCallback<F>(F);

#[async_trait]
impl<F> Notifier for ResultCallback<F>
where
    F: Fn(&UploadResult) + Send + Sync,
{
    async fn on_result(&self, result: &UploadResult) {
        (self.0)(result);
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Event {
    Progress(UploadProgress),
    Result {
        result: UploadResult,
        generation: u64,
    },
    Display(DisplayIntent),
}

#[derive(Default)]
pub(crate) struct Observers {
    notifiers: RwLock<Vec<Arc<dyn Notifier>>>,
}

impl Observers {
    pub(crate) fn add(&self, notifier: Arc<dyn Notifier>) {
        self.notifiers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(notifier);
    }

    pub(crate) fn add_progress_callback<F>(&self, callback: F)
    where
        F: Fn(&UploadProgress) + Send + Sync + 'static,
    {
        self.add(Arc::new(ProgressCallback(callback)));
    }

    pub(crate) fn add_result_callback<F>(&self, callback: F)
    where
        F: Fn(&UploadResult) + Send + Sync + 'static,
    {
        self.add(Arc::new(ResultCallback(callback)));
    }

    fn snapshot(&self) -> Vec<Arc<dyn Notifier>> {
        self.notifiers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Delivers one event to every observer. A panicking observer is logged
    /// and skipped.
    pub(crate) async fn deliver(&self, event: &Event) {
        for notifier in self.snapshot() {
            let delivery = match event {
                Event::Progress(progress) => notifier.on_progress(progress),
                Event::Result { result, .. } => notifier.on_result(result),
                Event::Display(intent) => notifier.on_display(intent),
            };
            if AssertUnwindSafe(delivery).catch_unwind().await.is_err() {
                warn!("Upload observer panicked while handling {event:?}");
            }
        }
    }
}

//! Public entry point for submitting, cancelling and observing uploads.

use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::model::{UploadProgress, UploadResult};
use crate::notifier::{DisplayText, Event, Notifier, Observers};
use crate::registry::Registry;
use crate::request::UploadRequest;
use crate::upload::{Executor, UploadOutcome};
use futures::FutureExt;
use log::{debug, error, info, warn};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tokio_util::sync::CancellationToken;

/// Handle to a background upload manager.
///
/// Cloning is cheap and every clone drives the same set of uploads. The
/// manager must be created inside a tokio runtime; uploads and event delivery
/// run on that runtime.
#[derive(Clone)]
pub struct UploadManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ManagerConfig,
    executor: Executor,
    registry: Arc<Registry>,
    observers: Arc<Observers>,
    limiter: Option<Arc<Semaphore>>,
    runtime: Handle,
}

impl UploadManager {
    /// Creates a manager and starts its event dispatcher.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the HTTP client
    /// cannot be built, or no tokio runtime is running.
    pub fn new(config: ManagerConfig) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| {
            Error::ConfigError(format!("Upload manager requires a tokio runtime: {e}"))
        })?;

        let executor = Executor::new(&config)?;
        let (events, receiver) = unbounded_channel();
        let registry = Arc::new(Registry::new(events));
        let observers = Arc::new(Observers::default());
        let limiter = config
            .max_concurrent_uploads
            .map(|limit| Arc::new(Semaphore::new(limit)));

        runtime.spawn(dispatch_events(
            receiver,
            observers.clone(),
            Arc::downgrade(&registry),
        ));

        debug!(
            "Upload manager started (retries: {}, concurrency limit: {:?})",
            config.retry.max_retries, config.max_concurrent_uploads
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                executor,
                registry,
                observers,
                limiter,
                runtime,
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Validates `request`, registers it as `Queued` and starts it in the
    /// background. Returns as soon as the task is registered.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for missing or malformed fields, or when the id is
    ///   already in use by an active upload
    /// - `InvalidHeader` when a reserved or malformed header is supplied
    /// - `FileNotFound` when the file does not exist
    pub fn submit(&self, request: UploadRequest) -> Result<String> {
        request.validate()?;

        let total_bytes = match std::fs::metadata(&request.file_path) {
            Ok(metadata) if metadata.is_file() => metadata.len(),
            Ok(_) => {
                return Err(Error::FileNotFound(format!(
                    "{} is not a regular file",
                    request.file_path.display()
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::FileNotFound(request.file_path.display().to_string()));
            }
            Err(e) => {
                return Err(Error::FileNotFound(format!(
                    "{} ({e})",
                    request.file_path.display()
                )));
            }
        };

        let display = if request.show_notification {
            Some(DisplayText {
                title: request.notification_title.clone(),
                description: request.notification_description.clone(),
                file_name: request.file_name()?.to_string(),
            })
        } else {
            None
        };

        let upload_id = request.upload_id.clone();
        let cancel = self
            .inner
            .registry
            .insert(&upload_id, total_bytes, display)?;

        info!(
            "Queued upload {upload_id}: {} ({total_bytes} bytes) -> {} {}",
            request.file_path.display(),
            request.method,
            request.url
        );

        let inner = self.inner.clone();
        self.inner
            .runtime
            .spawn(async move { inner.run(request, cancel).await });

        Ok(upload_id)
    }

    /// Cancels an active upload. Returns `false` if the id is unknown or the
    /// upload already finished.
    #[must_use]
    pub fn cancel(&self, upload_id: &str) -> bool {
        let cancelled = self.inner.registry.cancel(upload_id);
        if cancelled {
            info!("Cancelled upload {upload_id}");
        } else {
            debug!("Cancel ignored for unknown or finished upload {upload_id}");
        }
        cancelled
    }

    /// Cancels every active upload and returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let count = self.inner.registry.cancel_all();
        if count > 0 {
            info!("Cancelled {count} active upload(s)");
        }
        count
    }

    #[must_use]
    pub fn get_status(&self, upload_id: &str) -> Option<UploadProgress> {
        self.inner.registry.get(upload_id)
    }

    #[must_use]
    pub fn active_uploads(&self) -> Vec<UploadProgress> {
        self.inner.registry.active()
    }

    pub fn subscribe(&self, notifier: Arc<dyn Notifier>) {
        self.inner.observers.add(notifier);
    }

    pub fn subscribe_progress<F>(&self, callback: F)
    where
        F: Fn(&UploadProgress) + Send + Sync + 'static,
    {
        self.inner.observers.add_progress_callback(callback);
    }

    pub fn subscribe_result<F>(&self, callback: F)
    where
        F: Fn(&UploadResult) + Send + Sync + 'static,
    {
        self.inner.observers.add_result_callback(callback);
    }
}

impl Inner {
    async fn run(self: Arc<Self>, request: UploadRequest, cancel: CancellationToken) {
        let upload_id = request.upload_id.clone();

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!("Upload {upload_id} stopped after cancellation");
                return;
            }
            outcome = AssertUnwindSafe(self.execute_with_retry(&request)).catch_unwind() => outcome,
        };

        let result = match outcome {
            Ok(Ok(outcome)) => {
                info!(
                    "Upload {upload_id} completed with status {}",
                    outcome.status_code
                );
                UploadResult::completed(&upload_id, outcome.status_code, outcome.response)
            }
            Ok(Err(e)) => {
                warn!("Upload {upload_id} failed: {e}");
                UploadResult::failed(&upload_id, &e)
            }
            Err(panic) => {
                let e = Error::InternalError(panic_message(panic.as_ref()));
                error!("Upload {upload_id} aborted: {e}");
                UploadResult::failed(&upload_id, &e)
            }
        };

        if !self.registry.finish(result) {
            debug!("Upload {upload_id} already reached a terminal state");
        }
    }

    async fn execute_with_retry(&self, request: &UploadRequest) -> Result<UploadOutcome> {
        let _permit = match &self.limiter {
            Some(limiter) => Some(
                limiter
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::InternalError(format!("Upload limiter closed: {e}")))?,
            ),
            None => None,
        };

        let upload_id = request.upload_id.as_str();
        let policy = &self.config.retry;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let total_bytes = Executor::probe_file(&request.file_path).await?;
            let Some(generation) = self.registry.begin(upload_id, total_bytes) else {
                return Err(Error::Cancelled);
            };

            debug!("Upload {upload_id} attempt {attempt} ({total_bytes} bytes)");
            let registry = self.registry.clone();
            let id = upload_id.to_string();
            let result = self
                .executor
                .execute(request, total_bytes, move |sent| {
                    registry.update_progress(&id, generation, sent);
                })
                .await;

            match result {
                Err(Error::RetryableError(cause)) if attempt <= policy.max_retries => {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        "Upload {upload_id} attempt {attempt} failed: {cause}. Retrying in {}ms",
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(Error::RetryableError(cause)) => {
                    return Err(Error::RetryableError(format!(
                        "upload failed after {attempt} attempts: {cause}"
                    )));
                }
                other => return other,
            }
        }
    }
}

/// Delivers events to observers in the order they were produced and drops
/// finished tasks from the registry once their result is out.
async fn dispatch_events(
    mut receiver: UnboundedReceiver<Event>,
    observers: Arc<Observers>,
    registry: Weak<Registry>,
) {
    while let Some(event) = receiver.recv().await {
        observers.deliver(&event).await;

        if let Event::Result { result, generation } = &event {
            if let Some(registry) = registry.upgrade() {
                registry.remove(&result.upload_id, *generation);
            }
        }
    }
    debug!("Upload event dispatcher stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "upload task panicked".to_string()
    }
}

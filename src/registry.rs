//! Shared table of in-flight uploads.
//!
//! Every state change and the event announcing it happen inside one critical
//! section, so the order events reach observers matches the order in which
//! the changes were applied. The lock is never held across an `.await`.

use crate::error::{Error, Result};
use crate::model::{UploadProgress, UploadResult, UploadStatus};
use crate::notifier::{DisplayIntent, DisplayText, Event};
use log::debug;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

struct TaskEntry {
    generation: u64,
    status: UploadStatus,
    bytes_uploaded: u64,
    total_bytes: u64,
    cancel: CancellationToken,
    display: Option<DisplayText>,
    last_percent: Option<u8>,
}

impl TaskEntry {
    fn snapshot(&self, upload_id: &str) -> UploadProgress {
        UploadProgress {
            upload_id: upload_id.to_string(),
            bytes_uploaded: self.bytes_uploaded,
            total_bytes: self.total_bytes,
            status: self.status,
        }
    }
}

#[derive(Default)]
struct Tasks {
    entries: HashMap<String, TaskEntry>,
    next_generation: u64,
}

pub(crate) struct Registry {
    tasks: Mutex<Tasks>,
    events: UnboundedSender<Event>,
}

impl Registry {
    pub(crate) fn new(events: UnboundedSender<Event>) -> Self {
        Self {
            tasks: Mutex::new(Tasks::default()),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: Event) {
        if self.events.send(event).is_err() {
            debug!("Event dispatcher has shut down, dropping event");
        }
    }

    /// Registers a new `Queued` task. A terminal entry still waiting for its
    /// result to be delivered is replaced.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if a non-terminal task already uses the id.
    pub(crate) fn insert(
        &self,
        upload_id: &str,
        total_bytes: u64,
        display: Option<DisplayText>,
    ) -> Result<CancellationToken> {
        let mut tasks = self.lock();
        if let Some(existing) = tasks.entries.get(upload_id) {
            if !existing.status.is_terminal() {
                return Err(Error::InvalidArgument(format!(
                    "Upload '{upload_id}' is already {}",
                    existing.status
                )));
            }
        }

        tasks.next_generation += 1;
        let cancel = CancellationToken::new();
        let entry = TaskEntry {
            generation: tasks.next_generation,
            status: UploadStatus::Queued,
            bytes_uploaded: 0,
            total_bytes,
            cancel: cancel.clone(),
            display,
            last_percent: None,
        };
        tasks.entries.insert(upload_id.to_string(), entry);
        Ok(cancel)
    }

    pub(crate) fn get(&self, upload_id: &str) -> Option<UploadProgress> {
        self.lock()
            .entries
            .get(upload_id)
            .map(|entry| entry.snapshot(upload_id))
    }

    pub(crate) fn active(&self) -> Vec<UploadProgress> {
        let tasks = self.lock();
        let mut active: Vec<UploadProgress> = tasks
            .entries
            .iter()
            .filter(|(_, entry)| !entry.status.is_terminal())
            .map(|(id, entry)| entry.snapshot(id))
            .collect();
        active.sort_by(|a, b| a.upload_id.cmp(&b.upload_id));
        active
    }

    /// Moves a `Queued` task to `Uploading` and announces it. Repeated calls
    /// for an already uploading task (a retry) are accepted silently.
    /// Returns the task's generation, or `None` once the task has reached a
    /// terminal state.
    pub(crate) fn begin(&self, upload_id: &str, total_bytes: u64) -> Option<u64> {
        let mut tasks = self.lock();
        let entry = tasks.entries.get_mut(upload_id)?;
        match entry.status {
            UploadStatus::Queued => {
                entry.status = UploadStatus::Uploading;
                entry.total_bytes = total_bytes;
                let snapshot = entry.snapshot(upload_id);
                let intent = Self::display_progress(entry, upload_id);
                self.emit(Event::Progress(snapshot));
                if let Some(intent) = intent {
                    self.emit(Event::Display(intent));
                }
                Some(entry.generation)
            }
            UploadStatus::Uploading => Some(entry.generation),
            _ => None,
        }
    }

    /// Records cumulative progress for the submission identified by
    /// `generation`. Values at or below the current high-water mark (a retry
    /// restarting from zero) are not reported again, and neither are late
    /// chunks from an earlier submission under the same id.
    pub(crate) fn update_progress(
        &self,
        upload_id: &str,
        generation: u64,
        bytes_uploaded: u64,
    ) -> bool {
        let mut tasks = self.lock();
        let Some(entry) = tasks.entries.get_mut(upload_id) else {
            return false;
        };
        if entry.generation != generation
            || entry.status != UploadStatus::Uploading
            || bytes_uploaded <= entry.bytes_uploaded
        {
            return false;
        }

        entry.bytes_uploaded = bytes_uploaded.min(entry.total_bytes);
        let snapshot = entry.snapshot(upload_id);
        let intent = Self::display_progress(entry, upload_id);
        self.emit(Event::Progress(snapshot));
        if let Some(intent) = intent {
            self.emit(Event::Display(intent));
        }
        true
    }

    fn display_progress(entry: &mut TaskEntry, upload_id: &str) -> Option<DisplayIntent> {
        let display = entry.display.as_ref()?;
        let percent = entry.snapshot(upload_id).percent();
        if entry.last_percent == Some(percent) {
            return None;
        }
        let intent = display.progress(upload_id, percent);
        entry.last_percent = Some(percent);
        Some(intent)
    }

    /// Applies a terminal result if the task has not already reached one.
    /// The first terminal transition wins; the loser gets `false`.
    pub(crate) fn finish(&self, result: UploadResult) -> bool {
        let mut tasks = self.lock();
        let Some(entry) = tasks.entries.get_mut(&result.upload_id) else {
            return false;
        };
        if entry.status.is_terminal() {
            return false;
        }

        entry.status = result.status;
        let generation = entry.generation;
        let intent = entry.display.as_ref().map(|display| display.finished(&result));
        if let Some(intent) = intent {
            self.emit(Event::Display(intent));
        }
        self.emit(Event::Result { result, generation });
        true
    }

    /// Marks an active task `Cancelled` and fires its cancellation token.
    pub(crate) fn cancel(&self, upload_id: &str) -> bool {
        let mut tasks = self.lock();
        let Some(entry) = tasks.entries.get_mut(upload_id) else {
            return false;
        };
        if entry.status.is_terminal() {
            return false;
        }

        entry.status = UploadStatus::Cancelled;
        entry.cancel.cancel();
        let generation = entry.generation;
        if entry.display.is_some() {
            self.emit(Event::Display(DisplayIntent::Dismiss {
                upload_id: upload_id.to_string(),
            }));
        }
        self.emit(Event::Result {
            result: UploadResult::cancelled(upload_id),
            generation,
        });
        true
    }

    pub(crate) fn cancel_all(&self) -> usize {
        let ids: Vec<String> = self
            .lock()
            .entries
            .iter()
            .filter(|(_, entry)| !entry.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    /// Drops a terminal entry once its result has been delivered. An entry
    /// from a newer submission under the same id is left alone.
    pub(crate) fn remove(&self, upload_id: &str, generation: u64) -> bool {
        let mut tasks = self.lock();
        let matches = tasks
            .entries
            .get(upload_id)
            .is_some_and(|entry| entry.generation == generation && entry.status.is_terminal());
        if matches {
            tasks.entries.remove(upload_id);
        }
        matches
    }
}

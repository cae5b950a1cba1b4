//! Background upload manager: multipart HTTP uploads with progress tracking,
//! cancellation and bounded retry, reported to observers as events.

pub mod config;
pub mod error;
pub mod file_config;
pub mod model;
pub mod notifier;
pub mod request;

pub mod manager;
mod registry;
pub mod upload;

pub use config::{ManagerConfig, RetryPolicy};
pub use error::{Error, Result};

// Re-export commonly used types
pub use manager::UploadManager;
pub use model::{UploadProgress, UploadResult, UploadStatus};
pub use notifier::{DisplayIntent, LogNotifier, Notifier};
pub use request::UploadRequest;

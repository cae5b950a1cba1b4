pub mod executor;
pub mod progress;

pub use executor::{Executor, UploadOutcome};
pub use progress::ProgressStream;

//! Infrastructure layer: job storage, execution, uploads, the transcriber
//! process.

pub mod jobs;
pub mod transcriber;
pub mod uploads;

pub use transcriber::{CommandTranscriber, ExecutionError, Transcriber};
pub use uploads::{UploadError, UploadStore};

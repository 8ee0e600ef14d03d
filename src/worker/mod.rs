//! Worker processes and the line-delimited JSON protocol they speak.

pub mod channel;
pub mod handle;
pub mod launcher;
pub mod protocol;
pub mod stub;

pub use handle::{InvokeError, WorkerHandle};
pub use launcher::{ProcessLauncher, WorkerLauncher};

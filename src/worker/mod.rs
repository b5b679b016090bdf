//! Background tasks that run beside the request path.
//!
//! - [`archival`]: moves warm entries nearing expiry into the archive and
//!   serves deep-miss hydration

pub mod archival;

pub use archival::{ArchivalWorker, ArchiveReport, WorkerHandle};

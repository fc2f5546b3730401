//! Change-triggered sync pipeline.
//!
//! A [`FileWatcher`] feeds change notifications to the [`Orchestrator`],
//! which reads two tables through a [`TableSource`] and replaces them at a
//! [`TableSink`], one notification at a time.

pub mod error;
pub mod orchestrator;
pub mod state;
pub mod traits;

pub use error::{BoxError, SyncError};
pub use orchestrator::{Orchestrator, SyncOutcome, SyncSettings};
pub use state::OrchestratorState;
pub use traits::{ChangeStream, FileWatcher, Lifecycle, TableSink, TableSource};

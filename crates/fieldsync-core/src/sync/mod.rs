//! Synchronization with the remote store.

mod http;
mod memory;
mod orchestrator;
mod remote;
mod retry;
pub mod wire;
mod worker;

pub use http::{HttpRemoteStore, DEFAULT_POLL_INTERVAL};
pub use memory::{InMemoryRemoteStore, RemoteLoi, RemoteSubmission};
pub use orchestrator::{SyncOrchestrator, SyncReport};
pub use remote::{
    BatchOutcome, MutationFailure, RemoteError, RemoteErrorKind, RemoteResult, RemoteStore,
    SurveyUpdate,
};
pub use retry::RetryPolicy;
pub use worker::SyncWorker;

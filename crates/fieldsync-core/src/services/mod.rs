//! Services shared by the sync engine and its front ends.

mod database;
mod queue;

pub use database::DatabaseService;
pub use queue::{Lane, MutationQueue, EVENT_CAPACITY};

pub mod common;
pub mod completions;
pub mod maintenance;
pub mod queue;
pub mod survey;
pub mod sync;

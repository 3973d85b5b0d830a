//! Core business logic modules
//!
//! Pure state machines with no I/O: callers pass the current instant in and
//! turn the returned instructions into messages.

pub mod pool;
pub mod queue;
pub mod update;

pub use pool::{Cancel, Dispatch, RequestRecord, Worker, WorkerPool, WorkerState};
pub use queue::RequestQueue;
pub use update::UpdateJob;

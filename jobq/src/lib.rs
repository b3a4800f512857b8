//! Bounded-buffer job queue shared by producer and consumer threads,
//! coordinated through `space`, `item` and `mutex` counting semaphores.

pub mod consumer;
pub mod coordinator;
pub mod core;
mod errors;
pub mod logger;
pub mod producer;
pub mod queue;
pub mod semaphore;


pub use coordinator::{Coordinator, RunSummary};
pub use crate::core::{Role, RunConfig, RunParams, WorkerExit, WorkerFailure, WorkerReport, WorkerResult};
pub use errors::*;

//! Concurrent tile loading.
//!
//! ```text
//!  TileLoader::request ──▶ JobDispatcher queue ──▶ worker thread
//!                                                   │
//!                                                   ▼
//!                                             TileLoadJob
//!                                   claim ─▶ placeholder ─▶ store ─▶ engine
//!                                                   │
//!                                                   ▼
//!                                  tile state + TileLoadListener (once per job)
//! ```
//!
//! # Components
//!
//! - [`JobDispatcher`]: elastic pool of OS threads with an unbounded queue
//! - [`WorkerContext`]: per-worker interrupt flag with deferred delivery
//!   inside critical sections
//! - [`TileLoadJob`]: claims a tile and drives it to a terminal state
//! - [`TileLoader`]: caller-facing facade

mod job;
mod loader;
mod pool;
mod worker;

pub use job::{LoadOutcome, TileLoadJob, TileLoadListener};
pub use loader::TileLoader;
pub use pool::{
    DispatcherConfig, Job, JobDispatcher, DEFAULT_CORE_WORKERS, DEFAULT_KEEP_ALIVE,
    DEFAULT_MAX_WORKERS,
};
pub use worker::{CriticalSection, WorkerContext};

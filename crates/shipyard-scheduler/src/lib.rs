//! Job execution for Shipyard.
//!
//! Runs jobs on a pool of in-process workers. Each execution gets a scratch
//! directory, streams output to observers and fires completion callbacks
//! exactly once.

pub mod command;
pub mod engine;
pub mod execution;
pub mod output;
pub mod queue;
pub mod worker;

pub use command::CommandWorkUnit;
pub use engine::JobExecutor;
pub use execution::{ExecutionObserver, JobExecution, WorkFn, WorkUnit, work_fn};
pub use output::{OutputBuffer, OutputCursor};
pub use worker::Worker;

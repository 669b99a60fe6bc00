//! Background watchdogs running inside the server process.
//!
//! Each monitor is a single-threaded periodic task: the deferred email
//! handler closes the loop for scheduled sends, the auto-fail monitor
//! terminates stuck runs, and the worker health monitor reaps silent
//! workers. When several server processes run, each executes its own
//! copy; all writes are claim-gated or idempotent.

mod auto_fail;
mod deferred_email;
mod worker_health;

pub use auto_fail::AutoFailMonitor;
pub use deferred_email::DeferredEmailHandler;
pub use worker_health::WorkerHealthMonitor;

//! ingestd - coordination core for a fleet of media processing servers.
//!
//! Servers share one SQL catalog of artifacts. A [`lease::LeaseManager`]
//! gives each artifact at most one owner across the fleet using heartbeat
//! timestamps on the catalog rows, the [`scheduler::Scheduler`] finds work
//! and drives deletion and reprocessing, and each [`finalizer::Job`] runs a
//! [`processor::Processor`] and commits its outcome exactly once.

pub mod config;
pub mod context;
pub mod finalizer;
pub mod lease;
pub mod processor;
pub mod scheduler;
pub mod server_heartbeat;
pub mod shutdown;
pub mod storage;
pub mod worker;

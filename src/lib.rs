//! Record which worker touched which page during which thunk.
//!
//! This crate bundles the shared page log of [`pagelog_core`] with a small
//! workload driver that plays the role of a page-protection runtime: it
//! spawns workers as threads or as forked processes, moves them through
//! thunks, and appends one event per simulated first touch of a page.

use anyhow::Error;

pub use pagelog_core::{
    Access, AccessEvent, CAPACITY, OutOfRange, PageLog, ThreadContext, context,
};
pub use pagelog_error::{errno, errno_description};

mod tmgmt;

/// Simulated workloads appending to a [`PageLog`].
pub mod workload;

pub use workload::{WorkerMode, WorkloadConfig, WorkloadReport};

/// Runs a workload against the process-wide log and returns the log along
/// with the report.
///
/// It serves as a shortcut for:
/// `workload::run_workload(PageLog::initialize(), &config)`.
///
/// Refer to [`workload::run_workload`] for details.
pub fn record(config: &WorkloadConfig) -> Result<(PageLog, WorkloadReport), Error> {
    let log = PageLog::initialize();
    let report = workload::run_workload(log, config)?;

    Ok((log, report))
}

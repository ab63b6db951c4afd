use std::{fmt, thread};

use anyhow::{Error, bail};
use pagelog_core::{Access, AccessEvent, CAPACITY, PageLog, ThreadContext, context};

use crate::tmgmt::{WorkerHandle, WorkerManagement};

type SpawnResult = Result<WorkerHandle, Error>;

/// Size of the simulated pages.
pub const PAGE_SIZE: usize = 4096;

/// Start of the simulated shared address range every worker touches.
pub const PAGE_BASE: usize = 0x10_0000;

/// Whether workers run as threads of this process or as forked children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    Threads,
    Processes,
}

/// Shape of a simulated workload.
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    pub workers: u32,
    pub thunks: u32,
    pub pages_per_thunk: usize,
    pub mode: WorkerMode,
}

impl WorkloadConfig {
    /// Number of events a single thunk of one worker appends.
    ///
    /// Every page is read once, every even page is written as well.
    /// Returns `None` if the count does not fit into a `usize`.
    pub fn events_per_thunk(&self) -> Option<usize> {
        self.pages_per_thunk
            .checked_add(self.pages_per_thunk.div_ceil(2))
    }

    /// Number of events the whole workload appends, `None` on overflow.
    pub fn total_events(&self) -> Option<usize> {
        (self.workers as usize)
            .checked_mul(self.thunks as usize)?
            .checked_mul(self.events_per_thunk()?)
    }
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            thunks: 3,
            pages_per_thunk: 4,
            mode: WorkerMode::Threads,
        }
    }
}

/// Summary of the events a workload left in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadReport {
    pub appended: usize,
    pub reads: usize,
    pub writes: usize,
}

impl fmt::Display for WorkloadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} events appended ({} reads, {} writes)",
            self.appended, self.reads, self.writes
        )
    }
}

/// Simulates the first touch of `page`, the way a protection trap handler
/// would report it.
#[inline(never)]
fn touch_page(log: PageLog, page: usize, access: Access) {
    let issuer = touch_page as fn(PageLog, usize, Access) as usize;
    log.add(AccessEvent::new(page, access, issuer));
}

#[inline(never)]
fn run_worker(log: PageLog, config: &WorkloadConfig, thread_id: u32) -> Result<(), Error> {
    let thunk_start =
        run_worker as fn(PageLog, &WorkloadConfig, u32) -> Result<(), Error> as usize;
    context::enter(ThreadContext {
        thread_id,
        thunk_id: 0,
        thunk_start,
    })?;

    for thunk in 0..config.thunks {
        if thunk > 0 {
            context::begin_thunk(thunk_start)?;
        }

        for page in 0..config.pages_per_thunk {
            let page_start = PAGE_BASE + page * PAGE_SIZE;
            touch_page(log, page_start, Access::Read);
            if page % 2 == 0 {
                touch_page(log, page_start, Access::Write);
            }
        }
    }

    Ok(())
}

fn spawn_thread(log: PageLog, config: &WorkloadConfig, thread_id: u32) -> SpawnResult {
    let config = config.clone();
    let handle = thread::spawn(move || run_worker(log, &config, thread_id));
    Ok(WorkerHandle::Thread(handle))
}

fn spawn_process(log: PageLog, config: &WorkloadConfig, thread_id: u32) -> SpawnResult {
    match unsafe { libc::fork() } {
        -1 => bail!(
            "Could not fork worker {thread_id}: {}",
            std::io::Error::last_os_error()
        ),
        0 => {
            let code = match run_worker(log, config, thread_id) {
                Ok(()) => 0,
                Err(_) => 1,
            };
            unsafe { libc::_exit(code) }
        }
        pid => Ok(WorkerHandle::Process(pid)),
    }
}

/// Spawns `workers` workers through `spawn` and waits for all of them.
///
/// Spawning stops at the first failure, but every worker started up to
/// that point is still joined before the failure is reported.
fn spawn_and_join(
    workers: u32,
    mode: WorkerMode,
    mut spawn: impl FnMut(u32) -> SpawnResult,
) -> Result<(), Error> {
    let mut tmgmt = WorkerManagement::new();
    let mut spawned = Ok(());
    for thread_id in 0..workers {
        spawned = spawn(thread_id).and_then(|handle| {
            log::debug!("Spawned worker {thread_id} ({mode:?})");
            tmgmt.register_worker(thread_id, handle)
        });
        if spawned.is_err() {
            break;
        }
    }

    let joined = tmgmt.join_all();
    spawned.and(joined)
}

/// Runs a simulated workload that appends its page touches to `log`.
///
/// Worker ids start at zero. The report only covers events appended by
/// this call.
///
/// # Errors
///
/// This function fails if the workload would not fit into the remaining
/// capacity of `log`, if a worker could not be spawned or if any worker
/// failed. Workers that were already running are joined before a spawn
/// failure is returned.
pub fn run_workload(log: PageLog, config: &WorkloadConfig) -> Result<WorkloadReport, Error> {
    let first_slot = log.len();
    let remaining = CAPACITY.saturating_sub(first_slot);
    match config.total_events() {
        Some(needed) if needed <= remaining => {}
        Some(needed) => bail!(
            "Workload needs {needed} slots but only {remaining} of {CAPACITY} are left."
        ),
        None => bail!("Workload needs more slots than can be counted."),
    }

    spawn_and_join(config.workers, config.mode, |thread_id| match config.mode {
        WorkerMode::Threads => spawn_thread(log, config, thread_id),
        WorkerMode::Processes => spawn_process(log, config, thread_id),
    })?;

    let mut report = WorkloadReport {
        appended: 0,
        reads: 0,
        writes: 0,
    };
    for event in log.iter().skip(first_slot) {
        report.appended += 1;
        match event.access() {
            Access::Read => report.reads += 1,
            Access::Write => report.writes += 1,
        }
    }

    Ok(report)
}

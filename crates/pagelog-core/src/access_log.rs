use std::{
    error, fmt,
    os::fd::AsFd,
    sync::{OnceLock, atomic::Ordering},
};

use anyhow::{Error, anyhow};
use pagelog_error::errno;

use crate::{
    dump,
    event::AccessEvent,
    region::{CAPACITY, Region},
};

static PROCESS_LOG: OnceLock<PageLog> = OnceLock::new();

/// A handle onto a shared, fixed-capacity, append-only log of page accesses.
///
/// The handle is `Copy` and refers to a region that lives until the process
/// exits. Hand it to every site that records or inspects events; processes
/// forked after the region was mapped keep appending to the same log.
#[derive(Clone, Copy)]
pub struct PageLog {
    region: &'static Region,
}

impl PageLog {
    /// Sets up the process-wide log and returns a handle to it.
    ///
    /// The shared region is mapped on the first call only; any later call,
    /// from any thread, returns a handle onto that same region.
    ///
    /// # Panics
    ///
    /// The process is aborted if the region could not be mapped.
    pub fn initialize() -> PageLog {
        *PROCESS_LOG.get_or_init(|| match Region::map() {
            Ok(region) => {
                log::info!(
                    "Mapped shared page log at {:#x} ({} bytes, {} slots)",
                    region.base_address(),
                    Region::SIZE,
                    CAPACITY
                );
                PageLog { region }
            }
            Err(err) => {
                log::error!("Could not map shared page log: {err}");
                pagelog_error::fatal(errno::SHM_MAP_FAILED)
            }
        })
    }

    /// Returns the process-wide log, initializing it if nobody did yet.
    ///
    /// Refer to [`PageLog::initialize`] for details.
    #[inline]
    pub fn get_instance() -> PageLog {
        match PROCESS_LOG.get() {
            Some(log) => *log,
            None => Self::initialize(),
        }
    }

    /// Maps a new log that is independent of the process-wide one.
    ///
    /// # Errors
    ///
    /// This function fails if the operating system refuses the shared mapping.
    pub fn create() -> Result<PageLog, Error> {
        let region =
            Region::map().map_err(|err| anyhow!("Could not map shared page log: {err}"))?;
        log::debug!("Mapped private page log at {:#x}", region.base_address());

        Ok(PageLog { region })
    }

    /// Appends `entry` and returns the slot it was written to.
    ///
    /// Claiming the slot is a single atomic fetch-and-increment, so any
    /// number of threads or processes may append concurrently without
    /// blocking. Slots are ordered by claim, not by the time the accesses
    /// happened.
    ///
    /// # Panics
    ///
    /// Appending to a full log aborts the process.
    #[inline]
    pub fn add(&self, entry: AccessEvent) -> usize {
        let slot = self.region.next_free.fetch_add(1, Ordering::SeqCst);
        if slot >= CAPACITY {
            pagelog_error::fatal(errno::LOG_CAPACITY_EXCEEDED);
        }

        unsafe { self.region.write(slot, entry) };
        slot
    }

    /// Number of events appended so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.region.next_free.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn capacity(&self) -> usize {
        CAPACITY
    }

    /// Returns the event at position `index`.
    ///
    /// Meant for tests and introspection while no appender is active.
    ///
    /// # Errors
    ///
    /// Fails with [`OutOfRange`] if `index` lies beyond the capacity or
    /// beyond the events appended so far, which includes every index of an
    /// empty log.
    pub fn get(&self, index: usize) -> Result<AccessEvent, OutOfRange> {
        let len = self.len();
        if index >= CAPACITY || index >= len {
            return Err(OutOfRange { index, len });
        }

        Ok(self.region.read(index))
    }

    /// Iterates over all appended events in slot order.
    pub fn iter(&self) -> impl Iterator<Item = AccessEvent> + use<> {
        let region = self.region;
        (0..self.len().min(CAPACITY)).map(move |slot| region.read(slot))
    }

    /// Forgets all appended events. Slots are not wiped.
    ///
    /// **Attention:** Only meant for test harnesses. Calling this while
    /// other workers append hands out slots twice.
    pub fn reset(&self) {
        self.region.next_free.store(0, Ordering::SeqCst);
    }

    /// Dumps every appended event to the standard error descriptor.
    ///
    /// Refer to [`PageLog::print_to`] for the output format. Write errors
    /// are ignored.
    pub fn print(&self) {
        let _ = self.print_to(std::io::stderr());
    }

    /// Dumps every appended event to `fd`.
    ///
    /// One block per event is written, holding the thread id, the thunk id,
    /// the page, the kind of access and the symbolized issuer and thunk-start
    /// addresses. The output goes to the descriptor piece by piece without
    /// allocating, so this can be called while handling a crash.
    ///
    /// # Errors
    ///
    /// Returns the first error reported by `write(2)`.
    pub fn print_to<Fd: AsFd>(&self, fd: Fd) -> rustix::io::Result<()> {
        dump::dump(fd, self.iter())
    }
}

impl fmt::Debug for PageLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageLog")
            .field("region", &format_args!("{:#x}", self.region.base_address()))
            .field("len", &self.len())
            .field("capacity", &CAPACITY)
            .finish()
    }
}

/// A read-back requested an event that is not part of the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfRange {
    /// The requested position
    pub index: usize,

    /// Number of appended events at the time of the request
    pub len: usize,
}

impl OutOfRange {
    pub fn errno(&self) -> i32 {
        errno::INDEX_OUT_OF_RANGE
    }
}

impl fmt::Display for OutOfRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: index {} with {} of {} slots in use",
            pagelog_error::errno_description(self.errno()),
            self.index,
            self.len,
            CAPACITY
        )
    }
}

impl error::Error for OutOfRange {}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        io::{Read, Seek, SeekFrom},
        os::unix::process::ExitStatusExt,
        process::Command,
        thread,
    };

    use anyhow::{Error, bail};
    use rand_xoshiro::{
        Xoshiro256PlusPlus,
        rand_core::{RngCore, SeedableRng},
    };

    use crate::{
        context::{self, ThreadContext},
        event::{Access, AccessEvent},
    };

    use super::{CAPACITY, OutOfRange, PageLog};

    const OVERFLOW_CHILD: &str = "PAGELOG_OVERFLOW_CHILD";
    const LAZY_INSTANCE_CHILD: &str = "PAGELOG_LAZY_INSTANCE_CHILD";

    fn event(page_start: usize, access: Access, thread_id: u32) -> AccessEvent {
        AccessEvent::with_context(
            page_start,
            access,
            0x4010,
            &ThreadContext {
                thread_id,
                thunk_id: 0,
                thunk_start: 0x4000,
            },
        )
    }

    fn random_events(n: usize) -> Vec<AccessEvent> {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(42);
        (0..n)
            .map(|_| {
                let access = if rng.next_u32() % 2 == 0 {
                    Access::Read
                } else {
                    Access::Write
                };
                AccessEvent::with_context(
                    (rng.next_u64() as usize) & !0xfff,
                    access,
                    rng.next_u64() as usize,
                    &ThreadContext {
                        thread_id: rng.next_u32() % 16,
                        thunk_id: rng.next_u32() % 64,
                        thunk_start: rng.next_u64() as usize,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn len_counts_sequential_appends() -> Result<(), Error> {
        let log = PageLog::create()?;
        assert!(log.is_empty());

        for (n, entry) in random_events(CAPACITY).into_iter().enumerate() {
            assert_eq!(log.add(entry), n);
            assert_eq!(log.len(), n + 1);
        }
        assert_eq!(log.len(), log.capacity());

        Ok(())
    }

    #[test]
    fn get_returns_what_was_appended() -> Result<(), Error> {
        let log = PageLog::create()?;
        let events = random_events(500);
        for entry in &events {
            log.add(*entry);
        }

        for (i, entry) in events.iter().enumerate() {
            assert_eq!(log.get(i)?, *entry);
        }
        assert_eq!(log.iter().collect::<Vec<_>>(), events);

        Ok(())
    }

    #[test]
    fn get_out_of_range() -> Result<(), Error> {
        let log = PageLog::create()?;
        assert_eq!(log.get(0), Err(OutOfRange { index: 0, len: 0 }));

        log.add(event(0x7000, Access::Read, 0));
        log.add(event(0x8000, Access::Read, 0));
        log.get(1)?;
        assert_eq!(log.get(2), Err(OutOfRange { index: 2, len: 2 }));
        assert_eq!(
            log.get(CAPACITY),
            Err(OutOfRange {
                index: CAPACITY,
                len: 2
            })
        );
        log.get(usize::MAX).unwrap_err();

        // converts into anyhow
        let err: Error = log.get(5).unwrap_err().into();
        assert!(err.to_string().contains("index 5"));

        Ok(())
    }

    #[test]
    fn reset_makes_entries_unreachable() -> Result<(), Error> {
        let log = PageLog::create()?;
        for entry in random_events(10) {
            log.add(entry);
        }
        log.reset();

        assert_eq!(log.len(), 0);
        for i in 0..10 {
            log.get(i).unwrap_err();
        }
        assert_eq!(log.iter().count(), 0);

        // slots are handed out from the start again
        assert_eq!(log.add(event(0x1000, Access::Write, 0)), 0);

        Ok(())
    }

    #[test]
    fn round_trip_with_ambient_context() -> Result<(), Error> {
        let log = PageLog::create()?;

        thread::spawn(move || -> Result<(), Error> {
            context::enter(ThreadContext {
                thread_id: 1,
                thunk_id: 3,
                thunk_start: 0x4000,
            })?;
            log.add(AccessEvent::new(0x7000, Access::Read, 0x4010));
            Ok(())
        })
        .join()
        .expect("worker panicked")?;

        assert_eq!(log.len(), 1);
        let entry = log.get(0)?;
        assert_eq!(
            (
                entry.page_start(),
                entry.access(),
                entry.thread_id(),
                entry.thunk_id(),
                entry.thunk_start(),
                entry.first_issuer_address()
            ),
            (0x7000, Access::Read, 1, 3, 0x4000, 0x4010)
        );

        Ok(())
    }

    #[test]
    fn mixed_access_kinds_on_one_page() -> Result<(), Error> {
        let log = PageLog::create()?;
        let page = 0xa000;
        log.add(event(page, Access::Read, 1));
        log.add(event(page, Access::Write, 2));

        assert_eq!(log.len(), 2);
        let (first, second) = (log.get(0)?, log.get(1)?);
        assert_eq!(first.page_start(), second.page_start());
        assert_eq!((first.thread_id(), first.access()), (1, Access::Read));
        assert_eq!((second.thread_id(), second.access()), (2, Access::Write));

        Ok(())
    }

    #[test]
    fn concurrent_appenders_claim_distinct_slots() -> Result<(), Error> {
        const WORKERS: u32 = 8;
        const PER_WORKER: usize = 256;

        let log = PageLog::create()?;
        let handles: Vec<_> = (0..WORKERS)
            .map(|worker| {
                thread::spawn(move || {
                    (0..PER_WORKER)
                        .map(|i| {
                            let entry = event(i * 0x1000, Access::Write, worker);
                            (log.add(entry), entry)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut slots = HashSet::new();
        for handle in handles {
            for (slot, entry) in handle.join().expect("appender panicked") {
                assert!(slots.insert(slot), "slot {slot} was claimed twice");
                assert_eq!(log.get(slot)?, entry);
            }
        }

        let total = WORKERS as usize * PER_WORKER;
        assert_eq!(log.len(), total);
        assert_eq!(slots, (0..total).collect());

        Ok(())
    }

    #[test]
    fn forked_children_share_the_log() -> Result<(), Error> {
        const CHILDREN: u32 = 4;
        const PER_CHILD: usize = 100;

        let log = PageLog::create()?;
        let mut pids = Vec::new();
        for child in 0..CHILDREN {
            match unsafe { libc::fork() } {
                -1 => bail!("fork failed"),
                0 => {
                    for i in 0..PER_CHILD {
                        log.add(event(i * 0x1000, Access::Read, child));
                    }
                    unsafe { libc::_exit(0) }
                }
                pid => pids.push(pid),
            }
        }

        for pid in pids {
            let mut status = 0;
            if unsafe { libc::waitpid(pid, &mut status, 0) } != pid {
                bail!("waitpid failed for {pid}");
            }
            assert!(libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0);
        }

        assert_eq!(log.len(), CHILDREN as usize * PER_CHILD);
        for child in 0..CHILDREN {
            assert_eq!(
                log.iter().filter(|e| e.thread_id() == child).count(),
                PER_CHILD
            );
        }

        Ok(())
    }

    #[test]
    fn process_log_is_initialized_once() {
        let first = PageLog::initialize();
        let second = PageLog::initialize();
        let instance = PageLog::get_instance();

        assert_eq!(
            first.region.base_address(),
            second.region.base_address()
        );
        assert_eq!(
            first.region.base_address(),
            instance.region.base_address()
        );
    }

    #[test]
    fn get_instance_before_initialize_maps_the_process_log() -> Result<(), Error> {
        // runs alone in a fresh process so no other test has mapped the log yet
        if std::env::var_os(LAZY_INSTANCE_CHILD).is_some() {
            let instance = PageLog::get_instance();
            instance.add(event(0x7000, Access::Read, 0));
            let initialized = PageLog::initialize();

            let same_region =
                instance.region.base_address() == initialized.region.base_address();
            let code = if same_region && initialized.len() == 1 { 0 } else { 1 };
            std::process::exit(code);
        }

        let output = Command::new(std::env::current_exe()?)
            .args([
                "--exact",
                "access_log::tests::get_instance_before_initialize_maps_the_process_log",
                "--nocapture",
                "--test-threads=1",
            ])
            .env(LAZY_INSTANCE_CHILD, "1")
            .output()?;

        assert!(
            output.status.success(),
            "{}",
            String::from_utf8_lossy(&output.stderr)
        );

        Ok(())
    }

    #[test]
    fn print_dumps_every_entry() -> Result<(), Error> {
        let log = PageLog::create()?;
        log.add(event(0x7000, Access::Read, 1));
        log.add(event(0x7000, Access::Write, 2));

        let mut file = tempfile::tempfile()?;
        log.print_to(&file)?;
        file.seek(SeekFrom::Start(0))?;
        let mut output = String::new();
        file.read_to_string(&mut output)?;

        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 1 + 2 * 2);
        assert_eq!(lines[0], "______Page Access Result_______");
        assert!(lines[1].starts_with(
            "threadIndex: 1, thunkId: 0, pageStart: 0x7000, access: read, issued at: "
        ));
        assert!(lines[3].starts_with(
            "threadIndex: 2, thunkId: 0, pageStart: 0x7000, access: write, issued at: "
        ));

        Ok(())
    }

    #[test]
    fn appending_beyond_capacity_aborts() -> Result<(), Error> {
        if std::env::var_os(OVERFLOW_CHILD).is_some() {
            let log = PageLog::create()?;
            for i in 0..CAPACITY {
                log.add(event(i * 0x1000, Access::Write, 0));
            }
            assert_eq!(log.len(), CAPACITY);
            log.add(event(0, Access::Write, 0));

            // not reached
            std::process::exit(0);
        }

        let output = Command::new(std::env::current_exe()?)
            .args([
                "--exact",
                "access_log::tests::appending_beyond_capacity_aborts",
                "--nocapture",
                "--test-threads=1",
            ])
            .env(OVERFLOW_CHILD, "1")
            .output()?;

        assert!(!output.status.success());
        assert_eq!(output.status.signal(), Some(libc::SIGABRT));
        assert!(String::from_utf8_lossy(&output.stderr).contains("pagelog size limit reached"));

        Ok(())
    }
}

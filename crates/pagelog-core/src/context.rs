use std::{
    cell::Cell,
    sync::atomic::{AtomicU32, Ordering},
};

use anyhow::{Error, bail};

static THREAD_COUNTER: AtomicU32 = AtomicU32::new(0);

thread_local! {
    static LOCAL_CONTEXT: Cell<LocalContext> = const { Cell::new(LocalContext::EMPTY) }
}

/// A snapshot of what the calling worker is executing.
///
/// Every [`AccessEvent`](crate::AccessEvent) copies one of these at
/// construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadContext {
    /// Id of the worker
    pub thread_id: u32,

    /// Id of the synchronization epoch the worker is in
    pub thunk_id: u32,

    /// Code address where that epoch started
    pub thunk_start: usize,
}

impl ThreadContext {
    /// Reported by [`current`] when thread-local storage is no longer
    /// accessible, e.g. while the thread is being torn down.
    pub const DETACHED: Self = Self {
        thread_id: u32::MAX,
        thunk_id: 0,
        thunk_start: 0,
    };
}

#[derive(Clone, Copy)]
struct LocalContext {
    thread_id: Option<u32>,
    thunk_id: u32,
    thunk_start: usize,
    in_thunk: bool,
}

impl LocalContext {
    const EMPTY: Self = Self {
        thread_id: None,
        thunk_id: 0,
        thunk_start: 0,
        in_thunk: false,
    };

    fn resolve_thread_id(&mut self) -> u32 {
        match self.thread_id {
            Some(thread_id) => thread_id,
            None => {
                let thread_id = next_available_thread_id();
                self.thread_id = Some(thread_id);
                thread_id
            }
        }
    }
}

/// Generates a new thread-id, unique within the calling process.
///
/// This function internally increments an [`AtomicU32`].
/// Therefore, with the current implementation there is no
/// way of reusing thread-ids inside one process.
///
/// The counter is private memory, so children created by `fork` each
/// continue from the value the parent had and hand out the same ids.
/// A forked worker must therefore install its id with [`set_thread_id`]
/// or [`enter`] before it records anything.
pub fn next_available_thread_id() -> u32 {
    THREAD_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Retrieves the thread-id of the current thread
///
/// A thread that never called [`set_thread_id`] (or [`enter`]) is assigned
/// the next available id upon first access, which then sticks. Such ids
/// are only unique per process; see [`next_available_thread_id`].
///
/// # Errors
///
/// This function may fail if the thread-local storage, where the
/// thread-id resides, can not be accessed.
pub fn thread_id() -> Result<u32, Error> {
    Ok(LOCAL_CONTEXT.try_with(|local| {
        let mut ctx = local.get();
        let thread_id = ctx.resolve_thread_id();
        local.set(ctx);
        thread_id
    })?)
}

/// Sets the thread-id for the current thread
///
/// This operation is only allowed **once** per thread.
///
/// # Errors
///
/// This function may fail in the following cases:
/// - The thread-local storage, where the thread-id resides
///   can not be accessed.
/// - The thread already has an id, either from an earlier call
///   or because one was assigned on first access
pub fn set_thread_id(id: u32) -> Result<(), Error> {
    LOCAL_CONTEXT.try_with(|local| {
        let mut ctx = local.get();
        if ctx.thread_id.is_some() {
            bail!("Thread id was already initialized!")
        }
        ctx.thread_id = Some(id);
        local.set(ctx);
        Ok(())
    })?
}

/// Marks the start of a new thunk at code address `start`.
///
/// Returns the id of the new thunk. Ids count up from zero per thread.
///
/// # Errors
///
/// This function may fail if the thread-local storage can not be accessed.
pub fn begin_thunk(start: usize) -> Result<u32, Error> {
    Ok(LOCAL_CONTEXT.try_with(|local| {
        let mut ctx = local.get();
        if ctx.in_thunk {
            ctx.thunk_id = ctx.thunk_id.wrapping_add(1);
        } else {
            ctx.in_thunk = true;
        }
        ctx.thunk_start = start;
        local.set(ctx);
        ctx.thunk_id
    })?)
}

/// Replaces the context of the current thread with `snapshot`.
///
/// Runtimes use this to restore a worker's state; the next
/// [`begin_thunk`] continues from `snapshot.thunk_id + 1`.
///
/// # Errors
///
/// This function may fail if the thread-local storage can not be accessed.
pub fn enter(snapshot: ThreadContext) -> Result<(), Error> {
    Ok(LOCAL_CONTEXT.try_with(|local| {
        local.set(LocalContext {
            thread_id: Some(snapshot.thread_id),
            thunk_id: snapshot.thunk_id,
            thunk_start: snapshot.thunk_start,
            in_thunk: true,
        })
    })?)
}

/// Returns the context of the calling thread.
///
/// Never allocates and never fails; if thread-local storage is gone
/// [`ThreadContext::DETACHED`] is returned instead.
pub fn current() -> ThreadContext {
    LOCAL_CONTEXT
        .try_with(|local| {
            let mut ctx = local.get();
            let thread_id = ctx.resolve_thread_id();
            local.set(ctx);
            ThreadContext {
                thread_id,
                thunk_id: ctx.thunk_id,
                thunk_start: ctx.thunk_start,
            }
        })
        .unwrap_or(ThreadContext::DETACHED)
}

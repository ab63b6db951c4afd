use std::fmt;

use crate::context::{self, ThreadContext};

/// How a page was accessed.
///
/// The discriminants are fixed so that a zero-filled slot of the shared
/// region still decodes to a valid value.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Write = 0,
    Read = 1,
}

impl Access {
    pub fn as_str(self) -> &'static str {
        match self {
            Access::Read => "read",
            Access::Write => "write",
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single page touch recorded by the trap handler.
///
/// Events are plain data without heap references, so they can be copied
/// into a mapping shared between processes. Once constructed they never
/// change.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccessEvent {
    page_start: usize,
    thunk_start: usize,
    first_issuer_address: usize,
    thread_id: u32,
    thunk_id: u32,
    access: Access,
}

impl AccessEvent {
    /// Creates an event for the calling thread.
    ///
    /// `page_start` is the page that was touched and `issuer_address` the
    /// instruction that raised the protection trap. Thread id, thunk id and
    /// thunk start are taken from [`context::current`].
    ///
    /// A lazily assigned thread id is only unique within one process.
    /// Workers created with `fork` must call [`context::enter`] or
    /// [`context::set_thread_id`] first.
    #[inline]
    pub fn new(page_start: usize, access: Access, issuer_address: usize) -> Self {
        Self::with_context(page_start, access, issuer_address, &context::current())
    }

    /// Creates an event from an explicit context snapshot.
    #[inline]
    pub fn with_context(
        page_start: usize,
        access: Access,
        issuer_address: usize,
        ctx: &ThreadContext,
    ) -> Self {
        Self {
            page_start,
            thunk_start: ctx.thunk_start,
            first_issuer_address: issuer_address,
            thread_id: ctx.thread_id,
            thunk_id: ctx.thunk_id,
            access,
        }
    }

    pub fn page_start(&self) -> usize {
        self.page_start
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn thunk_id(&self) -> u32 {
        self.thunk_id
    }

    /// Start of the thunk this access happened in. The thunk ends where
    /// the next thunk of the same thread starts.
    pub fn thunk_start(&self) -> usize {
        self.thunk_start
    }

    pub fn first_issuer_address(&self) -> usize {
        self.first_issuer_address
    }

    pub fn access(&self) -> Access {
        self.access
    }
}

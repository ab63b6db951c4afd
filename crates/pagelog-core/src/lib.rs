//! A shared, append-only log of page accesses.
//!
//! A runtime that protects memory pages and traps on their first access
//! within a thunk records one [`AccessEvent`] per trap in a [`PageLog`].
//! The log lives in a single anonymous shared mapping: its first word counts
//! the claimed slots, the rest holds a fixed array of [`CAPACITY`] events.
//! Appending is one atomic fetch-and-increment followed by a plain store, so
//! it works from within a trap handler, from many threads at once, and from
//! processes forked after the log was created.
//!
//! ```no_run
//! use pagelog_core::{Access, AccessEvent, PageLog, context};
//!
//! let log = PageLog::initialize();
//!
//! context::set_thread_id(0).unwrap();
//! context::begin_thunk(0x4000).unwrap();
//! log.add(AccessEvent::new(0x7000, Access::Read, 0x4010));
//!
//! assert_eq!(log.len(), 1);
//! log.print();
//! ```

/// Per-thread bookkeeping of worker id and current thunk
pub mod context;

mod access_log;
mod dump;
mod event;
mod region;

pub use access_log::{OutOfRange, PageLog};
pub use context::ThreadContext;
pub use event::{Access, AccessEvent};
pub use region::CAPACITY;

use std::{
    cell::UnsafeCell,
    mem::size_of,
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

use rustix::mm::{MapFlags, ProtFlags, mmap_anonymous};

use crate::event::AccessEvent;

/// Number of slots of every page log.
pub const CAPACITY: usize = 4096;

/// Memory layout of one page log inside its shared mapping.
///
/// The first machine word is the counter of claimed slots, the rest is the
/// slot array. Both live in the same `MAP_SHARED` mapping, so processes
/// forked after the mapping see the same counter and the same slots.
#[repr(C)]
pub(crate) struct Region {
    pub(crate) next_free: AtomicUsize,
    slots: [UnsafeCell<AccessEvent>; CAPACITY],
}

// Slots are handed out exclusively through `next_free`.
unsafe impl Sync for Region {}

impl Region {
    pub(crate) const SIZE: usize = size_of::<Region>();

    /// Maps a fresh region. The mapping is never released.
    pub(crate) fn map() -> rustix::io::Result<&'static Region> {
        let addr = unsafe {
            mmap_anonymous(
                ptr::null_mut(),
                Self::SIZE,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
            )?
        };

        // Anonymous mappings are zero-filled and a zeroed `AccessEvent` is a
        // valid value, so every slot is initialized from here on.
        let region = unsafe { &*(addr as *const Region) };
        region.next_free.store(0, Ordering::SeqCst);

        Ok(region)
    }

    pub(crate) fn base_address(&self) -> usize {
        self as *const Region as usize
    }

    /// # Safety
    ///
    /// `slot` must have been claimed through `next_free` by the caller and
    /// must be below [`CAPACITY`].
    #[inline]
    pub(crate) unsafe fn write(&self, slot: usize, event: AccessEvent) {
        unsafe { self.slots.get_unchecked(slot).get().write_volatile(event) }
    }

    /// Reads back `slot`. Readers must not overlap with the writer of the
    /// same slot.
    #[inline]
    pub(crate) fn read(&self, slot: usize) -> AccessEvent {
        unsafe { self.slots[slot].get().read_volatile() }
    }
}

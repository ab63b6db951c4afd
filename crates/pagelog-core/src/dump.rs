use std::{
    ffi::CStr,
    os::fd::{AsFd, BorrowedFd},
};

use rustix::io;

use crate::event::AccessEvent;

const HEADER: &[u8] = b"______Page Access Result_______\n";

/// Writes straight to a descriptor.
///
/// Every call ends up in `write(2)`; numbers are rendered into stack
/// buffers first. Nothing is allocated and nothing is buffered, so a crash
/// handler may use this.
pub(crate) struct RawWriter<'fd> {
    fd: BorrowedFd<'fd>,
}

impl<'fd> RawWriter<'fd> {
    pub(crate) fn new(fd: BorrowedFd<'fd>) -> Self {
        Self { fd }
    }

    pub(crate) fn bytes(&self, buf: &[u8]) -> io::Result<()> {
        pagelog_error::write_all(self.fd, buf)
    }

    fn cstr(&self, s: &CStr) -> io::Result<()> {
        self.bytes(s.to_bytes())
    }

    pub(crate) fn dec(&self, mut value: u64) -> io::Result<()> {
        let mut buf = [0u8; 20];
        let mut pos = buf.len();
        loop {
            pos -= 1;
            buf[pos] = b'0' + (value % 10) as u8;
            value /= 10;
            if value == 0 {
                break;
            }
        }
        self.bytes(&buf[pos..])
    }

    /// Same rendering as `{:#x}`.
    pub(crate) fn hex(&self, mut value: usize) -> io::Result<()> {
        const DIGITS: &[u8; 16] = b"0123456789abcdef";
        let mut buf = [0u8; 2 + 2 * size_of::<usize>()];
        let mut pos = buf.len();
        loop {
            pos -= 1;
            buf[pos] = DIGITS[value & 0xf];
            value >>= 4;
            if value == 0 {
                break;
            }
        }
        pos -= 2;
        buf[pos] = b'0';
        buf[pos + 1] = b'x';
        self.bytes(&buf[pos..])
    }

    /// Resolves `addr` through the dynamic linker and writes one line in
    /// the layout of `backtrace_symbols_fd`: `object(symbol+0xoff) [0xaddr]`.
    pub(crate) fn symbol(&self, addr: usize) -> io::Result<()> {
        write_symbol_name(self, addr)?;
        self.bytes(b"[")?;
        self.hex(addr)?;
        self.bytes(b"]\n")
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "freebsd",
    ))] {
        fn write_symbol_name(out: &RawWriter<'_>, addr: usize) -> io::Result<()> {
            let mut info = libc::Dl_info {
                dli_fname: std::ptr::null(),
                dli_fbase: std::ptr::null_mut(),
                dli_sname: std::ptr::null(),
                dli_saddr: std::ptr::null_mut(),
            };
            if unsafe { libc::dladdr(addr as *const libc::c_void, &mut info) } == 0 {
                return Ok(());
            }

            if !info.dli_fname.is_null() {
                out.cstr(unsafe { CStr::from_ptr(info.dli_fname) })?;
            }
            out.bytes(b"(")?;
            if !info.dli_sname.is_null() {
                out.cstr(unsafe { CStr::from_ptr(info.dli_sname) })?;
                out.bytes(b"+")?;
                out.hex(addr.wrapping_sub(info.dli_saddr as usize))?;
            } else {
                out.bytes(b"+")?;
                out.hex(addr.wrapping_sub(info.dli_fbase as usize))?;
            }
            out.bytes(b") ")
        }
    } else {
        fn write_symbol_name(_out: &RawWriter<'_>, _addr: usize) -> io::Result<()> {
            Ok(())
        }
    }
}

fn write_event(out: &RawWriter<'_>, event: &AccessEvent) -> io::Result<()> {
    out.bytes(b"threadIndex: ")?;
    out.dec(u64::from(event.thread_id()))?;
    out.bytes(b", thunkId: ")?;
    out.dec(u64::from(event.thunk_id()))?;
    out.bytes(b", pageStart: ")?;
    out.hex(event.page_start())?;
    out.bytes(b", access: ")?;
    out.bytes(event.access().as_str().as_bytes())?;
    out.bytes(b", issued at: ")?;
    out.symbol(event.first_issuer_address())?;
    out.bytes(b"\tthunk_start: ")?;
    out.symbol(event.thunk_start())
}

/// Writes the header followed by one block per event to `fd`.
pub(crate) fn dump<Fd: AsFd>(
    fd: Fd,
    events: impl Iterator<Item = AccessEvent>,
) -> io::Result<()> {
    let out = RawWriter::new(fd.as_fd());
    out.bytes(HEADER)?;
    for event in events {
        write_event(&out, &event)?;
    }
    Ok(())
}

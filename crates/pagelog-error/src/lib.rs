use std::os::fd::AsFd;

use rustix::io::{self, Errno};

/// Defines all error codes used throughout pagelog
pub mod errno {
    /// Operation completed without error
    ///
    /// **Note:** Should not be passed to [`fatal`](super::fatal).
    /// Aborting without an error makes no sense!
    pub const NO_ERROR: i32 = 0;

    /// Fatal: The shared region backing the page log could not be mapped
    ///
    /// Emitted while initializing the process-wide page log if the
    /// operating system refused the anonymous shared mapping. A runtime
    /// that cannot allocate its own accounting store does not continue.
    pub const SHM_MAP_FAILED: i32 = 1;

    /// Fatal: An append claimed a slot beyond the fixed log capacity
    ///
    /// The page log never drops or blocks on an append. Once the claimed
    /// slot index reaches the capacity the process is aborted, so a log
    /// that exists is always complete.
    pub const LOG_CAPACITY_EXCEEDED: i32 = 2;

    /// Recoverable: A read-back requested an entry outside the appended range
    ///
    /// Only reachable through the introspection API, never from the
    /// append path.
    pub const INDEX_OUT_OF_RANGE: i32 = 3;
}

/// Returns a string describing the error based on the given error code `errno`
///
/// The returned string is static, so it can be emitted from contexts where
/// allocating is not allowed.
pub fn errno_description(errno: i32) -> &'static str {
    match errno {
        0 => "No Error",
        1 => "Fatal Error: shared memory mapping for the page log failed",
        2 => "Fatal Error: pagelog size limit reached",
        3 => "Error: index not in range of log",
        _ => "Unknown error!",
    }
}

/// Hands all of `buf` to `write(2)` on `fd`.
///
/// Partial writes are continued and calls interrupted by a signal are
/// retried. A write that makes no progress is reported as [`Errno::IO`].
pub fn write_all<Fd: AsFd>(fd: Fd, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match io::write(&fd, buf) {
            Ok(0) => return Err(Errno::IO),
            Ok(n) => buf = &buf[n..],
            Err(Errno::INTR) => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Writes a diagnostic for `errno` to the standard error descriptor and aborts.
///
/// Nothing here allocates or buffers: the message is handed to `write(2)`
/// directly. This makes the function usable from a trap handler.
#[cold]
pub fn fatal(errno: i32) -> ! {
    let stderr = std::io::stderr();
    for part in [
        b"pagelog: ".as_slice(),
        errno_description(errno).as_bytes(),
        b"\n".as_slice(),
    ] {
        if write_all(&stderr, part).is_err() {
            break;
        }
    }

    std::process::abort()
}

#[cfg(test)]
mod tests {
    use std::{
        fs::File,
        io::{Read, Seek, SeekFrom},
        os::fd::{FromRawFd, OwnedFd},
        sync::mpsc,
        thread,
        time::Duration,
    };

    use super::{errno, errno_description, write_all};

    extern "C" fn interrupt(_: libc::c_int) {}

    fn pipe() -> (File, OwnedFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { (File::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn write_all_writes_everything() -> Result<(), std::io::Error> {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut file = tempfile::tempfile()?;
        write_all(&file, &data)?;

        file.seek(SeekFrom::Start(0))?;
        let mut written = Vec::new();
        file.read_to_end(&mut written)?;
        assert_eq!(written, data);

        Ok(())
    }

    #[test]
    fn write_all_survives_signals() -> Result<(), std::io::Error> {
        // no SA_RESTART: a blocked write returns EINTR or a short count
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t;
            libc::sigemptyset(&mut action.sa_mask);
            assert_eq!(libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut()), 0);
        }

        let data: Vec<u8> = (0..1_000_000u32).map(|i| (i % 239) as u8).collect();
        let (mut reader, writer) = pipe();
        let (tx, rx) = mpsc::channel();

        let expected = data.clone();
        let handle = thread::spawn(move || {
            tx.send(unsafe { libc::pthread_self() }).unwrap();
            write_all(&writer, &data)
        });

        // the writer blocks on the full pipe until we start reading
        let tid = rx.recv().unwrap();
        for _ in 0..5 {
            thread::sleep(Duration::from_millis(20));
            assert_eq!(unsafe { libc::pthread_kill(tid, libc::SIGUSR1) }, 0);
        }

        let mut received = vec![0u8; expected.len()];
        reader.read_exact(&mut received)?;
        handle.join().unwrap()?;
        assert_eq!(received, expected);

        Ok(())
    }

    #[test]
    fn every_code_has_a_description() {
        for code in [
            errno::NO_ERROR,
            errno::SHM_MAP_FAILED,
            errno::LOG_CAPACITY_EXCEEDED,
            errno::INDEX_OUT_OF_RANGE,
        ] {
            assert_ne!(errno_description(code), "Unknown error!");
        }
    }

    #[test]
    fn unknown_codes_are_reported_as_such() {
        for code in (-100..100).filter(|code| !(0..=3).contains(code)) {
            assert_eq!(errno_description(code), "Unknown error!");
        }
    }
}

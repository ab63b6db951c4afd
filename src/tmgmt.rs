use std::{collections::HashMap, thread::JoinHandle};

use anyhow::{Error, anyhow, bail};

/// How a worker of a workload is backed.
pub enum WorkerHandle {
    Thread(JoinHandle<Result<(), Error>>),
    Process(libc::pid_t),
}

impl WorkerHandle {
    /// Blocks until the worker has finished and returns its outcome.
    fn wait(self, thread_id: u32) -> Result<(), Error> {
        match self {
            WorkerHandle::Thread(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(anyhow!("Worker {thread_id} panicked.")),
            },
            WorkerHandle::Process(pid) => wait_for_process(thread_id, pid),
        }
    }
}

/// Keeps track of all workers spawned for one workload.
pub struct WorkerManagement {
    workers: HashMap<u32, WorkerHandle>,
}

impl WorkerManagement {
    pub fn new() -> Self {
        Self {
            workers: HashMap::new(),
        }
    }

    /// Registers `handle` under `thread_id`.
    ///
    /// # Errors
    ///
    /// Fails if `thread_id` is taken. The rejected worker is waited for
    /// before the error is returned.
    pub fn register_worker(&mut self, thread_id: u32, handle: WorkerHandle) -> Result<(), Error> {
        if self.workers.contains_key(&thread_id) {
            let _ = handle.wait(thread_id);
            bail!("Registered worker {thread_id} twice.")
        }
        self.workers.insert(thread_id, handle);
        Ok(())
    }

    /// Waits for every registered worker and reports the first failure.
    ///
    /// All workers are waited for even if one of them failed, so no
    /// process is left behind as a zombie.
    pub fn join_all(self) -> Result<(), Error> {
        let mut workers: Vec<_> = self.workers.into_iter().collect();
        workers.sort_by_key(|(thread_id, _)| *thread_id);

        let mut outcome = Ok(());
        for (thread_id, handle) in workers {
            if let Err(err) = handle.wait(thread_id) {
                log::warn!("Worker {thread_id} failed: {err}");
                if outcome.is_ok() {
                    outcome = Err(err);
                }
            }
        }

        outcome
    }
}

impl Default for WorkerManagement {
    fn default() -> Self {
        Self::new()
    }
}

fn wait_for_process(thread_id: u32, pid: libc::pid_t) -> Result<(), Error> {
    let mut status = 0;
    loop {
        let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
        if ret == pid {
            break;
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(anyhow!("Could not wait for worker {thread_id} (pid {pid}): {err}"));
        }
    }

    if libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0 {
        Ok(())
    } else if libc::WIFSIGNALED(status) {
        Err(anyhow!(
            "Worker {thread_id} (pid {pid}) was killed by signal {}",
            libc::WTERMSIG(status)
        ))
    } else {
        Err(anyhow!(
            "Worker {thread_id} (pid {pid}) exited with status {}",
            libc::WEXITSTATUS(status)
        ))
    }
}

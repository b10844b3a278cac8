//! Communication handles tying a coordinator to one worker: the two RPC
//! pipes, the shared-memory permit slot, and the fd/env plumbing a freshly
//! spawned worker uses to find them.
use crate::mem::{MemError, SharedMem};
use std::fs::File;
use std::os::unix::io::{FromRawFd, RawFd};
use std::sync::{Arc, Condvar, Mutex};
use thiserror::Error;

/// Sentinel for RPCs that raced worker disposal. Callers suppress it; it
/// never reaches the user.
#[derive(Debug, Error)]
#[error("internal error: shared memory was closed and unmapped")]
pub struct SharedMemClosed;

/// Single-permit slot guarding the shared-memory region.
///
/// Whoever holds the `SharedMem` may touch the mapping; everyone else blocks
/// in `acquire`. The slot is not tied to a thread, so the permit moves freely
/// between supervisor tasks and survives worker restarts. Closing the slot
/// wakes all waiters with [`SharedMemClosed`].
pub struct MemSlot {
    inner: Mutex<SlotState>,
    cond: Condvar,
}

struct SlotState {
    mem: Option<SharedMem>,
    closed: bool,
}

impl MemSlot {
    pub fn new(mem: SharedMem) -> MemSlot {
        MemSlot {
            inner: Mutex::new(SlotState {
                mem: Some(mem),
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Takes the permit, blocking until it is available or the slot closes.
    pub fn acquire(&self) -> Result<SharedMem, SharedMemClosed> {
        let mut state = self.inner.lock().unwrap();
        loop {
            if let Some(mem) = state.mem.take() {
                return Ok(mem);
            }
            if state.closed {
                return Err(SharedMemClosed);
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    /// Returns the permit. Panics if the slot already holds one; that means
    /// two parties believed they owned the region.
    pub fn release(&self, mem: SharedMem) {
        let mut state = self.inner.lock().unwrap();
        assert!(state.mem.is_none(), "shared memory permit released twice");
        if !state.closed {
            state.mem = Some(mem);
        }
        drop(state);
        self.cond.notify_one();
    }

    /// Waits for the permit, then closes the slot for good and hands the
    /// region back to the caller for disposal.
    pub fn close(&self) -> Option<SharedMem> {
        let mut state = self.inner.lock().unwrap();
        loop {
            if state.closed {
                return None;
            }
            if let Some(mem) = state.mem.take() {
                state.closed = true;
                drop(state);
                self.cond.notify_all();
                return Some(mem);
            }
            state = self.cond.wait(state).unwrap();
        }
    }
}

/// Handles tied to one worker. On the coordinator side `fuzz_in` is the write
/// end and `fuzz_out` the read end; in the worker process it is the reverse.
pub struct WorkerComm {
    pub fuzz_in: File,
    pub fuzz_out: File,
    pub mem: Arc<MemSlot>,
}

/// Environment variable a worker process reads to locate its channel:
/// `<fuzz_in fd>,<fuzz_out fd>,<shm os id>,<shm size>`.
pub const WORKER_COMM_ENV: &str = "FUZZRIG_WORKER_COMM";

/// Fixed descriptors the supervisor dups the worker's pipe ends onto.
/// Stdio (0-2) stays untouched for the user's program.
pub const WORKER_FUZZ_IN_FD: RawFd = 3;
pub const WORKER_FUZZ_OUT_FD: RawFd = 4;

#[derive(Debug, Error)]
pub enum CommError {
    #[error("{WORKER_COMM_ENV} is not set; not a worker process")]
    NotWorker,
    #[error("malformed {WORKER_COMM_ENV} value {0:?}")]
    BadEnv(String),
    #[error("shared memory: {0}")]
    Mem(#[from] MemError),
}

pub(crate) fn worker_env_value(os_id: &str, size: usize) -> String {
    format!(
        "{},{},{},{}",
        WORKER_FUZZ_IN_FD, WORKER_FUZZ_OUT_FD, os_id, size
    )
}

/// Whether this process was spawned as a fuzz worker.
pub fn is_worker_process() -> bool {
    std::env::var_os(WORKER_COMM_ENV).is_some()
}

/// Reconstructs the channel handles inside a worker process from the
/// environment left by the supervisor. Must be called at most once: it takes
/// ownership of the inherited descriptors.
pub fn get_worker_comm() -> Result<WorkerComm, CommError> {
    let raw = std::env::var(WORKER_COMM_ENV).map_err(|_| CommError::NotWorker)?;
    let parts: Vec<&str> = raw.split(',').collect();
    if parts.len() != 4 {
        return Err(CommError::BadEnv(raw));
    }
    let in_fd: RawFd = parts[0].parse().map_err(|_| CommError::BadEnv(raw.clone()))?;
    let out_fd: RawFd = parts[1].parse().map_err(|_| CommError::BadEnv(raw.clone()))?;
    let os_id = parts[2];
    let _size: usize = parts[3].parse().map_err(|_| CommError::BadEnv(raw.clone()))?;

    let mem = SharedMem::open(os_id)?;
    let fuzz_in = unsafe { File::from_raw_fd(in_fd) };
    let fuzz_out = unsafe { File::from_raw_fd(out_fd) };
    Ok(WorkerComm {
        fuzz_in,
        fuzz_out,
        mem: Arc::new(MemSlot::new(mem)),
    })
}

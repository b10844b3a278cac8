//! Worker process supervision.
//!
//! A `Worker` owns one child test process: it spawns it with the RPC pipes
//! and shared memory wired up, relays fuzz and minimize requests to it, and
//! classifies how it dies. The shared-memory region outlives the process so
//! the last attempted input survives a crash.
use crate::client::WorkerClient;
use crate::comm::{worker_env_value, MemSlot, WorkerComm, WORKER_COMM_ENV, WORKER_FUZZ_IN_FD, WORKER_FUZZ_OUT_FD};
use crate::corpus::CorpusEntry;
use crate::io::CancelToken;
use crate::mem::{MemError, SharedMem};
use crate::mutate::Mutator;
use crate::rpc::{FuzzArgs, MinimizeArgs};
use crate::{WORKER_EXIT_CODE, WORKER_SHARED_MEM_SIZE, WORKER_TIMEOUT_DURATION};
use nix::fcntl::{fcntl, FcntlArg};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{dup2, Pid};
use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Command, ExitStatus};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// A fuzz request from the scheduling loop.
#[derive(Debug, Clone)]
pub struct FuzzInput {
    pub entry: CorpusEntry,
    pub timeout: Duration,
    pub limit: i64,
    pub warmup: bool,
    pub coverage_data: Option<Vec<u8>>,
}

/// A minimize request from the scheduling loop.
#[derive(Debug, Clone)]
pub struct MinimizeInput {
    pub entry: CorpusEntry,
    pub crasher_msg: String,
    pub timeout: Duration,
    pub limit: i64,
    pub keep_coverage: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub enum WorkerTask {
    Fuzz(FuzzInput),
    Minimize(MinimizeInput),
}

/// Outcome handed back to the scheduling loop.
#[derive(Debug, Clone, Default)]
pub struct FuzzResult {
    pub entry: CorpusEntry,
    /// Non-empty when the entry crashed the fuzz function or the worker.
    pub crasher_msg: String,
    pub coverage_data: Option<Vec<u8>>,
    pub can_minimize: bool,
    pub limit: i64,
    pub count: i64,
    pub total_duration: Duration,
    pub entry_duration: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    /// Cap on a single minimize request. Zero means no cap.
    pub minimize_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("fuzzing cancelled")]
    Cancelled,
    #[error("fuzzing process interrupted")]
    Interrupted,
    #[error("fuzzing process terminated without fuzzing: {0}")]
    StartFailed(String),
    #[error("communicating with fuzzing process: {0}")]
    Comm(String),
    #[error("fuzzing process exited unexpectedly due to an internal failure: {0}")]
    InternalFailure(String),
    #[error("fuzzing process terminated unexpectedly: {0}")]
    TerminatedUnexpectedly(String),
    #[error("fuzzing process terminated by unexpected signal; no crash will be recorded: {0}")]
    UnexpectedSignal(String),
    #[error("fuzzing process terminated unexpectedly while minimizing: {0}")]
    MinimizeTerminated(String),
    #[error("attempted to minimize but could not reproduce")]
    CouldNotReproduce,
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("shared memory: {0}")]
    Mem(#[from] MemError),
}

/// Latch closed exactly once when the child exits; the waiter thread stores
/// the exit status before closing it.
struct TermLatch {
    state: Mutex<LatchState>,
    cond: Condvar,
}

#[derive(Default)]
struct LatchState {
    done: bool,
    status: Option<ExitStatus>,
}

impl TermLatch {
    fn new() -> TermLatch {
        TermLatch {
            state: Mutex::new(LatchState::default()),
            cond: Condvar::new(),
        }
    }

    fn complete(&self, status: Option<ExitStatus>) {
        let mut state = self.state.lock().unwrap();
        state.done = true;
        state.status = status;
        drop(state);
        self.cond.notify_all();
    }

    fn is_done(&self) -> bool {
        self.state.lock().unwrap().done
    }

    fn status(&self) -> Option<ExitStatus> {
        self.state.lock().unwrap().status
    }

    /// True if the child terminated within `timeout`.
    fn wait_timeout(&self, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap();
        let (state, _) = self
            .cond
            .wait_timeout_while(state, timeout, |s| !s.done)
            .unwrap();
        state.done
    }
}

static WORKER_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct Worker {
    bin_path: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    opts: WorkerOptions,

    mem: Arc<MemSlot>,
    mem_id: String,

    pid: Option<Pid>,
    client: Option<Arc<WorkerClient>>,
    term: Option<Arc<TermLatch>>,
    /// Set when `stop` had to signal the child itself.
    interrupted: bool,
}

impl Worker {
    /// Allocates the worker's shared-memory region and records how to spawn
    /// its process. The process itself starts lazily in `coordinate`.
    pub fn new(
        bin_path: impl Into<PathBuf>,
        args: Vec<String>,
        envs: Vec<(String, String)>,
        opts: WorkerOptions,
    ) -> Result<Worker, WorkerError> {
        let seq = WORKER_SEQ.fetch_add(1, Ordering::Relaxed);
        let mem_id = format!("fuzzrig-shm-{}-{}", std::process::id(), seq);
        let mem = SharedMem::create(&mem_id, WORKER_SHARED_MEM_SIZE)?;
        Ok(Worker {
            bin_path: bin_path.into(),
            args,
            envs,
            opts,
            mem: Arc::new(MemSlot::new(mem)),
            mem_id,
            pid: None,
            client: None,
            term: None,
            interrupted: false,
        })
    }

    pub fn is_running(&self) -> bool {
        self.pid.is_some()
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }

    fn wait_status(&self) -> Option<ExitStatus> {
        self.term.as_ref().and_then(|t| t.status())
    }

    /// Releases the shared-memory region. In-flight RPCs observe the closed
    /// slot and bail out with the suppressed sentinel.
    pub fn cleanup(&mut self) {
        drop(self.mem.close());
    }

    /// Spawns the worker process with the pipe ends on fixed descriptors and
    /// the shared-memory id in the environment. After a successful return,
    /// `stop` must be called eventually, even if the process dies on its own.
    pub fn start(&mut self) -> Result<(), WorkerError> {
        assert!(!self.is_running(), "worker already started");
        self.interrupted = false;

        // The coordinator writes in_w and reads out_r; the worker inherits
        // in_r and out_w, and the coordinator forgets those after spawning.
        let (in_r, in_w) = os_pipe::pipe()?;
        let (out_r, out_w) = os_pipe::pipe()?;

        let mut cmd = Command::new(&self.bin_path);
        cmd.args(&self.args);
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }
        cmd.env(
            WORKER_COMM_ENV,
            worker_env_value(&self.mem_id, WORKER_SHARED_MEM_SIZE),
        );

        let in_fd = in_r.as_raw_fd();
        let out_fd = out_w.as_raw_fd();
        unsafe {
            cmd.pre_exec(move || {
                // Re-home the inherited pipe ends onto the fixed descriptors.
                // F_DUPFD first: the copies carry no close-on-exec flag, and a
                // source fd that already sits at 3 or 4 cannot be clobbered
                // before it has been duplicated.
                let in_tmp = fcntl(in_fd, FcntlArg::F_DUPFD(16)).map_err(errno_io)?;
                let out_tmp = fcntl(out_fd, FcntlArg::F_DUPFD(16)).map_err(errno_io)?;
                dup2(in_tmp, WORKER_FUZZ_IN_FD).map_err(errno_io)?;
                dup2(out_tmp, WORKER_FUZZ_OUT_FD).map_err(errno_io)?;
                Ok(())
            });
        }

        let mut child = cmd.spawn()?;
        let pid = Pid::from_raw(child.id() as i32);
        drop(in_r);
        drop(out_w);

        let term = Arc::new(TermLatch::new());
        let waiter = Arc::clone(&term);
        thread::Builder::new()
            .name("fuzzrig-wait".into())
            .spawn(move || {
                let status = child.wait().ok();
                waiter.complete(status);
            })?;

        let comm = WorkerComm {
            fuzz_in: unsafe { File::from_raw_fd(in_w.into_raw_fd()) },
            fuzz_out: unsafe { File::from_raw_fd(out_r.into_raw_fd()) },
            mem: Arc::clone(&self.mem),
        };
        self.client = Some(Arc::new(WorkerClient::new(comm, Mutator::new())));
        self.pid = Some(pid);
        self.term = Some(term);
        Ok(())
    }

    /// Starts the worker and confirms it reached the RPC loop. Failures here
    /// never record crashers: they mean the binary did not enter the fuzz
    /// loop at all.
    pub fn start_and_ping(&mut self, token: &CancelToken) -> Result<(), WorkerError> {
        if token.is_cancelled() {
            return Err(WorkerError::Cancelled);
        }
        self.start()?;
        let client = self.client.clone().expect("running worker without a client");
        if let Err(e) = client.ping(token) {
            self.stop();
            if token.is_cancelled() {
                return Err(WorkerError::Cancelled);
            }
            if self.wait_status().map_or(false, is_interrupt) {
                // User may have pressed ^C before the worker replied.
                return Err(WorkerError::Interrupted);
            }
            return Err(WorkerError::StartFailed(e.to_string()));
        }
        Ok(())
    }

    /// Tells the worker to exit by closing its call pipe, then waits for it,
    /// escalating with signals if it lingers. Returns the exit status the
    /// waiter observed, if any.
    pub fn stop(&mut self) -> Option<ExitStatus> {
        let term = self
            .term
            .clone()
            .expect("worker was not started successfully");

        if term.is_done() {
            // Already terminated, possibly unexpectedly.
            if let Some(client) = self.client.take() {
                let _ = client.close();
            }
            self.pid = None;
            return term.status();
        }

        let client = match self.client.take() {
            Some(c) => c,
            None => {
                while !term.wait_timeout(WORKER_TIMEOUT_DURATION) {}
                self.pid = None;
                return term.status();
            }
        };
        // Closing the client signals end-of-calls via EOF on fuzz_in, but it
        // also drains fuzz_out until the worker hangs up, so it runs off to
        // the side while the signal ladder escalates.
        let closer = thread::spawn(move || {
            let _ = client.close();
        });

        let pid = self.pid.expect("running worker without a pid");
        let mut sig = Some(Signal::SIGINT);
        loop {
            if term.wait_timeout(WORKER_TIMEOUT_DURATION) {
                break;
            }
            self.interrupted = true;
            match sig {
                Some(Signal::SIGINT) => {
                    let _ = kill(pid, Signal::SIGINT);
                    sig = Some(Signal::SIGKILL);
                }
                Some(_) => {
                    let _ = kill(pid, Signal::SIGKILL);
                    sig = None;
                }
                None => {
                    log::warn!("waiting for fuzzing process to terminate...");
                }
            }
        }
        let _ = closer.join();
        self.pid = None;
        term.status()
    }

    /// Main supervision loop: keeps a worker alive, relays tasks to it and
    /// results back, and classifies terminations. Returns when cancelled, when
    /// the task channel closes, or on an error the scheduler must see.
    pub fn coordinate(
        &mut self,
        token: &CancelToken,
        tasks: &Receiver<WorkerTask>,
        results: &Sender<FuzzResult>,
    ) -> Result<(), WorkerError> {
        loop {
            if !self.is_running() {
                self.start_and_ping(token)?;
            }

            if token.is_cancelled() {
                if let Some(st) = self.stop() {
                    if !st.success() && !self.interrupted && !is_interrupt(st) {
                        return Err(WorkerError::TerminatedUnexpectedly(st.to_string()));
                    }
                }
                return Err(WorkerError::Cancelled);
            }

            if self.term.as_ref().map_or(false, |t| t.is_done()) {
                // Terminated while idle.
                let status = self.stop();
                assert!(
                    !self.interrupted,
                    "worker interrupted after unexpected termination"
                );
                return match status {
                    // Exited cleanly, or saw a user signal before we did;
                    // suppress either way.
                    None => Ok(()),
                    Some(st) if st.success() || is_interrupt(st) => Ok(()),
                    Some(st) if st.code() == Some(WORKER_EXIT_CODE) => {
                        Err(WorkerError::InternalFailure(st.to_string()))
                    }
                    Some(st) => Err(WorkerError::TerminatedUnexpectedly(st.to_string())),
                };
            }

            let task = match tasks.recv_timeout(Duration::from_millis(50)) {
                Ok(task) => task,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    // Scheduler went away; wind the worker down.
                    self.stop();
                    return Ok(());
                }
            };
            match task {
                WorkerTask::Fuzz(input) => self.run_fuzz(token, input, results)?,
                WorkerTask::Minimize(input) => self.run_minimize(token, input, results),
            }
        }
    }

    fn run_fuzz(
        &mut self,
        token: &CancelToken,
        input: FuzzInput,
        results: &Sender<FuzzResult>,
    ) -> Result<(), WorkerError> {
        let args = FuzzArgs {
            timeout: input.timeout,
            limit: input.limit,
            warmup: input.warmup,
            coverage_data: input.coverage_data.clone(),
        };
        let client = self.client.clone().expect("running worker without a client");
        let (entry, mut resp, call_err) = client.fuzz(token, &input.entry, args);
        let mut can_minimize = true;
        if let Some(err) = call_err {
            self.stop();
            if token.is_cancelled() {
                return Err(WorkerError::Cancelled);
            }
            if self.interrupted {
                // Communication broke because we stopped the worker
                // ourselves. Report it, but record no crasher.
                return Err(WorkerError::Comm(err.to_string()));
            }
            match self.wait_status() {
                // Exited cleanly or observed a user signal first; I/O errors
                // around interrupts are expected, so stay silent.
                None => return Ok(()),
                Some(st) if st.success() || is_interrupt(st) => return Ok(()),
                Some(st) => {
                    if let Some(sig) = st.signal() {
                        if !is_crash_signal(sig) {
                            // OOM kill, terminal hangup and friends: probably
                            // not caused by this input.
                            return Err(WorkerError::UnexpectedSignal(st.to_string()));
                        }
                    }
                    // The input crashed the worker process itself. Surface it;
                    // minimizing would just crash the next worker.
                    resp.err = format!("fuzzing process terminated unexpectedly: {}", st);
                    can_minimize = false;
                }
            }
        }
        let result = FuzzResult {
            entry,
            crasher_msg: resp.err,
            coverage_data: resp.coverage_data,
            can_minimize,
            limit: input.limit,
            count: resp.count,
            total_duration: resp.total_duration,
            entry_duration: resp.interesting_duration,
        };
        let _ = results.send(result);
        Ok(())
    }

    fn run_minimize(
        &mut self,
        token: &CancelToken,
        input: MinimizeInput,
        results: &Sender<FuzzResult>,
    ) {
        let result = match self.minimize_entry(token, &input) {
            Ok(result) => result,
            Err(e) => {
                // Could not minimize. Send back the original input; if it
                // didn't error before, report it as erroring now.
                let mut crasher_msg = input.crasher_msg.clone();
                if crasher_msg.is_empty() {
                    crasher_msg = e.to_string();
                }
                FuzzResult {
                    entry: input.entry,
                    crasher_msg,
                    can_minimize: false,
                    limit: input.limit,
                    ..Default::default()
                }
            }
        };
        let _ = results.send(result);
    }

    fn minimize_entry(
        &mut self,
        token: &CancelToken,
        input: &MinimizeInput,
    ) -> Result<FuzzResult, WorkerError> {
        let token = if self.opts.minimize_timeout > Duration::ZERO {
            token.child_with_timeout(self.opts.minimize_timeout)
        } else {
            token.clone()
        };
        let args = MinimizeArgs {
            timeout: input.timeout,
            limit: input.limit,
            keep_coverage: input.keep_coverage.clone(),
        };
        let client = self.client.clone().expect("running worker without a client");
        let (entry, resp, call_err) = client.minimize(&token, &input.entry, args);
        if call_err.is_some() {
            self.stop();
            let wait_quiet = self
                .wait_status()
                .map_or(true, |st| st.success() || is_interrupt(st));
            if token.is_cancelled() || self.interrupted || wait_quiet {
                // Interrupted mid-minimize, probably by the user. Hand the
                // original crasher back without noise.
                return Ok(FuzzResult {
                    entry: input.entry.clone(),
                    crasher_msg: input.crasher_msg.clone(),
                    coverage_data: input.keep_coverage.clone(),
                    can_minimize: false,
                    limit: input.limit,
                    ..Default::default()
                });
            }
            let status = self
                .wait_status()
                .map(|st| st.to_string())
                .unwrap_or_else(|| "no exit status".to_string());
            return Err(WorkerError::MinimizeTerminated(status));
        }
        if !input.crasher_msg.is_empty() && resp.err.is_empty() && !resp.success {
            return Err(WorkerError::CouldNotReproduce);
        }
        Ok(FuzzResult {
            entry,
            crasher_msg: resp.err,
            coverage_data: resp.coverage_data,
            can_minimize: false,
            limit: input.limit,
            count: resp.count,
            total_duration: resp.duration,
            entry_duration: Duration::ZERO,
        })
    }
}

fn errno_io(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

fn is_interrupt(status: ExitStatus) -> bool {
    status.signal() == Some(Signal::SIGINT as i32)
}

/// Whether a termination signal was plausibly caused by the input under test
/// rather than by the environment (OOM killer, closed terminal, ...).
fn is_crash_signal(sig: i32) -> bool {
    matches!(
        Signal::try_from(sig),
        Ok(Signal::SIGILL)
            | Ok(Signal::SIGTRAP)
            | Ok(Signal::SIGABRT)
            | Ok(Signal::SIGBUS)
            | Ok(Signal::SIGFPE)
            | Ok(Signal::SIGSEGV)
            | Ok(Signal::SIGSYS)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_signal_classification() {
        assert!(is_crash_signal(Signal::SIGSEGV as i32));
        assert!(is_crash_signal(Signal::SIGABRT as i32));
        assert!(!is_crash_signal(Signal::SIGKILL as i32));
        assert!(!is_crash_signal(Signal::SIGHUP as i32));
        assert!(!is_crash_signal(Signal::SIGINT as i32));
        assert!(!is_crash_signal(0));
    }

    #[test]
    fn term_latch_completes_once() {
        let latch = TermLatch::new();
        assert!(!latch.is_done());
        assert!(!latch.wait_timeout(Duration::from_millis(10)));
        latch.complete(None);
        assert!(latch.is_done());
        assert!(latch.wait_timeout(Duration::from_millis(10)));
        assert!(latch.status().is_none());
    }
}

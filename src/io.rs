//! Cancellation-aware pipe reading.
//!
//! Closing a pipe descriptor in one process does not reliably unblock a
//! reader in another once the descriptor has been inherited around, so every
//! blocking read here is issued on a background runtime and raced against a
//! cancellation token. A read abandoned by cancellation may stay pending;
//! the descriptor is closed elsewhere (or the process signalled) to finish it.
use bytes::BytesMut;
use std::fs::File;
use std::future::pending;
use std::io::{self, Read};
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{mpsc, Arc, Barrier, OnceLock};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::Notify;

static RUNTIME: OnceLock<Runtime> = OnceLock::new();
static RUNTIME_INIT: std::sync::Once = std::sync::Once::new();

/// Lazily started current-thread runtime, parked on a background thread.
/// All background reads and timers in the crate run here.
pub(crate) fn runtime() -> &'static Runtime {
    RUNTIME_INIT.call_once(|| {
        let rt = Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to init background runtime");
        if RUNTIME.set(rt).is_err() {
            unreachable!("background runtime initialized twice");
        }
        let barrier = Arc::new(Barrier::new(2));
        let barrier1 = Arc::clone(&barrier);
        std::thread::Builder::new()
            .name("fuzzrig-bg".into())
            .spawn(move || {
                // A current-thread runtime only makes progress while someone
                // blocks on it; this thread takes the job of polling forever.
                RUNTIME.get().unwrap().block_on(async move {
                    barrier1.wait();
                    pending::<()>().await
                })
            })
            .expect("failed to spawn background io thread");
        // Do not hand the runtime out before the background thread owns it.
        barrier.wait();
        log::debug!("background io initialized");
    });
    RUNTIME.get().unwrap()
}

/// Cooperative cancellation token, cloneable across threads and tasks.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// A token that cancels when `self` does, or after `timeout`, whichever
    /// comes first.
    pub fn child_with_timeout(&self, timeout: Duration) -> CancelToken {
        let child = CancelToken::new();
        let parent = self.clone();
        let child2 = child.clone();
        runtime().spawn(async move {
            tokio::select! {
                _ = parent.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {}
            }
            child2.cancel();
        });
        child
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken::new()
    }
}

pub(crate) fn cancelled_error() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "fuzzing operation cancelled")
}

enum ReadEvent {
    Data(Vec<u8>),
    Err(io::Error),
    Eof,
}

/// Owns the read end of a pipe and pumps its bytes from a background task
/// into a channel. Reads through [`ContextReader`] drain the channel so they
/// can give up on cancellation while the underlying read stays pending.
pub struct BackgroundReader {
    rx: Receiver<ReadEvent>,
    buf: BytesMut,
    eof: bool,
}

/// Starts pumping `f` in the background. Mirrors the read side of a spawned
/// worker: the task lives until the peer closes its end of the pipe.
pub fn read_background<T: IntoRawFd>(f: T) -> BackgroundReader {
    let fd = f.into_raw_fd();
    let f = unsafe { File::from_raw_fd(fd) };
    let mut f = tokio::fs::File::from_std(f);
    let (tx, rx): (Sender<ReadEvent>, Receiver<ReadEvent>) = mpsc::channel();

    runtime().spawn(async move {
        let mut chunk = [0u8; 4096];
        loop {
            match f.read(&mut chunk).await {
                Ok(0) => {
                    let _ = tx.send(ReadEvent::Eof);
                    break;
                }
                Ok(n) => {
                    if tx.send(ReadEvent::Data(chunk[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(ReadEvent::Err(e));
                    break;
                }
            }
        }
    });

    BackgroundReader {
        rx,
        buf: BytesMut::with_capacity(4096),
        eof: false,
    }
}

impl BackgroundReader {
    fn read(&mut self, token: &CancelToken, out: &mut [u8]) -> io::Result<usize> {
        loop {
            if !self.buf.is_empty() {
                let n = out.len().min(self.buf.len());
                out[..n].copy_from_slice(&self.buf.split_to(n));
                return Ok(n);
            }
            if self.eof {
                return Ok(0);
            }
            if token.is_cancelled() {
                return Err(cancelled_error());
            }
            match self.rx.recv_timeout(Duration::from_millis(20)) {
                Ok(ReadEvent::Data(d)) => self.buf.extend_from_slice(&d),
                Ok(ReadEvent::Eof) => self.eof = true,
                Ok(ReadEvent::Err(e)) => return Err(e),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => self.eof = true,
            }
        }
    }

    /// Consumes everything until EOF, discarding it. Used when shutting a
    /// worker down to avoid a SIGPIPE on its side.
    pub fn drain(&mut self) -> io::Result<()> {
        loop {
            if self.eof {
                return Ok(());
            }
            match self.rx.recv() {
                Ok(ReadEvent::Data(_)) => {}
                Ok(ReadEvent::Eof) | Err(_) => self.eof = true,
                Ok(ReadEvent::Err(e)) => return Err(e),
            }
        }
    }
}

/// A `Read` adapter over [`BackgroundReader`] bound to one cancellation
/// token. If the token fires while a read is blocked, the read returns
/// immediately with an error; buffered bytes are preserved for later reads.
pub struct ContextReader<'a> {
    reader: &'a mut BackgroundReader,
    token: CancelToken,
}

impl<'a> ContextReader<'a> {
    pub fn new(reader: &'a mut BackgroundReader, token: CancelToken) -> ContextReader<'a> {
        ContextReader { reader, token }
    }
}

impl Read for ContextReader<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        self.reader.read(&self.token, out)
    }
}

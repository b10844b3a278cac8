//! Coordinator↔worker core of a coverage-guided fuzzer for compiled test
//! binaries.
//!
//! A coordinator process supervises worker processes over a pair of inherited
//! pipes and a shared-memory region. Workers run mutated inputs against a
//! user-supplied test function, report crashes and coverage, and can be told
//! to minimize an interesting input. Input mutation scheduling, the corpus on
//! disk and coverage instrumentation live outside this crate; only the
//! contracts the core consumes are defined here.
use std::time::Duration;

pub mod client;
pub mod comm;
pub mod corpus;
pub mod coverage;
pub mod io;
pub mod mem;
pub mod minimize;
pub mod mutate;
pub mod rng;
pub mod rpc;
pub mod server;
pub mod value;
pub mod worker;

pub use client::{ClientError, WorkerClient};
pub use comm::{get_worker_comm, is_worker_process, MemSlot, SharedMemClosed, WorkerComm};
pub use corpus::{entry_path, marshal_values, unmarshal_values, CorpusEntry};
pub use coverage::{CoverageSource, NoCoverage};
pub use io::CancelToken;
pub use mem::{SharedMem, SharedMemHeader};
pub use mutate::Mutator;
pub use rng::PcgRng;
pub use server::{run_fuzz_worker, ServeError, UserError, WorkerServer};
pub use value::Value;
pub use worker::{
    FuzzInput, FuzzResult, MinimizeInput, Worker, WorkerError, WorkerOptions, WorkerTask,
};

/// Coordinator-side budget hint for one fuzz batch.
pub const WORKER_FUZZ_DURATION: Duration = Duration::from_millis(100);

/// Interval between signal escalations while stopping a worker.
pub const WORKER_TIMEOUT_DURATION: Duration = Duration::from_secs(1);

/// Size of the shared-memory region; bounds the size of fuzz inputs.
pub const WORKER_SHARED_MEM_SIZE: usize = 100 << 20;

/// Exit code a worker uses when the fuzz entry point was misused, e.g. the
/// test declared failure before entering the fuzz loop. Distinguishes
/// internal errors from input-caused crashes.
pub const WORKER_EXIT_CODE: i32 = 70;

//! Client/server RPC scenarios run in-process: the worker server runs on a
//! thread with its own mapping of the shared region, exactly as it would in a
//! child process, minus the exec.
use fuzzrig::comm::{MemSlot, WorkerComm};
use fuzzrig::corpus::{entry_path, marshal_values, CorpusEntry};
use fuzzrig::coverage::{CoverageSource, NoCoverage};
use fuzzrig::io::CancelToken;
use fuzzrig::mem::SharedMem;
use fuzzrig::mutate::Mutator;
use fuzzrig::rpc::{FuzzArgs, MinimizeArgs};
use fuzzrig::server::{UserError, WorkerServer};
use fuzzrig::value::Value;
use fuzzrig::{ClientError, WorkerClient};
use std::fs::File;
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const TEST_MEM_SIZE: usize = 1 << 20;

fn file<T: IntoRawFd>(f: T) -> File {
    unsafe { File::from_raw_fd(f.into_raw_fd()) }
}

/// Two views of one worker channel: the coordinator side and the worker side,
/// each with its own mapping of the same region.
fn comm_pair(tag: &str) -> (WorkerComm, WorkerComm) {
    let os_id = format!("fuzzrig-test-rpc-{}-{}", tag, std::process::id());
    let coord_mem = SharedMem::create(&os_id, TEST_MEM_SIZE).unwrap();
    let worker_mem = SharedMem::open(&os_id).unwrap();
    let (in_r, in_w) = os_pipe::pipe().unwrap();
    let (out_r, out_w) = os_pipe::pipe().unwrap();
    let coordinator = WorkerComm {
        fuzz_in: file(in_w),
        fuzz_out: file(out_r),
        mem: Arc::new(MemSlot::new(coord_mem)),
    };
    let worker = WorkerComm {
        fuzz_in: file(in_r),
        fuzz_out: file(out_w),
        mem: Arc::new(MemSlot::new(worker_mem)),
    };
    (coordinator, worker)
}

struct ScriptedCoverage(Vec<u8>);

impl CoverageSource for ScriptedCoverage {
    fn snapshot(&mut self) -> Vec<u8> {
        self.0.clone()
    }
}

fn spawn_server<F, C>(comm: WorkerComm, fuzz_fn: F, coverage: C) -> JoinHandle<()>
where
    F: FnMut(&CorpusEntry) -> Result<(), UserError> + Send + 'static,
    C: CoverageSource + 'static,
{
    thread::spawn(move || {
        let server = WorkerServer::new(comm, fuzz_fn, coverage);
        server.serve(&CancelToken::new()).unwrap();
    })
}

#[test]
fn ping_round_trip() {
    let (coord, worker) = comm_pair("ping");
    let server = spawn_server(worker, |_| Ok(()), NoCoverage);
    let client = WorkerClient::new(coord, Mutator::new());
    let token = CancelToken::new();
    let start = Instant::now();
    client.ping(&token).unwrap();
    assert!(start.elapsed() < Duration::from_secs(1));
    client.close().unwrap();
    server.join().unwrap();
}

#[test]
fn warmup_crash_names_the_input() {
    let (coord, worker) = comm_pair("warmup-crash");
    let bad = CorpusEntry::from_values(vec![Value::Bytes(b"bad".to_vec())]);
    let calls = Arc::new(AtomicI64::new(0));
    let calls2 = Arc::clone(&calls);
    let server = spawn_server(
        worker,
        move |entry| {
            calls2.fetch_add(1, Ordering::SeqCst);
            match entry.values.as_deref() {
                Some([Value::Bytes(b)]) if b == b"bad" => Err("boom".into()),
                _ => Ok(()),
            }
        },
        NoCoverage,
    );
    let client = WorkerClient::new(coord, Mutator::new());
    let token = CancelToken::new();

    let args = FuzzArgs {
        warmup: true,
        ..Default::default()
    };
    let (entry_out, resp, err) = client.fuzz(&token, &bad, args);
    assert!(err.is_none());
    assert_eq!(resp.err, "boom");
    assert_eq!(resp.count, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1, "warmup must run exactly once");
    assert_eq!(entry_out.path, entry_path(&bad.data));
    assert_eq!(entry_out.generation, bad.generation + 1);
    assert!(entry_out.is_seed, "warmup carries seed-ness through");

    client.close().unwrap();
    server.join().unwrap();
}

#[test]
fn crash_reconstruction_replays_mutations() {
    let (coord, worker) = comm_pair("crash-replay");
    let seed = CorpusEntry::from_values(vec![Value::Bytes(vec![1, 2, 3, 4])]);
    let original = seed.values.clone().unwrap();
    let seen = Arc::new(Mutex::new(None::<Vec<Value>>));
    let seen2 = Arc::clone(&seen);
    let server = spawn_server(
        worker,
        move |entry| {
            let vals = entry.values.clone().unwrap();
            if vals != original {
                *seen2.lock().unwrap() = Some(vals);
                return Err("boom".into());
            }
            Ok(())
        },
        NoCoverage,
    );
    let client = WorkerClient::new(coord, Mutator::new());
    let token = CancelToken::new();

    let (entry_out, resp, err) = client.fuzz(&token, &seed, FuzzArgs::default());
    assert!(err.is_none());
    assert_eq!(resp.err, "boom");
    assert!(resp.count >= 1);

    let crashing = seen.lock().unwrap().clone().expect("no crashing values captured");
    assert_eq!(
        entry_out.values.as_deref(),
        Some(crashing.as_slice()),
        "client must reconstruct the exact crashing values"
    );
    assert_eq!(entry_out.data, marshal_values(&crashing));
    assert_eq!(entry_out.path, entry_path(&entry_out.data));
    assert_eq!(entry_out.parent, seed.path);
    assert_eq!(entry_out.generation, seed.generation + 1);
    assert!(!entry_out.is_seed);

    client.close().unwrap();
    server.join().unwrap();
}

#[test]
fn limit_bounds_the_run() {
    let (coord, worker) = comm_pair("limit");
    let seed = CorpusEntry::from_values(vec![Value::U32(0)]);
    let calls = Arc::new(AtomicI64::new(0));
    let calls2 = Arc::clone(&calls);
    let server = spawn_server(
        worker,
        move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
        NoCoverage,
    );
    let client = WorkerClient::new(coord, Mutator::new());
    let token = CancelToken::new();

    let args = FuzzArgs {
        limit: 10,
        ..Default::default()
    };
    let (entry_out, resp, err) = client.fuzz(&token, &seed, args);
    assert!(err.is_none());
    assert!(resp.err.is_empty());
    assert_eq!(resp.count, 10);
    assert_eq!(calls.load(Ordering::SeqCst), 10);
    // nothing interesting happened, so the input comes back unchanged
    assert_eq!(entry_out, seed);

    client.close().unwrap();
    server.join().unwrap();
}

#[test]
fn new_coverage_is_deflaked_and_reported() {
    let (coord, worker) = comm_pair("coverage");
    let seed = CorpusEntry::from_values(vec![Value::Bytes(vec![9, 9, 9, 9])]);
    let calls = Arc::new(AtomicI64::new(0));
    let calls2 = Arc::clone(&calls);
    let seen = Arc::new(Mutex::new(None::<Vec<Value>>));
    let seen2 = Arc::clone(&seen);
    let server = spawn_server(
        worker,
        move |entry| {
            calls2.fetch_add(1, Ordering::SeqCst);
            *seen2.lock().unwrap() = entry.values.clone();
            Ok(())
        },
        ScriptedCoverage(vec![0b0000_0001]),
    );
    let client = WorkerClient::new(coord, Mutator::new());
    let token = CancelToken::new();

    let args = FuzzArgs {
        coverage_data: Some(vec![0]),
        ..Default::default()
    };
    let (entry_out, resp, err) = client.fuzz(&token, &seed, args);
    assert!(err.is_none());
    assert_eq!(resp.coverage_data, Some(vec![0b0000_0001]));
    assert!(resp.interesting_duration >= Duration::ZERO);
    assert_eq!(resp.count, 1, "deflake re-run must not count");
    assert_eq!(calls.load(Ordering::SeqCst), 2, "one mutation plus one deflake");

    let interesting = seen.lock().unwrap().clone().unwrap();
    assert_eq!(entry_out.values.as_deref(), Some(interesting.as_slice()));
    assert_eq!(entry_out.generation, seed.generation + 1);

    client.close().unwrap();
    server.join().unwrap();
}

#[test]
fn minimize_preserves_crash_on_prefixes() {
    let (coord, worker) = comm_pair("minimize-crash");
    let seed = CorpusEntry::from_values(vec![Value::Bytes(vec![0, 1, 2, 3, 4, 5])]);
    let server = spawn_server(
        worker,
        |entry| match entry.values.as_deref() {
            Some([Value::Bytes(b)]) if !b.is_empty() && [0, 1, 2, 3, 4, 5].starts_with(b) => {
                Err("len".into())
            }
            _ => Ok(()),
        },
        NoCoverage,
    );
    let client = WorkerClient::new(coord, Mutator::new());
    let token = CancelToken::new();

    let (entry_out, resp, err) = client.minimize(&token, &seed, MinimizeArgs::default());
    assert!(err.is_none());
    assert!(resp.success);
    assert_eq!(resp.err, "len", "shrunken value must still produce the crash");
    assert_eq!(entry_out.values.as_deref(), Some(&[Value::Bytes(vec![0])][..]));
    assert_eq!(entry_out.path, entry_path(&entry_out.data));
    assert_eq!(entry_out.generation, seed.generation, "minimize keeps generation");
    assert_eq!(entry_out.parent, seed.parent);

    client.close().unwrap();
    server.join().unwrap();
}

#[test]
fn minimize_preserves_coverage_without_error() {
    let (coord, worker) = comm_pair("minimize-cov");
    let seed = CorpusEntry::from_values(vec![Value::Bytes(vec![5, 5, 5, 5])]);
    let server = spawn_server(worker, |_| Ok(()), ScriptedCoverage(vec![0b10]));
    let client = WorkerClient::new(coord, Mutator::new());
    let token = CancelToken::new();

    let args = MinimizeArgs {
        keep_coverage: Some(vec![0b10]),
        ..Default::default()
    };
    let (entry_out, resp, err) = client.minimize(&token, &seed, args);
    assert!(err.is_none());
    assert!(resp.success);
    assert!(resp.err.is_empty());
    assert_eq!(resp.coverage_data, Some(vec![0b10]));
    // everything keeps the bit, so the value shrinks to a single simplified byte
    assert_eq!(entry_out.values.as_deref(), Some(&[Value::Bytes(vec![b'0'])][..]));

    client.close().unwrap();
    server.join().unwrap();
}

#[test]
fn minimize_flake_reports_failure() {
    let (coord, worker) = comm_pair("minimize-flake");
    let seed = CorpusEntry::from_values(vec![Value::Bytes(vec![1])]);
    // crash-preserving minimize of an input that does not error
    let server = spawn_server(worker, |_| Ok(()), NoCoverage);
    let client = WorkerClient::new(coord, Mutator::new());
    let token = CancelToken::new();

    let (entry_out, resp, err) = client.minimize(&token, &seed, MinimizeArgs::default());
    assert!(err.is_none());
    assert!(!resp.success);
    assert!(resp.err.is_empty());
    assert_eq!(entry_out, seed, "failed minimize returns the original entry");

    client.close().unwrap();
    server.join().unwrap();
}

#[test]
fn cancellation_mid_fuzz_returns_promptly() {
    let (coord, worker) = comm_pair("cancel");
    let seed = CorpusEntry::from_values(vec![Value::Bytes(vec![1, 2, 3])]);
    let calls = Arc::new(AtomicI64::new(0));
    let calls2 = Arc::clone(&calls);
    let server = spawn_server(
        worker,
        move |_| {
            calls2.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(1));
            Ok(())
        },
        NoCoverage,
    );
    let client = WorkerClient::new(coord, Mutator::new());
    let token = CancelToken::new();
    let canceller = token.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        canceller.cancel();
    });

    let args = FuzzArgs {
        timeout: Duration::from_millis(400),
        ..Default::default()
    };
    let start = Instant::now();
    let (_entry, resp, err) = client.fuzz(&token, &seed, args);
    assert!(
        matches!(err, Some(ClientError::Cancelled)),
        "expected cancellation, got {:?}",
        err
    );
    assert!(start.elapsed() < Duration::from_millis(350));
    assert!(resp.count > 0, "at least one iteration ran before the cancel");
    assert!(resp.err.is_empty());
    assert!(calls.load(Ordering::SeqCst) > 0);

    // the worker keeps fuzzing until its own timeout, then exits on EOF
    client.close().unwrap();
    server.join().unwrap();
}

#[test]
fn closed_shared_memory_is_a_sentinel_error() {
    let (coord, worker) = comm_pair("closed-mem");
    let slot = Arc::clone(&coord.mem);
    let seed = CorpusEntry::from_values(vec![Value::U8(1)]);
    let server = spawn_server(worker, |_| Ok(()), NoCoverage);
    let client = WorkerClient::new(coord, Mutator::new());
    let token = CancelToken::new();

    // cleanup races the next call: the coordinator-side slot closes while the
    // worker's own mapping stays put
    slot.close();
    let (_entry, _resp, err) = client.fuzz(&token, &seed, FuzzArgs::default());
    assert!(matches!(err, Some(ClientError::SharedMemClosed(_))));

    client.close().unwrap();
    server.join().unwrap();
}

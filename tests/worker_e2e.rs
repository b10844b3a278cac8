//! End-to-end supervision scenarios against real worker processes.
//!
//! This harness re-executes itself: when the supervisor spawns
//! `current_exe()` the child sees the worker environment variable and drops
//! into `worker_child` instead of running the scenarios. `FUZZRIG_TEST_MODE`
//! selects how the child misbehaves.
use anyhow::{bail, ensure, Context, Result};
use fuzzrig::coverage::NoCoverage;
use fuzzrig::io::CancelToken;
use fuzzrig::server::{run_fuzz_worker, UserError};
use fuzzrig::worker::{FuzzInput, FuzzResult, Worker, WorkerError, WorkerOptions, WorkerTask};
use fuzzrig::{CorpusEntry, Value};
use nix::sys::signal::{raise, Signal};
use std::os::unix::process::ExitStatusExt;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

const MODE_ENV: &str = "FUZZRIG_TEST_MODE";

fn main() -> Result<()> {
    if fuzzrig::is_worker_process() {
        return worker_child();
    }
    env_logger::init();

    ping_round_trip().context("ping_round_trip")?;
    input_crash_is_recorded().context("input_crash_is_recorded")?;
    internal_exit_code_is_classified().context("internal_exit_code_is_classified")?;
    external_kill_records_no_crasher().context("external_kill_records_no_crasher")?;
    stop_escalates_to_signals().context("stop_escalates_to_signals")?;

    println!("worker_e2e: all scenarios passed");
    Ok(())
}

fn worker_child() -> Result<()> {
    let mode = std::env::var(MODE_ENV).unwrap_or_default();
    match mode.as_str() {
        // Well-behaved worker: serves until the coordinator hangs up.
        "serve" => {
            run_fuzz_worker(|_| Ok(()), NoCoverage)?;
            Ok(())
        }
        // First input aborts the process, as a memory bug would.
        "abort" => {
            run_fuzz_worker(
                |_| -> std::result::Result<(), UserError> { std::process::abort() },
                NoCoverage,
            )?;
            Ok(())
        }
        // Dies from SIGKILL mid-call, like a visit from the OOM killer.
        "sigkill" => {
            run_fuzz_worker(
                |_| -> std::result::Result<(), UserError> {
                    let _ = raise(Signal::SIGKILL);
                    Ok(())
                },
                NoCoverage,
            )?;
            Ok(())
        }
        // Answers the ping, then exits with the reserved internal-error code
        // while idle, as a misused fuzz entry point does.
        "exit70" => {
            thread::spawn(|| {
                thread::sleep(Duration::from_millis(300));
                std::process::exit(fuzzrig::WORKER_EXIT_CODE);
            });
            run_fuzz_worker(|_| Ok(()), NoCoverage)?;
            Ok(())
        }
        // Never reaches the RPC loop and ignores the EOF on fuzz_in.
        "hang" => {
            thread::sleep(Duration::from_secs(60));
            Ok(())
        }
        other => bail!("unknown {} value {:?}", MODE_ENV, other),
    }
}

fn new_worker(mode: &str) -> Result<Worker> {
    let bin = std::env::current_exe()?;
    Ok(Worker::new(
        bin,
        Vec::new(),
        vec![(MODE_ENV.to_string(), mode.to_string())],
        WorkerOptions::default(),
    )?)
}

fn seed_entry() -> CorpusEntry {
    CorpusEntry::from_values(vec![Value::Bytes(vec![1, 2, 3])])
}

fn coordinate_in_background(
    mut worker: Worker,
    token: CancelToken,
) -> (
    mpsc::Sender<WorkerTask>,
    mpsc::Receiver<FuzzResult>,
    thread::JoinHandle<(std::result::Result<(), WorkerError>, Worker)>,
) {
    let (task_tx, task_rx) = mpsc::channel();
    let (res_tx, res_rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let ret = worker.coordinate(&token, &task_rx, &res_tx);
        (ret, worker)
    });
    (task_tx, res_rx, handle)
}

fn ping_round_trip() -> Result<()> {
    let mut worker = new_worker("serve")?;
    let token = CancelToken::new();
    let start = Instant::now();
    worker.start_and_ping(&token)?;
    ensure!(
        start.elapsed() < Duration::from_secs(1),
        "ping took {:?}",
        start.elapsed()
    );
    let status = worker.stop();
    ensure!(
        status.map_or(true, |st| st.success()),
        "worker should exit cleanly on close, got {:?}",
        status
    );
    worker.cleanup();
    Ok(())
}

fn input_crash_is_recorded() -> Result<()> {
    let worker = new_worker("abort")?;
    let token = CancelToken::new();
    let (task_tx, res_rx, handle) = coordinate_in_background(worker, token.clone());

    task_tx
        .send(WorkerTask::Fuzz(FuzzInput {
            entry: seed_entry(),
            timeout: Duration::ZERO,
            limit: 0,
            warmup: false,
            coverage_data: None,
        }))
        .unwrap();

    let result = res_rx
        .recv_timeout(Duration::from_secs(10))
        .context("no result from crashed worker")?;
    ensure!(
        result.crasher_msg.contains("terminated unexpectedly"),
        "unexpected crasher message: {:?}",
        result.crasher_msg
    );
    ensure!(!result.can_minimize, "process crashes cannot be minimized");

    token.cancel();
    let (ret, mut worker) = handle.join().unwrap();
    ensure!(
        matches!(ret, Err(WorkerError::Cancelled)),
        "coordinate should end on cancellation, got {:?}",
        ret
    );
    worker.cleanup();
    Ok(())
}

fn internal_exit_code_is_classified() -> Result<()> {
    let worker = new_worker("exit70")?;
    let token = CancelToken::new();
    let (task_tx, _res_rx, handle) = coordinate_in_background(worker, token);

    let (ret, mut worker) = handle.join().unwrap();
    ensure!(
        matches!(ret, Err(WorkerError::InternalFailure(_))),
        "exit code 70 should map to an internal failure, got {:?}",
        ret
    );
    drop(task_tx);
    worker.cleanup();
    Ok(())
}

fn external_kill_records_no_crasher() -> Result<()> {
    let worker = new_worker("sigkill")?;
    let token = CancelToken::new();
    let (task_tx, res_rx, handle) = coordinate_in_background(worker, token);

    task_tx
        .send(WorkerTask::Fuzz(FuzzInput {
            entry: seed_entry(),
            timeout: Duration::ZERO,
            limit: 0,
            warmup: false,
            coverage_data: None,
        }))
        .unwrap();

    let (ret, mut worker) = handle.join().unwrap();
    ensure!(
        matches!(ret, Err(WorkerError::UnexpectedSignal(_))),
        "SIGKILL is not a crash signal, got {:?}",
        ret
    );
    ensure!(
        res_rx.try_recv().is_err(),
        "no crasher may be recorded for a non-crash signal"
    );
    worker.cleanup();
    Ok(())
}

fn stop_escalates_to_signals() -> Result<()> {
    let mut worker = new_worker("hang")?;
    worker.start()?;
    // let the child settle into its sleep
    thread::sleep(Duration::from_millis(200));

    let start = Instant::now();
    let status = worker.stop();
    let elapsed = start.elapsed();

    ensure!(
        elapsed >= Duration::from_millis(800),
        "stop returned before the first escalation: {:?}",
        elapsed
    );
    ensure!(
        elapsed < Duration::from_millis(3500),
        "stop took too long against an interruptible child: {:?}",
        elapsed
    );
    ensure!(worker.is_interrupted(), "stop must record the escalation");
    let sig = status.and_then(|st| st.signal());
    ensure!(
        sig == Some(Signal::SIGINT as i32),
        "child should die from the interrupt, got {:?}",
        sig
    );
    worker.cleanup();
    Ok(())
}

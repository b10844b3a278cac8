//! In-worker RPC server.
//!
//! Runs inside the spawned test process. Calls arrive one at a time on
//! `fuzz_in`; responses go back on `fuzz_out` in order. Method errors travel
//! inside the serialized responses; only transport problems surface here.
use crate::comm::{get_worker_comm, CommError, MemSlot, WorkerComm};
use crate::corpus::{marshal_values, unmarshal_values, CorpusEntry};
use crate::coverage::{count_new_coverage_bits, has_coverage_bit, CoverageSource};
use crate::io::{read_background, BackgroundReader, CancelToken, ContextReader};
use crate::mem::SharedMem;
use crate::minimize::{minimize_bytes, minimize_float, minimize_integer};
use crate::mutate::Mutator;
use crate::rpc::{Call, FuzzArgs, FuzzResponse, MinimizeArgs, MinimizeResponse, PingResponse};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fs::File;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Error type the user's fuzz function reports a crash with. The message is
/// what travels back to the coordinator and names the crasher.
pub type UserError = Box<dyn std::error::Error>;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("worker channel: {0}")]
    Comm(#[from] CommError),
    #[error("decoding call: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("call record populates {0} variants, expected exactly one")]
    BadCall(usize),
    #[error("writing response: {0}")]
    Io(#[from] std::io::Error),
}

pub struct WorkerServer<F, C> {
    calls: BackgroundReader,
    fuzz_out: File,
    mem: Arc<MemSlot>,
    m: Mutator,
    /// Local coverage mask, refreshed by the coordinator through fuzz calls.
    coverage_mask: Option<Vec<u8>>,
    coverage: C,
    fuzz_fn: F,
}

impl<F, C> WorkerServer<F, C>
where
    F: FnMut(&CorpusEntry) -> Result<(), UserError>,
    C: CoverageSource,
{
    pub fn new(comm: WorkerComm, fuzz_fn: F, coverage: C) -> WorkerServer<F, C> {
        WorkerServer {
            calls: read_background(comm.fuzz_in),
            fuzz_out: comm.fuzz_out,
            mem: comm.mem,
            m: Mutator::new(),
            coverage_mask: None,
            coverage,
            fuzz_fn,
        }
    }

    /// Reads and dispatches calls until the coordinator closes `fuzz_in` or
    /// `token` fires; both are a normal exit.
    pub fn serve(mut self, token: &CancelToken) -> Result<(), ServeError> {
        loop {
            let call = {
                let mut reader = ContextReader::new(&mut self.calls, token.clone());
                let mut de = serde_json::Deserializer::from_reader(&mut reader);
                match Call::deserialize(&mut de) {
                    Ok(call) => call,
                    Err(e) => {
                        if e.is_eof() || token.is_cancelled() {
                            return Ok(());
                        }
                        return Err(ServeError::Decode(e));
                    }
                }
            };
            if call.populated_variants() != 1 {
                return Err(ServeError::BadCall(call.populated_variants()));
            }
            if let Some(args) = call.fuzz {
                let resp = self.fuzz(token, args);
                self.send(&resp)?;
            } else if let Some(args) = call.minimize {
                let resp = self.minimize(token, args);
                self.send(&resp)?;
            } else {
                self.send(&PingResponse {})?;
            }
        }
    }

    fn send<T: Serialize>(&mut self, resp: &T) -> Result<(), ServeError> {
        serde_json::to_writer(&mut self.fuzz_out, resp)
            .map_err(|e| ServeError::Io(e.into()))?;
        self.fuzz_out.write_all(b"\n")?;
        self.fuzz_out.flush()?;
        Ok(())
    }

    /// Runs the user function once. Bumps the shared counter unless this is a
    /// deflake re-run, so the coordinator's mutation replay stays in lockstep
    /// with the mutations actually applied.
    fn run_once(
        &mut self,
        mem: &mut SharedMem,
        vals: &[Value],
        counted: bool,
    ) -> (Duration, Option<Vec<u8>>, Option<String>) {
        if counted {
            mem.header_mut().count += 1;
        }
        let entry = CorpusEntry {
            values: Some(vals.to_vec()),
            ..Default::default()
        };
        let start = Instant::now();
        let ret = (self.fuzz_fn)(&entry);
        let dur = start.elapsed();
        if let Err(e) = ret {
            let mut msg = e.to_string();
            if msg.is_empty() {
                msg = "fuzz function failed with no error message".to_string();
            }
            return (dur, None, Some(msg));
        }
        if let Some(mask) = &self.coverage_mask {
            let snapshot = self.coverage.snapshot();
            if count_new_coverage_bits(mask, &snapshot) > 0 {
                return (dur, Some(snapshot), None);
            }
        }
        (dur, None, None)
    }

    /// Tests random variations of the value in shared memory until it finds a
    /// crasher or a coverage gain, or runs out of budget.
    ///
    /// The input in shared memory is never modified. The PRNG state is saved
    /// into the header before mutating and the counter tracks applied
    /// mutations, so the coordinator can reconstruct any iteration's values.
    fn fuzz(&mut self, token: &CancelToken, mut args: FuzzArgs) -> FuzzResponse {
        let mut resp = FuzzResponse::default();
        if let Some(cov) = args.coverage_data.take() {
            if let Some(mask) = &self.coverage_mask {
                assert_eq!(
                    cov.len(),
                    mask.len(),
                    "unexpected coverage mask size: got {}, expected {}",
                    cov.len(),
                    mask.len()
                );
            }
            self.coverage_mask = Some(cov);
        }
        let start = Instant::now();
        let token = if args.timeout > Duration::ZERO {
            token.child_with_timeout(args.timeout)
        } else {
            token.clone()
        };

        let mut mem = self.mem.acquire().expect("worker shared memory closed");
        let (state, inc) = self.m.rng().save();
        {
            let header = mem.header_mut();
            header.rand_state = state;
            header.rand_inc = inc;
        }
        assert!(
            args.limit <= 0 || mem.header().count < args.limit,
            "count {} already at limit {}",
            mem.header().count,
            args.limit
        );
        let mut vals = unmarshal_values(&mem.value_copy()).expect("unmarshaling fuzz input");

        self.fuzz_loop(&token, &args, &mut mem, &mut vals, &mut resp);

        resp.count = mem.header().count;
        resp.total_duration = start.elapsed();
        self.mem.release(mem);
        resp
    }

    fn fuzz_loop(
        &mut self,
        token: &CancelToken,
        args: &FuzzArgs,
        mem: &mut SharedMem,
        vals: &mut Vec<Value>,
        resp: &mut FuzzResponse,
    ) {
        if args.warmup {
            let (dur, _, err) = self.run_once(mem, vals, true);
            if let Some(msg) = err {
                resp.err = msg;
                return;
            }
            resp.interesting_duration = dur;
            if self.coverage.enabled() {
                resp.coverage_data = Some(self.coverage.snapshot());
            }
            return;
        }

        let limit_hit =
            |mem: &SharedMem| args.limit > 0 && mem.header().count >= args.limit;
        loop {
            if token.is_cancelled() {
                return;
            }
            self.m.mutate(vals, mem.capacity());
            let (dur, cov, err) = self.run_once(mem, vals, true);
            if let Some(msg) = err {
                resp.err = msg;
                return;
            }
            if let Some(first) = cov {
                // Re-run the identical values once to filter flaky gains.
                let (mut dur, mut cov) = (dur, Some(first));
                if !limit_hit(mem) {
                    let (dur2, cov2, err2) = self.run_once(mem, vals, false);
                    if let Some(msg) = err2 {
                        resp.err = msg;
                        return;
                    }
                    dur = dur2;
                    cov = cov2;
                }
                if let Some(c) = cov {
                    resp.coverage_data = Some(c);
                    resp.interesting_duration = dur;
                    return;
                }
            }
            if limit_hit(mem) {
                return;
            }
        }
    }

    /// Shrinks the value in shared memory while preserving its crash (or, when
    /// a keep-coverage mask is given, its coverage without erroring).
    fn minimize(&mut self, token: &CancelToken, args: MinimizeArgs) -> MinimizeResponse {
        let mut resp = MinimizeResponse::default();
        let start = Instant::now();
        let token = if args.timeout > Duration::ZERO {
            token.child_with_timeout(args.timeout)
        } else {
            token.clone()
        };

        let mut mem = self.mem.acquire().expect("worker shared memory closed");
        let mut vals = unmarshal_values(&mem.value_copy()).expect("unmarshaling minimize input");

        let (success, err) = self.minimize_input(
            &token,
            &mut vals,
            &mut mem,
            args.limit,
            args.keep_coverage.as_deref(),
        );
        if success {
            // Written only now: if the worker had died mid-shrink, the
            // coordinator would still find the original input in the region.
            let data = marshal_values(&vals);
            mem.set_value(&data);
        }
        resp.success = success;
        if let Some(msg) = err {
            resp.err = msg;
        } else if success {
            resp.coverage_data = Some(self.coverage.snapshot());
        }
        resp.count = mem.header().count;
        resp.duration = start.elapsed();
        self.mem.release(mem);
        resp
    }

    fn minimize_input(
        &mut self,
        token: &CancelToken,
        vals: &mut Vec<Value>,
        mem: &mut SharedMem,
        limit: i64,
        keep_coverage: Option<&[u8]>,
    ) -> (bool, Option<String>) {
        let want_error = keep_coverage.is_none();
        let mut shr = Shrinker {
            fuzz_fn: &mut self.fuzz_fn,
            coverage: &mut self.coverage,
            vals,
            mem,
            token,
            limit,
            keep_coverage,
            want_error,
            ret_err: None,
        };
        if shr.should_stop() {
            return (false, None);
        }

        // Check that the original value still reproduces. If not, whatever
        // made it look interesting was a flake and there is nothing to shrink.
        match shr.run() {
            Ok(()) if want_error => return (false, None),
            Err(msg) if !want_error => return (false, Some(msg)),
            Ok(()) => {
                if let Some(keep) = keep_coverage {
                    if !has_coverage_bit(keep, &shr.coverage.snapshot()) {
                        return (false, None);
                    }
                }
            }
            Err(msg) => shr.ret_err = Some(msg),
        }

        let len = shr.vals.len();
        let shr = RefCell::new(shr);
        for i in 0..len {
            if shr.borrow().should_stop() {
                break;
            }
            let slot = shr.borrow().vals[i].clone();
            let try_int = |c: usize| shr.borrow_mut().try_minimized(i, Candidate::Int(c));
            let try_float = |c: f64| shr.borrow_mut().try_minimized(i, Candidate::Float(c));
            let try_bytes =
                |c: &[u8]| shr.borrow_mut().try_minimized(i, Candidate::Bytes(c.to_vec()));
            let stop = || shr.borrow().should_stop();
            match slot {
                Value::Bool(_) => continue, // not minimizable
                Value::F32(v) => minimize_float(v as f64, try_float, stop),
                Value::F64(v) => minimize_float(v, try_float, stop),
                Value::Uint(v) => minimize_integer(v, try_int, stop),
                Value::U8(v) => minimize_integer(v as usize, try_int, stop),
                Value::U16(v) => minimize_integer(v as usize, try_int, stop),
                Value::U32(v) => minimize_integer(v as usize, try_int, stop),
                Value::U64(v) => {
                    if v as usize as u64 != v {
                        // would truncate on a 32-bit host
                        continue;
                    }
                    minimize_integer(v as usize, try_int, stop)
                }
                Value::Int(v) => minimize_integer(v as usize, try_int, stop),
                Value::I8(v) => minimize_integer(v as usize, try_int, stop),
                Value::I16(v) => minimize_integer(v as usize, try_int, stop),
                Value::I32(v) => minimize_integer(v as usize, try_int, stop),
                Value::I64(v) => {
                    if v as isize as i64 != v {
                        continue;
                    }
                    minimize_integer(v as usize, try_int, stop)
                }
                Value::Str(s) => minimize_bytes(s.as_bytes(), try_bytes, stop),
                Value::Bytes(b) => minimize_bytes(&b, try_bytes, stop),
            }
        }
        let shr = shr.into_inner();
        (want_error || shr.ret_err.is_none(), shr.ret_err)
    }
}

enum Candidate {
    Float(f64),
    Int(usize),
    Bytes(Vec<u8>),
}

struct Shrinker<'a, F, C> {
    fuzz_fn: &'a mut F,
    coverage: &'a mut C,
    vals: &'a mut Vec<Value>,
    mem: &'a mut SharedMem,
    token: &'a CancelToken,
    limit: i64,
    keep_coverage: Option<&'a [u8]>,
    want_error: bool,
    ret_err: Option<String>,
}

impl<F, C> Shrinker<'_, F, C>
where
    F: FnMut(&CorpusEntry) -> Result<(), UserError>,
    C: CoverageSource,
{
    fn should_stop(&self) -> bool {
        self.token.is_cancelled()
            || (self.limit > 0 && self.mem.header().count >= self.limit)
            || (self.ret_err.is_some() && !self.want_error)
    }

    fn run(&mut self) -> Result<(), String> {
        self.mem.header_mut().count += 1;
        let entry = CorpusEntry {
            values: Some(self.vals.clone()),
            ..Default::default()
        };
        (self.fuzz_fn)(&entry).map_err(|e| {
            let msg = e.to_string();
            if msg.is_empty() {
                "fuzz function failed with no error message".to_string()
            } else {
                msg
            }
        })
    }

    /// Runs the user function with `candidate` in slot `i`, cast back to the
    /// slot's original variant. Keeps the replacement iff the run stays
    /// interesting for the same reason as the original input.
    fn try_minimized(&mut self, i: usize, candidate: Candidate) -> bool {
        let prev = self.vals[i].clone();
        let cast = match cast_candidate(&prev, candidate) {
            Some(v) => v,
            // a byte-string candidate that is not valid UTF-8 cannot take a
            // string slot; reject it without running
            None => return false,
        };
        self.vals[i] = cast;
        match self.run() {
            Err(msg) => {
                self.ret_err = Some(msg);
                self.want_error
            }
            Ok(()) => {
                if let Some(keep) = self.keep_coverage {
                    if has_coverage_bit(keep, &self.coverage.snapshot()) {
                        return true;
                    }
                }
                self.vals[i] = prev;
                false
            }
        }
    }
}

fn cast_candidate(prev: &Value, candidate: Candidate) -> Option<Value> {
    let v = match (candidate, prev) {
        (Candidate::Float(c), Value::F32(_)) => Value::F32(c as f32),
        (Candidate::Float(c), Value::F64(_)) => Value::F64(c),
        (Candidate::Int(c), Value::Uint(_)) => Value::Uint(c),
        (Candidate::Int(c), Value::U8(_)) => Value::U8(c as u8),
        (Candidate::Int(c), Value::U16(_)) => Value::U16(c as u16),
        (Candidate::Int(c), Value::U32(_)) => Value::U32(c as u32),
        (Candidate::Int(c), Value::U64(_)) => Value::U64(c as u64),
        (Candidate::Int(c), Value::Int(_)) => Value::Int(c as isize),
        (Candidate::Int(c), Value::I8(_)) => Value::I8(c as i8),
        (Candidate::Int(c), Value::I16(_)) => Value::I16(c as i16),
        (Candidate::Int(c), Value::I32(_)) => Value::I32(c as i32),
        (Candidate::Int(c), Value::I64(_)) => Value::I64(c as i64),
        (Candidate::Bytes(c), Value::Bytes(_)) => Value::Bytes(c),
        (Candidate::Bytes(c), Value::Str(_)) => match String::from_utf8(c) {
            Ok(s) => Value::Str(s),
            Err(_) => return None,
        },
        _ => panic!("impossible candidate for {} slot", prev.kind()),
    };
    Some(v)
}

/// Entry point for a worker process: wires up the inherited channel and
/// serves RPCs until the coordinator hangs up.
///
/// `fuzz_fn` wraps the user's fuzz function; an `Err` marks the current input
/// as a crasher. The process may also simply crash or exit, which the
/// coordinator observes and classifies on its side.
pub fn run_fuzz_worker<F, C>(fuzz_fn: F, coverage: C) -> Result<(), ServeError>
where
    F: FnMut(&CorpusEntry) -> Result<(), UserError>,
    C: CoverageSource,
{
    let comm = get_worker_comm()?;
    let server = WorkerServer::new(comm, fuzz_fn, coverage);
    server.serve(&CancelToken::new())
}

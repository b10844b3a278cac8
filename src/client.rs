//! In-coordinator RPC stub for one worker process.
use crate::comm::{MemSlot, SharedMemClosed, WorkerComm};
use crate::corpus::{entry_path, marshal_values, unmarshal_values, CorpusEntry};
use crate::io::{read_background, BackgroundReader, CancelToken, ContextReader};
use crate::mutate::Mutator;
use crate::rpc::{Call, FuzzArgs, FuzzResponse, MinimizeArgs, MinimizeResponse, PingResponse};
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::Write;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Cleanup raced an in-flight call; never shown to the user.
    #[error(transparent)]
    SharedMemClosed(#[from] SharedMemClosed),
    #[error("fuzzing operation cancelled")]
    Cancelled,
    #[error("communicating with worker: {0}")]
    Io(#[from] std::io::Error),
    #[error("decoding worker response: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("worker connection already closed")]
    Closed,
}

/// RPC client owned by the supervisor. A mutex serializes calls so at most
/// one RPC is in flight per worker; the shared-memory permit moves to the
/// worker for the duration of each call.
pub struct WorkerClient {
    conn: Mutex<ClientConn>,
    mem: Arc<MemSlot>,
}

struct ClientConn {
    fuzz_in: Option<File>,
    fuzz_out: BackgroundReader,
    m: Mutator,
}

impl WorkerClient {
    pub fn new(comm: WorkerComm, m: Mutator) -> WorkerClient {
        WorkerClient {
            conn: Mutex::new(ClientConn {
                fuzz_in: Some(comm.fuzz_in),
                fuzz_out: read_background(comm.fuzz_out),
                m,
            }),
            mem: comm.mem,
        }
    }

    /// Confirms the worker reached its RPC loop.
    pub fn ping(&self, token: &CancelToken) -> Result<(), ClientError> {
        let mut conn = self.conn.lock().unwrap();
        let call = Call {
            ping: Some(Default::default()),
            ..Default::default()
        };
        let _: PingResponse = conn.call(token, &call)?;
        Ok(())
    }

    /// Sends a fuzz call and turns its outcome into a corpus entry.
    ///
    /// Returns the entry, the response, and the transport error if one
    /// occurred. The entry is meaningful even on error: the worker saved its
    /// PRNG snapshot and mutation count in shared memory before running, so
    /// the input of the crashing iteration is reconstructed here by replaying
    /// the mutations, even if the worker process is already gone.
    pub fn fuzz(
        &self,
        token: &CancelToken,
        entry_in: &CorpusEntry,
        args: FuzzArgs,
    ) -> (CorpusEntry, FuzzResponse, Option<ClientError>) {
        let mut conn = self.conn.lock().unwrap();

        let mut mem = match self.mem.acquire() {
            Ok(mem) => mem,
            Err(e) => return (entry_in.clone(), FuzzResponse::default(), Some(e.into())),
        };
        mem.header_mut().count = 0;
        let inp = entry_in.data.clone();
        mem.set_value(&inp);
        self.mem.release(mem);

        let call = Call {
            fuzz: Some(args.clone()),
            ..Default::default()
        };
        let (mut resp, call_err) = match conn.call::<FuzzResponse>(token, &call) {
            Ok(resp) => (resp, None),
            Err(e) => (FuzzResponse::default(), Some(e)),
        };

        let mem = match self.mem.acquire() {
            Ok(mem) => mem,
            Err(e) => return (entry_in.clone(), resp, Some(e.into())),
        };
        resp.count = mem.header().count;

        // The coordinator reconstructs interesting inputs by replay; a worker
        // that rewrites the input buffer would make that reconstruction lie.
        assert!(
            inp == mem.value(),
            "worker modified the input buffer during fuzz"
        );

        let need_entry_out = call_err.is_some()
            || !resp.err.is_empty()
            || (!args.warmup && resp.coverage_data.is_some());
        let entry_out = if need_entry_out {
            let mut values_out =
                unmarshal_values(&inp).expect("unmarshaling fuzz input after call");
            conn.m
                .rng_mut()
                .restore(mem.header().rand_state, mem.header().rand_inc);
            if !args.warmup {
                // Replay the worker's mutations to materialize the exact
                // values of the final iteration.
                for _ in 0..mem.header().count {
                    conn.m.mutate(&mut values_out, mem.capacity());
                }
            }
            let data_out = marshal_values(&values_out);
            let path = entry_path(&data_out);
            CorpusEntry {
                parent: entry_in.path.clone(),
                path,
                data: data_out,
                values: Some(values_out),
                generation: entry_in.generation + 1,
                // the bytes were not mutated in warmup, so seed-ness carries
                is_seed: args.warmup && entry_in.is_seed,
            }
        } else {
            entry_in.clone()
        };
        self.mem.release(mem);

        (entry_out, resp, call_err)
    }

    /// Sends a minimize call. On success the shrunken input is read back out
    /// of shared memory; otherwise the original entry is returned unchanged.
    pub fn minimize(
        &self,
        token: &CancelToken,
        entry_in: &CorpusEntry,
        args: MinimizeArgs,
    ) -> (CorpusEntry, MinimizeResponse, Option<ClientError>) {
        let mut conn = self.conn.lock().unwrap();

        let mut mem = match self.mem.acquire() {
            Ok(mem) => mem,
            Err(e) => return (entry_in.clone(), MinimizeResponse::default(), Some(e.into())),
        };
        mem.header_mut().count = 0;
        mem.set_value(&entry_in.data);
        self.mem.release(mem);

        let call = Call {
            minimize: Some(args),
            ..Default::default()
        };
        let (mut resp, call_err) = match conn.call::<MinimizeResponse>(token, &call) {
            Ok(resp) => (resp, None),
            Err(e) => (MinimizeResponse::default(), Some(e)),
        };

        let mem = match self.mem.acquire() {
            Ok(mem) => mem,
            Err(e) => return (entry_in.clone(), resp, Some(e.into())),
        };
        resp.count = mem.header().count;
        let entry_out = if resp.success {
            let data = mem.value_copy();
            let values = unmarshal_values(&data)
                .expect("unmarshaling minimized value from shared memory");
            CorpusEntry {
                path: entry_path(&data),
                data,
                values: Some(values),
                parent: entry_in.parent.clone(),
                generation: entry_in.generation,
                is_seed: entry_in.is_seed,
            }
        } else {
            // Did not shrink, but the original may still be interesting.
            entry_in.clone()
        };
        self.mem.release(mem);

        (entry_out, resp, call_err)
    }

    /// Signals end-of-calls by closing `fuzz_in`, then drains `fuzz_out`
    /// until the worker closes its end, avoiding a SIGPIPE over there.
    pub fn close(&self) -> std::io::Result<()> {
        let mut conn = self.conn.lock().unwrap();
        if conn.fuzz_in.take().is_none() {
            return Ok(());
        }
        conn.fuzz_out.drain()
    }
}

impl ClientConn {
    fn call<R: DeserializeOwned>(
        &mut self,
        token: &CancelToken,
        call: &Call,
    ) -> Result<R, ClientError> {
        let fuzz_in = self.fuzz_in.as_mut().ok_or(ClientError::Closed)?;
        serde_json::to_writer(&mut *fuzz_in, call)
            .map_err(|e| ClientError::Io(e.into()))?;
        fuzz_in.write_all(b"\n")?;
        fuzz_in.flush()?;

        let mut reader = ContextReader::new(&mut self.fuzz_out, token.clone());
        let mut de = serde_json::Deserializer::from_reader(&mut reader);
        match R::deserialize(&mut de) {
            Ok(resp) => Ok(resp),
            Err(e) => {
                if token.is_cancelled() {
                    Err(ClientError::Cancelled)
                } else {
                    Err(ClientError::Decode(e))
                }
            }
        }
    }
}

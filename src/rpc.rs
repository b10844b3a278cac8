//! Wire records for the coordinator↔worker RPC.
//!
//! One request, one response, no pipelining. Records are self-delimiting
//! JSON objects, newline-separated on the pipe for readability in traces.
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A call sent on `fuzz_in`. Exactly one field must be populated; anything
/// else is a framing error that terminates the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Call {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping: Option<PingArgs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fuzz: Option<FuzzArgs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimize: Option<MinimizeArgs>,
}

impl Call {
    pub(crate) fn populated_variants(&self) -> usize {
        self.ping.is_some() as usize
            + self.fuzz.is_some() as usize
            + self.minimize.is_some() as usize
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingArgs {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PingResponse {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FuzzArgs {
    /// Time to spend fuzzing, not counting startup and cleanup. Zero means
    /// no deadline.
    pub timeout: Duration,
    /// Maximum number of values to test. Zero means no limit.
    pub limit: i64,
    /// Run the original value exactly once, without mutating.
    pub warmup: bool,
    /// Coverage mask to install before fuzzing, when supplied.
    pub coverage_data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FuzzResponse {
    /// Elapsed time for the whole call.
    pub total_duration: Duration,
    /// Elapsed time of the interesting run, when one was found.
    pub interesting_duration: Duration,
    /// Values tested, mirrored from the shared-memory header.
    pub count: i64,
    /// Snapshot taken when the value in shared memory expanded coverage.
    pub coverage_data: Option<Vec<u8>>,
    /// Error string from the user function; non-empty means the value in
    /// shared memory caused a crash.
    pub err: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MinimizeArgs {
    /// Time to spend minimizing. Zero means no deadline.
    pub timeout: Duration,
    /// Maximum number of values to test. Zero means no limit.
    pub limit: i64,
    /// When set, minimization preserves coverage: a candidate is kept only if
    /// it lights at least one of these bits and does not error. When absent,
    /// minimization preserves the crash instead.
    pub keep_coverage: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MinimizeResponse {
    /// Whether a smaller interesting input now sits in shared memory.
    pub success: bool,
    /// Error string caused by the value in shared memory, if any.
    pub err: String,
    /// Coverage activated by the minimized value; absent on error or failure.
    pub coverage_data: Option<Vec<u8>>,
    /// Time spent minimizing.
    pub duration: Duration,
    /// Values tested, mirrored from the shared-memory header.
    pub count: i64,
}

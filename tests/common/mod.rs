//! Shared test fixtures.
//!
//! [`MockGateway`] records every [`ExecSpec`] a handler submits and
//! replays queued results in FIFO order, so integration tests can drive
//! the full handler pipeline without spawning any real backend tool.

use async_trait::async_trait;
use rexxrun::error::{Error, Result};
use rexxrun::process::{ExecSpec, ProcessGateway, ProcessResult};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Recording gateway with a scripted result queue.
///
/// When the queue is empty, `execute` returns a generic success with
/// stdout `"mock-id"`, which satisfies probes and most lifecycle calls.
pub struct MockGateway {
    calls: Mutex<Vec<ExecSpec>>,
    queue: Mutex<VecDeque<Result<ProcessResult>>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Queues a full result for the next call.
    pub fn push_result(&self, result: ProcessResult) {
        self.queue.lock().unwrap().push_back(Ok(result));
    }

    /// Queues a zero-exit result with the given stdout.
    pub fn push_success(&self, stdout: &str) {
        self.push_result(ProcessResult {
            exit_code: 0,
            stdout: stdout.to_string(),
            ..Default::default()
        });
    }

    /// Queues a nonzero-exit result with the given stderr.
    pub fn push_failure(&self, exit_code: i32, stderr: &str) {
        self.push_result(ProcessResult {
            exit_code,
            stderr: stderr.to_string(),
            ..Default::default()
        });
    }

    /// Queues a timed-out result.
    pub fn push_timeout(&self) {
        self.push_result(ProcessResult {
            exit_code: -1,
            timed_out: true,
            ..Default::default()
        });
    }

    /// Queues a gateway-level error (e.g. spawn failure).
    pub fn push_error(&self, error: Error) {
        self.queue.lock().unwrap().push_back(Err(error));
    }

    /// Snapshot of every spec submitted so far.
    pub fn calls(&self) -> Vec<ExecSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Number of calls submitted so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ProcessGateway for MockGateway {
    async fn execute(&self, spec: ExecSpec) -> Result<ProcessResult> {
        self.calls.lock().unwrap().push(spec);
        match self.queue.lock().unwrap().pop_front() {
            Some(outcome) => outcome,
            None => Ok(ProcessResult {
                exit_code: 0,
                stdout: "mock-id".to_string(),
                ..Default::default()
            }),
        }
    }
}

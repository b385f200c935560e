//! Recording `ProcessControl` for tests.

use super::{ProcessControl, ProcessOutput, ProcessSink, Signal, SpawnError, SpawnRequest};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SpawnCall {
    pub(crate) program: String,
    pub(crate) args: Vec<String>,
    pub(crate) generation: u64,
    pub(crate) pid: u32,
}

#[derive(Default)]
pub(crate) struct FakeLog {
    pub(crate) spawns: Vec<SpawnCall>,
    pub(crate) signals: Vec<(u32, Signal)>,
    pub(crate) sinks: Vec<ProcessSink>,
    pub(crate) fail_spawns: usize,
}

/// Cloned handles share one log so a test can inspect what the supervisor did.
#[derive(Clone, Default)]
pub(crate) struct FakeControl {
    log: Arc<Mutex<FakeLog>>,
}

impl FakeControl {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn log(&self) -> MutexGuard<'_, FakeLog> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn fail_next_spawns(&self, count: usize) {
        self.log().fail_spawns = count;
    }

    pub(crate) fn spawn_count(&self) -> usize {
        self.log().spawns.len()
    }

    pub(crate) fn last_spawn(&self) -> Option<SpawnCall> {
        self.log().spawns.last().cloned()
    }

    pub(crate) fn signals(&self) -> Vec<(u32, Signal)> {
        self.log().signals.clone()
    }

    /// Sink of the most recent instance; lets a test act as the process.
    pub(crate) fn last_sink(&self) -> Option<ProcessSink> {
        self.log().sinks.last().cloned()
    }

    /// Report an exit for the most recent instance.
    pub(crate) fn exit_last(&self, code: Option<i32>, signal: Option<i32>) {
        if let Some(sink) = self.last_sink() {
            sink.send(ProcessOutput::Exited { code, signal });
        }
    }
}

impl ProcessControl for FakeControl {
    fn spawn(&mut self, request: &SpawnRequest<'_>, sink: ProcessSink) -> Result<u32, SpawnError> {
        let mut log = self.log();
        if log.fail_spawns > 0 {
            log.fail_spawns -= 1;
            return Err(SpawnError::Launch {
                program: request.program.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
            });
        }
        let pid = 4000 + log.spawns.len() as u32;
        log.spawns.push(SpawnCall {
            program: request.program.to_string(),
            args: request.args.to_vec(),
            generation: request.generation,
            pid,
        });
        log.sinks.push(sink);
        Ok(pid)
    }

    fn signal(&mut self, pid: u32, signal: Signal) {
        self.log().signals.push((pid, signal));
    }
}

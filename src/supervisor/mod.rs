//! Engine process supervisor.
//!
//! Owns the single engine process: launches it from an [`EngineConfig`],
//! terminates it (SIGTERM, then SIGKILL after a grace period) and turns its
//! output messages into decoded [`SupervisorEvent`]s. All methods run on the
//! bridge's control thread; blocking I/O lives in the reader/waiter threads
//! spawned by [`ProcessControl`].
//!
//! A stop always ends in `Stopped`: one grace period after SIGKILL (or after
//! the process was reaped) the handle is released even if descendants still
//! hold the output pipes open.

#[cfg(test)]
pub(crate) mod fake;
mod process;
#[cfg(test)]
mod tests;

pub use process::{
    Generation, OsProcessControl, ProcessControl, ProcessMessage, ProcessOutput, ProcessSink,
    Signal, SpawnError, SpawnRequest,
};

use crate::engine::{engine_args, EngineConfig, EngineLaunchSpec};
use crate::ipc::{decode_line, DecodeError, EngineEvent, LineFramer};
use crate::{log_debug, log_debug_content};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Lifecycle of the engine process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl SupervisorState {
    pub fn label(self) -> &'static str {
        match self {
            SupervisorState::Stopped => "stopped",
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Stopping => "stopping",
        }
    }
}

/// Why `start` did not launch anything.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("engine is {}; stop it before starting again", .0.label())]
    NotStopped(SupervisorState),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
}

/// Decoded output of the current engine instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    Engine(EngineEvent),
    /// One stderr line, never decoded.
    Diagnostic(String),
    /// `crashed` is set when the exit was not requested through `stop`.
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
        crashed: bool,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    pub spawns: u64,
    pub spawn_failures: u64,
    pub decode_failures: u64,
    pub stale_messages: u64,
    pub forced_kills: u64,
    /// Handles released without a drained exit report.
    pub abandoned: u64,
}

struct ProcessHandle {
    pid: u32,
    generation: Generation,
    framer: LineFramer,
    started_at: Instant,
    stop_requested_at: Option<Instant>,
    kill_sent_at: Option<Instant>,
    reaped: Option<Reaped>,
}

/// Exit status seen before the pipes closed.
struct Reaped {
    at: Instant,
    code: Option<i32>,
    signal: Option<i32>,
}

pub struct Supervisor<C: ProcessControl = OsProcessControl> {
    control: C,
    launch: EngineLaunchSpec,
    output_tx: Sender<ProcessMessage>,
    stop_grace: Duration,
    state: SupervisorState,
    handle: Option<ProcessHandle>,
    next_generation: Generation,
    stats: SupervisorStats,
}

impl<C: ProcessControl> Supervisor<C> {
    pub fn new(
        control: C,
        launch: EngineLaunchSpec,
        output_tx: Sender<ProcessMessage>,
        stop_grace: Duration,
    ) -> Self {
        Self {
            control,
            launch,
            output_tx,
            stop_grace,
            state: SupervisorState::Stopped,
            handle: None,
            next_generation: 1,
            stats: SupervisorStats::default(),
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().map(|handle| handle.pid)
    }

    pub fn generation(&self) -> Option<Generation> {
        self.handle.as_ref().map(|handle| handle.generation)
    }

    pub fn stats(&self) -> SupervisorStats {
        self.stats
    }

    pub fn launch_spec(&self) -> &EngineLaunchSpec {
        &self.launch
    }

    /// Launch the engine. Rejected unless the supervisor is `Stopped`.
    pub fn start(&mut self, config: &EngineConfig, now: Instant) -> Result<(), StartError> {
        if self.state != SupervisorState::Stopped {
            return Err(StartError::NotStopped(self.state));
        }
        self.state = SupervisorState::Starting;
        let generation = self.next_generation;
        self.next_generation += 1;

        let args = engine_args(&self.launch, config);
        log_debug(&format!(
            "starting engine generation {generation}: {} {}",
            self.launch.program,
            args.join(" ")
        ));
        let request = SpawnRequest {
            program: &self.launch.program,
            args: &args,
            generation,
        };
        let sink = ProcessSink::new(generation, self.output_tx.clone());
        match self.control.spawn(&request, sink) {
            Ok(pid) => {
                self.handle = Some(ProcessHandle {
                    pid,
                    generation,
                    framer: LineFramer::new(),
                    started_at: now,
                    stop_requested_at: None,
                    kill_sent_at: None,
                    reaped: None,
                });
                self.state = SupervisorState::Running;
                self.stats.spawns += 1;
                tracing::info!(pid, generation, model = %config.model, "engine spawned");
                Ok(())
            }
            Err(err) => {
                self.state = SupervisorState::Stopped;
                self.stats.spawn_failures += 1;
                log_debug(&format!("engine spawn failed: {err}"));
                tracing::warn!(generation, error = %err, "engine spawn failed");
                Err(StartError::Spawn(err))
            }
        }
    }

    /// Ask the engine to exit. Idempotent: no-op when already stopped or stopping.
    pub fn stop(&mut self, now: Instant) {
        match self.state {
            SupervisorState::Stopped | SupervisorState::Stopping => return,
            SupervisorState::Starting | SupervisorState::Running => {}
        }
        let Some(handle) = self.handle.as_mut() else {
            self.state = SupervisorState::Stopped;
            return;
        };
        if handle.reaped.is_none() {
            log_debug(&format!(
                "stopping engine pid {} (generation {}); sending SIGTERM",
                handle.pid, handle.generation
            ));
            self.control.signal(handle.pid, Signal::Term);
        } else {
            log_debug(&format!(
                "stopping engine pid {} (generation {}); already reaped, waiting for pipes",
                handle.pid, handle.generation
            ));
        }
        handle.stop_requested_at = Some(now);
        self.state = SupervisorState::Stopping;
    }

    /// When the next timer-driven action is due.
    pub fn next_deadline(&self) -> Option<Instant> {
        let handle = self.handle.as_ref()?;
        if let Some(reaped) = &handle.reaped {
            return Some(reaped.at + self.stop_grace);
        }
        if self.state != SupervisorState::Stopping {
            return None;
        }
        handle
            .kill_sent_at
            .or(handle.stop_requested_at)
            .map(|since| since + self.stop_grace)
    }

    /// Escalate to SIGKILL once the grace period has run out, then release
    /// the handle one grace period later if no drained exit arrived.
    pub fn poll_timers(&mut self, now: Instant) -> Vec<SupervisorEvent> {
        let Some(deadline) = self.next_deadline() else {
            return Vec::new();
        };
        if now < deadline {
            return Vec::new();
        }
        let Some(handle) = self.handle.as_mut() else {
            return Vec::new();
        };
        if handle.reaped.is_none() && handle.kill_sent_at.is_none() {
            log_debug(&format!(
                "engine pid {} ignored SIGTERM for {:?}; escalating to SIGKILL",
                handle.pid, self.stop_grace
            ));
            tracing::warn!(pid = handle.pid, "graceful stop timed out");
            self.control.signal(handle.pid, Signal::Kill);
            handle.kill_sent_at = Some(now);
            self.stats.forced_kills += 1;
            return Vec::new();
        }

        let (code, signal) = handle
            .reaped
            .as_ref()
            .map_or((None, None), |reaped| (reaped.code, reaped.signal));
        log_debug(&format!(
            "engine pid {} left its output pipes open; releasing handle",
            handle.pid
        ));
        tracing::warn!(
            pid = handle.pid,
            reaped = handle.reaped.is_some(),
            "engine handle abandoned"
        );
        self.stats.abandoned += 1;
        self.finish_instance(code, signal)
    }

    /// Consume one message from the process threads.
    pub fn handle_message(&mut self, message: ProcessMessage) -> Vec<SupervisorEvent> {
        let Some(handle) = self.handle.as_mut() else {
            self.stats.stale_messages += 1;
            return Vec::new();
        };
        if message.generation != handle.generation {
            self.stats.stale_messages += 1;
            return Vec::new();
        }

        match message.kind {
            ProcessOutput::Stdout(bytes) => {
                let lines = handle.framer.push(&bytes);
                self.decode_lines(lines)
            }
            ProcessOutput::Stderr(line) => vec![SupervisorEvent::Diagnostic(line)],
            ProcessOutput::Reaped { code, signal } => {
                log_debug(&format!(
                    "engine pid {} reaped (code {code:?}, signal {signal:?}); draining pipes",
                    handle.pid
                ));
                handle.reaped = Some(Reaped {
                    at: Instant::now(),
                    code,
                    signal,
                });
                Vec::new()
            }
            ProcessOutput::Exited { code, signal } => self.finish_instance(code, signal),
        }
    }

    /// Flush the current instance's partial line, drop its handle and report the exit.
    fn finish_instance(
        &mut self,
        code: Option<i32>,
        signal: Option<i32>,
    ) -> Vec<SupervisorEvent> {
        let Some(mut handle) = self.handle.take() else {
            return Vec::new();
        };
        self.state = SupervisorState::Stopped;
        let tail: Vec<String> = handle.framer.finish().into_iter().collect();
        let crashed = handle.stop_requested_at.is_none();
        let uptime = handle.started_at.elapsed();
        log_debug(&format!(
            "engine pid {} exited (code {code:?}, signal {signal:?}, crashed {crashed}) after {uptime:?}",
            handle.pid
        ));
        tracing::info!(pid = handle.pid, ?code, ?signal, crashed, "engine exited");
        let mut events = self.decode_lines(tail);
        events.push(SupervisorEvent::Exited {
            code,
            signal,
            crashed,
        });
        events
    }

    fn decode_lines(&mut self, lines: Vec<String>) -> Vec<SupervisorEvent> {
        let mut events = Vec::with_capacity(lines.len());
        for line in lines {
            match decode_line(&line) {
                Ok(event) => events.push(SupervisorEvent::Engine(event)),
                Err(DecodeError::Empty) => {}
                Err(err) => {
                    self.stats.decode_failures += 1;
                    log_debug(&format!("dropping engine line: {err}"));
                    log_debug_content(&format!("dropped line: {line}"));
                }
            }
        }
        events
    }

    /// Stop and block until the engine is gone. Used when the bridge exits.
    ///
    /// Returns whatever the engine emitted while shutting down.
    pub fn shutdown(&mut self, rx: &Receiver<ProcessMessage>) -> Vec<SupervisorEvent> {
        let mut events = Vec::new();
        self.stop(Instant::now());
        while self.state != SupervisorState::Stopped {
            let Some(deadline) = self.next_deadline() else {
                self.handle = None;
                self.state = SupervisorState::Stopped;
                break;
            };
            match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                Ok(message) => events.extend(self.handle_message(message)),
                Err(RecvTimeoutError::Timeout) => events.extend(self.poll_timers(Instant::now())),
                Err(RecvTimeoutError::Disconnected) => {
                    self.handle = None;
                    self.state = SupervisorState::Stopped;
                }
            }
        }
        events
    }
}

impl<C: ProcessControl> Drop for Supervisor<C> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take().filter(|handle| handle.reaped.is_none()) {
            log_debug(&format!(
                "supervisor dropped with live engine pid {}; sending SIGKILL",
                handle.pid
            ));
            self.control.signal(handle.pid, Signal::Kill);
        }
    }
}

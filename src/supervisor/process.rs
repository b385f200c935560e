use crate::ipc::clean_diagnostic;
use crate::{log_debug, log_debug_content};
use crossbeam_channel::Sender;
use std::io::{self, BufRead, BufReader, ErrorKind, Read};
use std::process::{ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::thread;
use thiserror::Error;

/// Identifies one engine process instance.
pub type Generation = u64;

const STDOUT_CHUNK_BYTES: usize = 4096;

/// Raw output from a process instance, tagged with its generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessMessage {
    pub generation: Generation,
    pub kind: ProcessOutput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutput {
    Stdout(Vec<u8>),
    Stderr(String),
    /// The process itself is gone; its pipes may still be held by descendants.
    Reaped {
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// Process reaped and both pipes drained.
    Exited {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

/// Engine binary missing or unlaunchable.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to launch '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("'{program}' started without a {stream} pipe")]
    MissingPipe {
        program: String,
        stream: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

/// Everything needed to launch one instance.
#[derive(Debug, Clone)]
pub struct SpawnRequest<'a> {
    pub program: &'a str,
    pub args: &'a [String],
    pub generation: Generation,
}

/// Channel end handed to a freshly spawned instance.
#[derive(Clone)]
pub struct ProcessSink {
    generation: Generation,
    tx: Sender<ProcessMessage>,
}

impl ProcessSink {
    pub fn new(generation: Generation, tx: Sender<ProcessMessage>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Returns false once the bridge has gone away.
    pub fn send(&self, kind: ProcessOutput) -> bool {
        self.tx
            .send(ProcessMessage {
                generation: self.generation,
                kind,
            })
            .is_ok()
    }
}

/// OS seam used by the supervisor. Implementations report output and exit
/// through the sink; `spawn` returns the pid.
pub trait ProcessControl {
    fn spawn(&mut self, request: &SpawnRequest<'_>, sink: ProcessSink) -> Result<u32, SpawnError>;
    fn signal(&mut self, pid: u32, signal: Signal);
}

/// Real processes: piped stdout/stderr, null stdin, one thread per stream plus a waiter.
///
/// On unix each engine leads its own process group and signals go to the
/// whole group, so helpers the engine forks are stopped with it.
#[derive(Debug, Default)]
pub struct OsProcessControl;

impl ProcessControl for OsProcessControl {
    fn spawn(&mut self, request: &SpawnRequest<'_>, sink: ProcessSink) -> Result<u32, SpawnError> {
        let mut command = Command::new(request.program);
        command
            .args(request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut child = command
            .spawn()
            .map_err(|source| SpawnError::Launch {
                program: request.program.to_string(),
                source,
            })?;

        let pid = child.id();
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SpawnError::MissingPipe {
                program: request.program.to_string(),
                stream: "stdout",
            });
        };
        let Some(stderr) = child.stderr.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SpawnError::MissingPipe {
                program: request.program.to_string(),
                stream: "stderr",
            });
        };

        let stdout_handle = spawn_stdout_reader(stdout, sink.clone());
        let stderr_handle = spawn_stderr_reader(stderr, sink.clone());

        thread::spawn(move || {
            let (code, signal) = match child.wait() {
                Ok(status) => exit_status_parts(status),
                Err(err) => {
                    log_debug(&format!("engine wait failed: {err}"));
                    (None, None)
                }
            };
            sink.send(ProcessOutput::Reaped { code, signal });
            // Exit is reported only after both pipes are drained so the
            // instance's last lines always precede its exit.
            let _ = stdout_handle.join();
            let _ = stderr_handle.join();
            sink.send(ProcessOutput::Exited { code, signal });
        });

        Ok(pid)
    }

    fn signal(&mut self, pid: u32, signal: Signal) {
        send_signal(pid, signal);
    }
}

fn exit_status_parts(status: ExitStatus) -> (Option<i32>, Option<i32>) {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;
    (status.code(), signal)
}

pub(super) fn should_retry_read_error(err: &io::Error) -> bool {
    err.kind() == ErrorKind::Interrupted || err.kind() == ErrorKind::WouldBlock
}

/// Forward raw stdout chunks; framing happens on the control thread.
fn spawn_stdout_reader(mut stdout: ChildStdout, sink: ProcessSink) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut buffer = [0u8; STDOUT_CHUNK_BYTES];
        loop {
            match stdout.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    if !sink.send(ProcessOutput::Stdout(buffer[..n].to_vec())) {
                        break;
                    }
                }
                Err(err) if should_retry_read_error(&err) => continue,
                Err(err) => {
                    log_debug(&format!(
                        "engine stdout read error (generation {}): {err}",
                        sink.generation()
                    ));
                    break;
                }
            }
        }
    })
}

fn spawn_stderr_reader(stderr: ChildStderr, sink: ProcessSink) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let reader = BufReader::new(stderr);
        for line in reader.split(b'\n').map_while(Result::ok) {
            let text = clean_diagnostic(&line);
            if text.is_empty() {
                continue;
            }
            log_debug_content(&format!("[engine] {text}"));
            if !sink.send(ProcessOutput::Stderr(text)) {
                break;
            }
        }
    })
}

pub(super) fn send_signal(pid: u32, signal: Signal) {
    #[cfg(unix)]
    unsafe {
        let signo = match signal {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        // SAFETY: pid leads a process group we created and whose leader the
        // supervisor has not seen reaped.
        if libc::kill(-(pid as i32), signo) != 0 {
            log_debug(&format!(
                "failed to send signal {signo} to engine group {pid}: {}",
                io::Error::last_os_error()
            ));
        }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        let _ = signal;
        log_debug("engine signal requested, but signals are unsupported on this platform");
    }
}

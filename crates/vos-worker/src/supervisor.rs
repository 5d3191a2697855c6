//! Supervised command exchange with one worker subprocess.
//!
//! Every command runs as a full exchange: write the command frame, then read
//! reply frames until the worker settles with OK or ERROR, answering any
//! QUERY syscalls in between. A mutex-held baton serializes exchanges so two
//! callers can never interleave bytes on the wire.

use std::io::{self, BufReader, BufWriter, Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;

use crate::netstring::{read_frame, write_frame};
use crate::protocol::{WorkerCommand, WorkerReply};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to spawn worker '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("worker protocol violation: {0}")]
    Protocol(String),
}

/// Settled result of one command exchange. A worker-reported ERROR is a
/// value, not an `Err`: the wire stayed healthy and the worker is still
/// usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Ok(Vec<u8>),
    Fail(Vec<u8>),
}

impl CommandOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, CommandOutcome::Ok(_))
    }
}

/// Answers the worker's synchronous QUERY syscalls while a command is in
/// flight.
pub trait SyscallHandler {
    fn syscall(&mut self, request: &[u8]) -> Vec<u8>;
}

impl<F> SyscallHandler for F
where
    F: FnMut(&[u8]) -> Vec<u8>,
{
    fn syscall(&mut self, request: &[u8]) -> Vec<u8> {
        self(request)
    }
}

struct Conduit {
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    child: Option<Child>,
}

impl Conduit {
    /// Kills the subprocess, if any. Called once the wire is known bad; the
    /// process cannot be trusted to exit on its own.
    fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Err(err) = child.kill() {
                log::warn!("failed to kill worker process: {err}");
            }
            let _ = child.wait();
        }
        self.child = None;
    }
}

/// Handle to one worker. All commands funnel through the internal baton;
/// concurrent senders queue on the mutex in submission order.
pub struct WorkerProcess {
    label: String,
    baton: Mutex<Conduit>,
}

impl WorkerProcess {
    /// Spawns the worker subprocess with piped stdio.
    pub fn spawn(label: impl Into<String>, argv: &[String]) -> Result<Self, WorkerError> {
        let label = label.into();
        let program = argv.first().ok_or_else(|| WorkerError::Protocol(
            "worker argv must name a program".into(),
        ))?;
        let mut child = Command::new(program)
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| WorkerError::Spawn {
                command: program.clone(),
                source,
            })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::Protocol("worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Protocol("worker stdout unavailable".into()))?;
        log::debug!("spawned worker '{label}' pid {}", child.id());
        Ok(Self {
            label,
            baton: Mutex::new(Conduit {
                reader: Box::new(BufReader::new(stdout)),
                writer: Box::new(BufWriter::new(stdin)),
                child: Some(child),
            }),
        })
    }

    /// Builds a handle over arbitrary streams. Used by tests and by
    /// transports that are not plain child-process pipes.
    pub fn from_streams(
        label: impl Into<String>,
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
    ) -> Self {
        Self {
            label: label.into(),
            baton: Mutex::new(Conduit {
                reader: Box::new(reader),
                writer: Box::new(writer),
                child: None,
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Runs one full command exchange. Holds the baton from the first command
    /// byte until the worker's OK/ERROR settles, so a second caller's frame
    /// can never appear on the wire mid-exchange.
    pub fn send(
        &self,
        command: &WorkerCommand,
        syscalls: &mut dyn SyscallHandler,
    ) -> Result<CommandOutcome, WorkerError> {
        let mut conduit = self.baton.lock().unwrap();
        match Self::exchange(&mut conduit, command, syscalls) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                log::error!("worker '{}' wire fault: {err}", self.label);
                conduit.kill();
                Err(err)
            }
        }
    }

    fn exchange(
        conduit: &mut Conduit,
        command: &WorkerCommand,
        syscalls: &mut dyn SyscallHandler,
    ) -> Result<CommandOutcome, WorkerError> {
        write_frame(&mut conduit.writer, &command.to_payload())
            .map_err(|err| WorkerError::Protocol(format!("write failed: {err}")))?;
        loop {
            let frame = read_frame(&mut conduit.reader)
                .map_err(|err| WorkerError::Protocol(format!("read failed: {err}")))?
                .ok_or_else(|| WorkerError::Protocol("stream closed mid-exchange".into()))?;
            if frame.is_empty() {
                return Err(WorkerError::Protocol("empty reply frame".into()));
            }
            match WorkerReply::parse(&frame) {
                Some(WorkerReply::Ok(body)) => return Ok(CommandOutcome::Ok(body)),
                Some(WorkerReply::Error(body)) => return Ok(CommandOutcome::Fail(body)),
                Some(WorkerReply::Query(request)) => {
                    let answer = syscalls.syscall(&request);
                    write_frame(&mut conduit.writer, &answer)
                        .map_err(|err| WorkerError::Protocol(format!("write failed: {err}")))?;
                }
                None => {
                    return Err(WorkerError::Protocol(format!(
                        "unknown reply sentinel 0x{:02x}",
                        frame[0]
                    )));
                }
            }
        }
    }

    /// Asks the worker to exit and reaps the process. A worker that ignores
    /// the close command is killed.
    pub fn shutdown(&self) {
        let mut noop = |_request: &[u8]| Vec::new();
        if let Err(err) = self.send(&WorkerCommand::Close, &mut noop) {
            log::debug!("worker '{}' close command failed: {err}", self.label);
        }
        self.baton.lock().unwrap().kill();
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        self.baton.lock().unwrap().kill();
    }
}

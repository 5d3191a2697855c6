//! Command opcodes and reply sentinels carried inside netstring frames.

/// First payload byte of a command frame sent to the worker.
pub mod opcode {
    pub const EVALUATE: u8 = b'e';
    pub const EXECUTE: u8 = b's';
    pub const IMPORT: u8 = b'm';
    pub const DELIVER: u8 = b'd';
    pub const SNAPSHOT: u8 = b'w';
    pub const CLOSE: u8 = b'q';
}

/// First payload byte of a reply frame sent by the worker.
pub mod sentinel {
    pub const OK: u8 = b'.';
    pub const ERROR: u8 = b'!';
    pub const QUERY: u8 = b'?';
}

/// One instruction to a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Evaluate a chunk of guest code.
    Evaluate(Vec<u8>),
    /// Execute a named guest program.
    Execute(String),
    /// Import a guest module by path.
    ImportModule(String),
    /// Deliver an application message (opaque to the supervisor).
    Deliver(Vec<u8>),
    /// Write the worker's heap snapshot to the given path.
    WriteSnapshot(String),
    /// Shut the worker down cleanly.
    Close,
}

impl WorkerCommand {
    pub fn opcode(&self) -> u8 {
        match self {
            WorkerCommand::Evaluate(_) => opcode::EVALUATE,
            WorkerCommand::Execute(_) => opcode::EXECUTE,
            WorkerCommand::ImportModule(_) => opcode::IMPORT,
            WorkerCommand::Deliver(_) => opcode::DELIVER,
            WorkerCommand::WriteSnapshot(_) => opcode::SNAPSHOT,
            WorkerCommand::Close => opcode::CLOSE,
        }
    }

    /// Frame payload: single opcode byte followed by the argument bytes.
    pub fn to_payload(&self) -> Vec<u8> {
        let mut payload = vec![self.opcode()];
        match self {
            WorkerCommand::Evaluate(code) => payload.extend_from_slice(code),
            WorkerCommand::Execute(name) => payload.extend_from_slice(name.as_bytes()),
            WorkerCommand::ImportModule(path) => payload.extend_from_slice(path.as_bytes()),
            WorkerCommand::Deliver(message) => payload.extend_from_slice(message),
            WorkerCommand::WriteSnapshot(path) => payload.extend_from_slice(path.as_bytes()),
            WorkerCommand::Close => {}
        }
        payload
    }
}

/// One reply frame from a worker, decoded by sentinel byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerReply {
    /// Command completed; bytes are the result, often empty.
    Ok(Vec<u8>),
    /// Worker-reported fault; bytes describe the error.
    Error(Vec<u8>),
    /// Worker is blocked on a synchronous syscall; bytes are the request.
    Query(Vec<u8>),
}

impl WorkerReply {
    /// Splits a reply frame into sentinel and body. Returns `None` for an
    /// empty frame or an unknown sentinel; callers treat both as protocol
    /// violations.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        let (&first, rest) = frame.split_first()?;
        match first {
            sentinel::OK => Some(WorkerReply::Ok(rest.to_vec())),
            sentinel::ERROR => Some(WorkerReply::Error(rest.to_vec())),
            sentinel::QUERY => Some(WorkerReply::Query(rest.to_vec())),
            _ => None,
        }
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let (lead, body) = match self {
            WorkerReply::Ok(body) => (sentinel::OK, body),
            WorkerReply::Error(body) => (sentinel::ERROR, body),
            WorkerReply::Query(body) => (sentinel::QUERY, body),
        };
        let mut payload = vec![lead];
        payload.extend_from_slice(body);
        payload
    }
}

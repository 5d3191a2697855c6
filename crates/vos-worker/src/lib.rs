//! Wire protocol and process supervision for out-of-process vat workers.

pub mod netstring;
pub mod protocol;
pub mod supervisor;

pub use netstring::{FrameError, MAX_FRAME_LEN, encode, read_frame, write_frame};
pub use protocol::{WorkerCommand, WorkerReply, opcode, sentinel};
pub use supervisor::{CommandOutcome, SyscallHandler, WorkerError, WorkerProcess};

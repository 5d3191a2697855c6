//! Minimal worker binary for protocol smoke testing.
//!
//! Speaks the supervisor wire protocol over stdio: acknowledges every
//! command with OK, echoing the command body back. A deliver payload of the
//! form `query:<request>` makes the worker issue one QUERY syscall first and
//! fold the answer into its OK reply. `error:<detail>` makes it report an
//! ERROR. The close command ends the process.

use std::io::{self, Read, Write};
use std::process::ExitCode;

use vos_worker::netstring::{FrameError, read_frame, write_frame};
use vos_worker::protocol::{opcode, sentinel};

fn reply(writer: &mut impl Write, lead: u8, body: &[u8]) -> Result<(), FrameError> {
    let mut payload = vec![lead];
    payload.extend_from_slice(body);
    write_frame(writer, &payload)
}

fn handle_deliver(
    stdin: &mut impl Read,
    stdout: &mut impl Write,
    body: &[u8],
) -> Result<(), FrameError> {
    if let Some(request) = body.strip_prefix(b"query:") {
        reply(stdout, sentinel::QUERY, request)?;
        let answer = read_frame(stdin)?.unwrap_or_default();
        let mut ok_body = b"answered:".to_vec();
        ok_body.extend_from_slice(&answer);
        return reply(stdout, sentinel::OK, &ok_body);
    }
    if let Some(detail) = body.strip_prefix(b"error:") {
        return reply(stdout, sentinel::ERROR, detail);
    }
    reply(stdout, sentinel::OK, body)
}

fn run() -> Result<(), FrameError> {
    let mut stdin = io::stdin().lock();
    let mut stdout = io::stdout().lock();

    while let Some(frame) = read_frame(&mut stdin)? {
        let Some((&op, body)) = frame.split_first() else {
            reply(&mut stdout, sentinel::ERROR, b"empty command")?;
            continue;
        };
        match op {
            opcode::CLOSE => {
                reply(&mut stdout, sentinel::OK, b"")?;
                break;
            }
            opcode::DELIVER => handle_deliver(&mut stdin, &mut stdout, body)?,
            opcode::EVALUATE | opcode::EXECUTE | opcode::IMPORT | opcode::SNAPSHOT => {
                reply(&mut stdout, sentinel::OK, body)?;
            }
            other => {
                let detail = format!("unknown opcode 0x{other:02x}");
                reply(&mut stdout, sentinel::ERROR, detail.as_bytes())?;
            }
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("vos-proc-worker-echo: {err}");
            ExitCode::FAILURE
        }
    }
}

use std::io;

use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncBufRead;

use crate::config::{DEFAULT_MAX_ARGS, DEFAULT_MAX_LINE_LEN};

/// Per-connection framing limits. Oversized input is a protocol error, not
/// a reason to drop the connection.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FrameLimits {
    pub max_line_len: usize,
    pub max_args: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_line_len: DEFAULT_MAX_LINE_LEN,
            max_args: DEFAULT_MAX_ARGS,
        }
    }
}

fn protocol_error(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Split one frame into whitespace-delimited tokens. No quoting or
/// escaping: the protocol is line-oriented text, not binary-safe.
pub(crate) fn tokenize(line: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(line)
        .split_ascii_whitespace()
        .map(str::to_string)
        .collect()
}

/// Read one newline-terminated frame and tokenize it.
///
/// Returns `Ok(None)` on a clean EOF between frames. A frame longer than
/// `limits.max_line_len` (or with more than `limits.max_args` tokens) is
/// consumed up to its terminator and reported as `ErrorKind::InvalidData`,
/// so the caller can answer `ERR` on the same connection and keep reading.
pub(crate) async fn read_frame<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    limits: FrameLimits,
) -> io::Result<Option<Vec<String>>> {
    let mut line: Vec<u8> = Vec::new();
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            if line.is_empty() {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected EOF mid-frame",
            ));
        }
        if let Some(pos) = chunk.iter().position(|&b| b == b'\n') {
            let take = pos + 1;
            if line.len().saturating_add(take) > limits.max_line_len.saturating_add(2) {
                reader.consume(take);
                return Err(protocol_error("frame too long"));
            }
            line.extend_from_slice(&chunk[..take]);
            reader.consume(take);
            break;
        }
        if line.len().saturating_add(chunk.len()) > limits.max_line_len.saturating_add(2) {
            let take = chunk.len();
            reader.consume(take);
            discard_line(reader).await?;
            return Err(protocol_error("frame too long"));
        }
        let take = chunk.len();
        line.extend_from_slice(chunk);
        reader.consume(take);
    }
    while line.last().is_some_and(|&b| b == b'\n' || b == b'\r') {
        line.pop();
    }
    let tokens = tokenize(&line);
    if tokens.len() > limits.max_args {
        return Err(protocol_error("too many arguments"));
    }
    Ok(Some(tokens))
}

/// Consume input up to and including the next `\n` (or EOF) so the
/// connection can resynchronize after an oversized frame.
async fn discard_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<()> {
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            return Ok(());
        }
        match chunk.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                reader.consume(pos + 1);
                return Ok(());
            }
            None => {
                let take = chunk.len();
                reader.consume(take);
            }
        }
    }
}

// ── Replies ───────────────────────────────────────────────────────────────────

/// Everything a command handler can answer with. Serialization is the only
/// place that knows the wire conventions (`OK`, `(nil)`, `ERR <msg>`, ...).
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Reply {
    Ok,
    Pong,
    Nil,
    /// A bare scalar value (GET, ECHO, TYPE).
    Simple(String),
    Int(i64),
    /// One line per item (KEYS, INFO).
    Lines(Vec<String>),
    Err(String),
}

impl Reply {
    pub(crate) fn wrong_args(cmd: &str) -> Reply {
        Reply::Err(format!("wrong number of arguments for '{cmd}' command"))
    }

    pub(crate) fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Reply::Ok => out.extend_from_slice(b"OK\r\n"),
            Reply::Pong => out.extend_from_slice(b"PONG\r\n"),
            Reply::Nil => out.extend_from_slice(b"(nil)\r\n"),
            Reply::Simple(s) => {
                out.extend_from_slice(s.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Reply::Int(n) => {
                out.extend_from_slice(n.to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Reply::Lines(lines) if lines.is_empty() => {
                out.extend_from_slice(b"(empty list)\r\n");
            }
            Reply::Lines(lines) => {
                for line in lines {
                    out.extend_from_slice(line.as_bytes());
                    out.extend_from_slice(b"\r\n");
                }
            }
            Reply::Err(msg) => {
                out.extend_from_slice(b"ERR ");
                out.extend_from_slice(msg.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
        }
        out
    }
}

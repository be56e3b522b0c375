//! Framed text protocol spoken between clients and the coordinator.
//!
//! Requests are bulk arrays (`*<n>\r\n` followed by `$<len>\r\n<bytes>\r\n`
//! elements); replies are simple strings, errors, integers, or bulk strings.
//! Both decoders are restartable: a frame split across reads yields
//! `Ok(None)` until the remaining bytes arrive, and only then consumes the
//! frame from the buffer.

use std::fmt;
use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const CRLF: &[u8] = b"\r\n";

/// Upper bound on elements in one request array.
const MAX_ARRAY_LEN: usize = 64;
/// Upper bound on one bulk-string payload.
const MAX_BULK_LEN: usize = 8 * 1024 * 1024;
/// Upper bound on a header line (`*<n>` / `$<len>` / simple replies).
const MAX_LINE_LEN: usize = 64;

/// A fully parsed client command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Get { key: Vec<u8> },
    Set { key: Vec<u8>, value: Vec<u8> },
    Del { keys: Vec<Vec<u8>> },
}

/// A coordinator reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Error,
    Integer(u64),
    Bulk(Vec<u8>),
}

/// Frame-level failure.
///
/// `Malformed` means the peer sent bytes that can never become a valid frame;
/// the dispatcher answers `-ERROR` and closes. `Io` is a transport failure
/// surfaced through `Framed`; the connection is dropped silently.
#[derive(Debug)]
pub enum FrameError {
    Malformed(&'static str),
    Io(io::Error),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Malformed(what) => write!(f, "malformed frame: {what}"),
            FrameError::Io(err) => write!(f, "io error: {err}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<io::Error> for FrameError {
    fn from(err: io::Error) -> Self {
        FrameError::Io(err)
    }
}

/// Server-side codec: decodes `Command`s, encodes `Reply`s.
#[derive(Debug, Default)]
pub struct CommandCodec;

/// Client-side codec: encodes `Command`s, decodes `Reply`s.
#[derive(Debug, Default)]
pub struct ClientCodec;

impl Decoder for CommandCodec {
    type Item = Command;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Command>, FrameError> {
        match parse_command(src)? {
            Some((cmd, consumed)) => {
                src.advance(consumed);
                Ok(Some(cmd))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Reply> for CommandCodec {
    type Error = FrameError;

    fn encode(&mut self, reply: Reply, dst: &mut BytesMut) -> Result<(), FrameError> {
        encode_reply(&reply, dst);
        Ok(())
    }
}

impl Encoder<Command> for ClientCodec {
    type Error = FrameError;

    fn encode(&mut self, cmd: Command, dst: &mut BytesMut) -> Result<(), FrameError> {
        encode_command(&cmd, dst);
        Ok(())
    }
}

impl Decoder for ClientCodec {
    type Item = Reply;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Reply>, FrameError> {
        match parse_reply(src)? {
            Some((reply, consumed)) => {
                src.advance(consumed);
                Ok(Some(reply))
            }
            None => Ok(None),
        }
    }
}

/// Write the bulk-array form of `cmd` into `dst`.
pub fn encode_command(cmd: &Command, dst: &mut BytesMut) {
    let (verb, args): (&[u8], Vec<&[u8]>) = match cmd {
        Command::Get { key } => (b"GET", vec![key.as_slice()]),
        Command::Set { key, value } => (b"SET", vec![key.as_slice(), value.as_slice()]),
        Command::Del { keys } => (b"DEL", keys.iter().map(|k| k.as_slice()).collect()),
    };
    dst.put_u8(b'*');
    dst.put_slice((1 + args.len()).to_string().as_bytes());
    dst.put_slice(CRLF);
    put_bulk(dst, verb);
    for arg in args {
        put_bulk(dst, arg);
    }
}

/// Write the wire form of `reply` into `dst`.
pub fn encode_reply(reply: &Reply, dst: &mut BytesMut) {
    match reply {
        Reply::Ok => dst.put_slice(b"+OK\r\n"),
        Reply::Error => dst.put_slice(b"-ERROR\r\n"),
        Reply::Integer(n) => {
            dst.put_u8(b':');
            dst.put_slice(n.to_string().as_bytes());
            dst.put_slice(CRLF);
        }
        Reply::Bulk(data) => put_bulk(dst, data),
    }
}

fn put_bulk(dst: &mut BytesMut, data: &[u8]) {
    dst.put_u8(b'$');
    dst.put_slice(data.len().to_string().as_bytes());
    dst.put_slice(CRLF);
    dst.put_slice(data);
    dst.put_slice(CRLF);
}

/// Parse one command from the front of `buf`.
///
/// Returns the command and the number of bytes it occupied, `None` when more
/// bytes are needed, `Err` when the bytes can never form a valid frame.
pub fn parse_command(buf: &[u8]) -> Result<Option<(Command, usize)>, FrameError> {
    let mut pos = 0usize;
    let Some(header) = read_line(buf, &mut pos)? else {
        return Ok(None);
    };
    if header.first() != Some(&b'*') {
        return Err(FrameError::Malformed("expected array header"));
    }
    let count = parse_len(&header[1..], MAX_ARRAY_LEN)?;
    if count == 0 {
        return Err(FrameError::Malformed("empty request array"));
    }

    let mut parts: Vec<Vec<u8>> = Vec::with_capacity(count);
    for _ in 0..count {
        let Some(bulk_header) = read_line(buf, &mut pos)? else {
            return Ok(None);
        };
        if bulk_header.first() != Some(&b'$') {
            return Err(FrameError::Malformed("expected bulk string header"));
        }
        let len = parse_len(&bulk_header[1..], MAX_BULK_LEN)?;
        if buf.len() < pos + len + CRLF.len() {
            return Ok(None);
        }
        if &buf[pos + len..pos + len + CRLF.len()] != CRLF {
            return Err(FrameError::Malformed("bulk string missing terminator"));
        }
        parts.push(buf[pos..pos + len].to_vec());
        pos += len + CRLF.len();
    }

    let cmd = command_from_parts(parts)?;
    Ok(Some((cmd, pos)))
}

/// Parse one reply from the front of `buf`.
pub fn parse_reply(buf: &[u8]) -> Result<Option<(Reply, usize)>, FrameError> {
    let mut pos = 0usize;
    let Some(line) = read_line(buf, &mut pos)? else {
        return Ok(None);
    };
    match line.first() {
        Some(b'+') => Ok(Some((Reply::Ok, pos))),
        Some(b'-') => Ok(Some((Reply::Error, pos))),
        Some(b':') => {
            let n = parse_u64(&line[1..])?;
            Ok(Some((Reply::Integer(n), pos)))
        }
        Some(b'$') => {
            let len = parse_len(&line[1..], MAX_BULK_LEN)?;
            if buf.len() < pos + len + CRLF.len() {
                return Ok(None);
            }
            if &buf[pos + len..pos + len + CRLF.len()] != CRLF {
                return Err(FrameError::Malformed("bulk reply missing terminator"));
            }
            let data = buf[pos..pos + len].to_vec();
            Ok(Some((Reply::Bulk(data), pos + len + CRLF.len())))
        }
        _ => Err(FrameError::Malformed("unknown reply marker")),
    }
}

/// Verbs are case-sensitive; argument counts are fixed per verb.
fn command_from_parts(mut parts: Vec<Vec<u8>>) -> Result<Command, FrameError> {
    let args = parts.split_off(1);
    let verb = &parts[0];
    match verb.as_slice() {
        b"GET" => {
            if args.len() != 1 {
                return Err(FrameError::Malformed("GET takes exactly one key"));
            }
            let mut args = args;
            Ok(Command::Get {
                key: args.pop().unwrap_or_default(),
            })
        }
        b"SET" => {
            if args.len() != 2 {
                return Err(FrameError::Malformed("SET takes a key and a value"));
            }
            let mut args = args;
            let value = args.pop().unwrap_or_default();
            let key = args.pop().unwrap_or_default();
            Ok(Command::Set { key, value })
        }
        b"DEL" => {
            if args.is_empty() {
                return Err(FrameError::Malformed("DEL takes at least one key"));
            }
            Ok(Command::Del { keys: args })
        }
        _ => Err(FrameError::Malformed("unknown verb")),
    }
}

/// Read one `\r\n`-terminated line starting at `*pos`, advancing past it.
///
/// Returns the line without its terminator, or `None` when the terminator has
/// not arrived yet.
fn read_line<'a>(buf: &'a [u8], pos: &mut usize) -> Result<Option<&'a [u8]>, FrameError> {
    let rest = &buf[*pos..];
    match rest.windows(CRLF.len()).position(|w| w == CRLF) {
        Some(idx) if idx > MAX_LINE_LEN => Err(FrameError::Malformed("header line too long")),
        Some(idx) => {
            let line = &rest[..idx];
            *pos += idx + CRLF.len();
            Ok(Some(line))
        }
        None if rest.len() > MAX_LINE_LEN => Err(FrameError::Malformed("header line too long")),
        None => Ok(None),
    }
}

fn parse_len(digits: &[u8], max: usize) -> Result<usize, FrameError> {
    let n = parse_u64(digits)?;
    if n as usize > max {
        return Err(FrameError::Malformed("length exceeds limit"));
    }
    Ok(n as usize)
}

fn parse_u64(digits: &[u8]) -> Result<u64, FrameError> {
    if digits.is_empty() {
        return Err(FrameError::Malformed("empty number"));
    }
    let mut n: u64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(FrameError::Malformed("expected decimal digit"));
        }
        n = n
            .checked_mul(10)
            .and_then(|n| n.checked_add(u64::from(b - b'0')))
            .ok_or(FrameError::Malformed("number overflow"))?;
    }
    Ok(n)
}

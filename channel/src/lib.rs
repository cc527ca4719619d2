//! Control channel spoken by supervised workers on their stdout.
//!
//! A worker reports status to its supervisor in-band: each control message is
//! a JSON array encoded on a single line, interleaved with whatever plain
//! output the worker also writes. Element 0 is the message tag, element 1 an
//! optional payload:
//!
//! ```text
//! ["STDOUT","processing batch 7"]
//! ["HEARTBEAT"]
//! ["BUSY"]
//! ["IDLE"]
//! ["SHUTDOWN"]
//! ```
//!
//! The supervisor feeds captured stdout bytes into a [`Decoder`], which
//! reassembles lines across arbitrary chunk boundaries and degrades anything
//! unrecognizable into a [`Frame::Raw`] instead of dropping it. Workers write
//! messages with [`write_message`]:
//!
//! ```no_run
//! use dsup_channel::{write_message, Message};
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let mut out = tokio::io::stdout();
//!     write_message(&mut out, &Message::Heartbeat).await?;
//!     write_message(&mut out, &Message::Stdout("ready".into())).await?;
//!     Ok(())
//! }
//! ```
#![deny(missing_docs)]

use std::io;

use serde_json::{json, Value};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Tag of a passthrough log line.
pub const STDOUT: &str = "STDOUT";
/// Tag of a worker liveness beacon.
pub const HEARTBEAT: &str = "HEARTBEAT";
/// Tag reporting that the worker accepted work.
pub const BUSY: &str = "BUSY";
/// Tag reporting that the worker is waiting for work.
pub const IDLE: &str = "IDLE";
/// Tag announcing voluntary retirement; the supervisor will not respawn.
pub const SHUTDOWN: &str = "SHUTDOWN";

/// A control message exchanged between worker and supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A log line to re-emit under the supervisor's own logging.
    Stdout(String),
    /// Worker liveness beacon; resets the supervisor's hang deadline.
    Heartbeat,
    /// The worker accepted work.
    Busy,
    /// The worker is waiting for work.
    Idle,
    /// The worker is retiring and must not be restarted after it exits.
    Shutdown,
}

impl Message {
    /// Wire tag for this message.
    pub fn tag(&self) -> &'static str {
        match self {
            Message::Stdout(_) => STDOUT,
            Message::Heartbeat => HEARTBEAT,
            Message::Busy => BUSY,
            Message::Idle => IDLE,
            Message::Shutdown => SHUTDOWN,
        }
    }

    /// Encode the message as a single JSON line, without the terminator.
    pub fn encode(&self) -> String {
        let value = match self {
            Message::Stdout(text) => json!([STDOUT, text]),
            tagged => json!([tagged.tag()]),
        };
        value.to_string()
    }
}

/// One decoded line of worker stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// The line carried a well-formed control message.
    Message(Message),
    /// The line was not a control message; the original text is preserved.
    Raw(String),
}

/// Incremental line decoder for captured worker stdout.
///
/// Chunks may split a line at any byte. Bytes after the last terminator stay
/// buffered until the rest of the line arrives, so no output is ever lost or
/// decoded twice.
#[derive(Debug, Default)]
pub struct Decoder {
    buf: Vec<u8>,
}

impl Decoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Decoder::default()
    }

    /// Absorb a chunk of stdout and return the frames for every line it
    /// completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&byte| byte == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            frames.push(decode_line(&line[..line.len() - 1]));
        }
        frames
    }
}

fn decode_line(line: &[u8]) -> Frame {
    let raw = || Frame::Raw(String::from_utf8_lossy(line).into_owned());

    let value: Value = match serde_json::from_slice(line) {
        Ok(value) => value,
        Err(_) => return raw(),
    };
    let items = match value.as_array() {
        Some(items) => items,
        None => return raw(),
    };
    let tag = match items.first().and_then(Value::as_str) {
        Some(tag) => tag,
        None => return raw(),
    };
    match tag {
        STDOUT => match items.get(1).and_then(Value::as_str) {
            Some(text) => Frame::Message(Message::Stdout(text.to_owned())),
            None => raw(),
        },
        HEARTBEAT => Frame::Message(Message::Heartbeat),
        BUSY => Frame::Message(Message::Busy),
        IDLE => Frame::Message(Message::Idle),
        SHUTDOWN => Frame::Message(Message::Shutdown),
        _ => raw(),
    }
}

/// Write a message to the writer as a JSON encoded line.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(message.encode().as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_complete_line() {
        let mut decoder = Decoder::new();
        let frames = decoder.feed(b"[\"STDOUT\",\"hello\"]\n");
        assert_eq!(frames, vec![Frame::Message(Message::Stdout("hello".into()))]);
    }

    #[test]
    fn buffers_partial_lines_across_chunks() {
        let mut decoder = Decoder::new();
        assert!(decoder.feed(b"[\"STDO").is_empty());
        assert!(decoder.feed(b"UT\",\"split\"").is_empty());
        let frames = decoder.feed(b"]\n");
        assert_eq!(frames, vec![Frame::Message(Message::Stdout("split".into()))]);
    }

    #[test]
    fn decodes_several_lines_from_one_chunk() {
        let mut decoder = Decoder::new();
        let frames = decoder.feed(b"[\"BUSY\"]\n[\"IDLE\"]\n[\"SHUTDOWN\"]\n");
        assert_eq!(
            frames,
            vec![
                Frame::Message(Message::Busy),
                Frame::Message(Message::Idle),
                Frame::Message(Message::Shutdown),
            ]
        );
    }

    #[test]
    fn tolerates_carriage_returns_on_message_lines() {
        let mut decoder = Decoder::new();
        let frames = decoder.feed(b"[\"HEARTBEAT\"]\r\n");
        assert_eq!(frames, vec![Frame::Message(Message::Heartbeat)]);
    }

    #[test]
    fn preserves_lines_that_are_not_json() {
        let mut decoder = Decoder::new();
        let frames = decoder.feed(b"panic at src/main.rs:10\n");
        assert_eq!(frames, vec![Frame::Raw("panic at src/main.rs:10".into())]);
    }

    #[test]
    fn preserves_json_lines_that_are_not_messages() {
        let mut decoder = Decoder::new();
        // Object, unknown tag, missing payload, non-string tag: all raw.
        let frames = decoder.feed(b"{\"a\":1}\n[\"NOPE\"]\n[\"STDOUT\"]\n[17]\n");
        assert_eq!(
            frames,
            vec![
                Frame::Raw("{\"a\":1}".into()),
                Frame::Raw("[\"NOPE\"]".into()),
                Frame::Raw("[\"STDOUT\"]".into()),
                Frame::Raw("[17]".into()),
            ]
        );
    }

    #[test]
    fn decoding_continues_after_a_malformed_line() {
        let mut decoder = Decoder::new();
        let frames = decoder.feed(b"garbage\n[\"BUSY\"]\n");
        assert_eq!(
            frames,
            vec![Frame::Raw("garbage".into()), Frame::Message(Message::Busy)]
        );
    }

    #[test]
    fn empty_lines_come_back_raw() {
        let mut decoder = Decoder::new();
        assert_eq!(decoder.feed(b"\n"), vec![Frame::Raw(String::new())]);
    }

    #[test]
    fn encode_produces_single_line_arrays() {
        assert_eq!(Message::Heartbeat.encode(), "[\"HEARTBEAT\"]");
        assert_eq!(
            Message::Stdout("two\nlines".into()).encode(),
            "[\"STDOUT\",\"two\\nlines\"]"
        );
    }

    #[tokio::test]
    async fn written_messages_decode_back() {
        let mut wire = Vec::new();
        write_message(&mut wire, &Message::Busy).await.unwrap();
        write_message(&mut wire, &Message::Stdout("done".into()))
            .await
            .unwrap();

        let mut decoder = Decoder::new();
        let frames = decoder.feed(&wire);
        assert_eq!(
            frames,
            vec![
                Frame::Message(Message::Busy),
                Frame::Message(Message::Stdout("done".into())),
            ]
        );
    }
}

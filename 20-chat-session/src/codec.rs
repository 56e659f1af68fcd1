//! Newline-delimited JSON framing.
//!
//! One envelope per line keeps the stream readable with netcat-style tools.
//! [`FrameReader`] owns partial reads: bytes are buffered until a newline
//! arrives, so a frame split across several TCP segments decodes normally.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::{error::DecodeError, message::Envelope};

pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

pub fn encode(envelope: &Envelope) -> Vec<u8> {
    // Envelope contains only strings, integers, and JSON values, so
    // serialization cannot fail.
    let mut encoded = serde_json::to_vec(envelope).unwrap_or_default();
    encoded.push(b'\n');
    encoded
}

pub fn decode(frame: &[u8]) -> Result<Envelope, DecodeError> {
    let frame = trim_line_ending(frame);
    Ok(serde_json::from_slice(frame)?)
}

fn trim_line_ending(mut frame: &[u8]) -> &[u8] {
    while let [rest @ .., b'\n' | b'\r'] = frame {
        frame = rest;
    }
    frame
}

pub struct FrameReader<R> {
    reader: R,
    buf: Vec<u8>,
    max_len: usize,
    discarding: bool,
}

impl<R> FrameReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R, max_len: usize) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            max_len,
            discarding: false,
        }
    }

    /// Reads the next complete frame.
    ///
    /// The outer `io::Result` reports stream failure and `Ok(None)` a clean
    /// end of stream. The inner result reports a bad frame; the caller may
    /// keep reading after it.
    pub async fn next_frame(&mut self) -> io::Result<Option<Result<Vec<u8>, DecodeError>>> {
        let Self {
            reader,
            buf,
            max_len,
            discarding,
        } = self;

        loop {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                if *discarding {
                    *discarding = false;
                    return Ok(Some(Err(DecodeError::Oversized { limit: *max_len })));
                }
                if buf.iter().all(u8::is_ascii_whitespace) {
                    buf.clear();
                    return Ok(None);
                }
                let len = buf.len();
                buf.clear();
                return Ok(Some(Err(DecodeError::Truncated { len })));
            }

            let newline = available.iter().position(|byte| *byte == b'\n');
            let take = newline.map_or(available.len(), |index| index);
            if !*discarding {
                buf.extend_from_slice(&available[..take]);
            }
            let consumed = newline.map_or(take, |index| index + 1);
            reader.consume(consumed);

            if buf.len() > *max_len {
                buf.clear();
                *discarding = true;
            }

            if newline.is_none() {
                continue;
            }

            if *discarding {
                *discarding = false;
                return Ok(Some(Err(DecodeError::Oversized { limit: *max_len })));
            }

            let frame = std::mem::take(buf);
            if trim_line_ending(&frame).is_empty() {
                continue;
            }
            return Ok(Some(Ok(frame)));
        }
    }
}

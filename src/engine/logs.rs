//! Container log decoding and following.
//!
//! Non-TTY containers multiplex stdout and stderr into frames:
//!
//! ```text
//!   ┌──────┬─────────┬────────────────┬─────────────┐
//!   │ type │ 0 0 0   │ size (u32, BE) │ payload ... │
//!   └──────┴─────────┴────────────────┴─────────────┘
//!    1 byte  3 bytes     4 bytes        size bytes
//! ```
//!
//! TTY containers send the raw byte stream. The decoder detects which one it
//! is looking at from the first bytes. Lines may span frames, so partial
//! lines are buffered per stream until their newline arrives.

use chrono::{DateTime, FixedOffset};
use regex::Regex;
use std::sync::LazyLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::error::{EngineError, Result};

const FRAME_HEADER_LEN: usize = 8;

static LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[?(?<timestamp>[^\s\]]*)]?\s+(?<entry>.*?)\s*$").expect("static regex")
});

/// Which output stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogStream {
    Stdin,
    Stdout,
    Stderr,
    /// TTY output, streams are not separated.
    Raw,
}

impl LogStream {
    fn from_frame_type(kind: u8) -> Option<Self> {
        match kind {
            0 => Some(LogStream::Stdin),
            1 => Some(LogStream::Stdout),
            2 => Some(LogStream::Stderr),
            _ => None,
        }
    }

    fn slot(self) -> usize {
        match self {
            LogStream::Stdin => 0,
            LogStream::Stdout => 1,
            LogStream::Stderr => 2,
            LogStream::Raw => 3,
        }
    }
}

/// One decoded log line.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub stream: LogStream,
    /// Engine timestamp, present when logs were requested with timestamps.
    pub timestamp: Option<DateTime<FixedOffset>>,
    pub text: String,
}

impl LogLine {
    /// Split a raw line into timestamp and text. Lines without a parsable
    /// timestamp keep their full text.
    pub fn parse(stream: LogStream, raw: &str) -> Self {
        let raw = raw.trim_end_matches(['\r', '\n']);
        if let Some(caps) = LINE_RE.captures(raw)
            && let Ok(timestamp) = DateTime::parse_from_rfc3339(&caps["timestamp"])
        {
            return Self {
                stream,
                timestamp: Some(timestamp),
                text: caps["entry"].to_string(),
            };
        }
        Self {
            stream,
            timestamp: None,
            text: raw.to_string(),
        }
    }
}

/// What a follow callback wants after seeing a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogControl {
    Continue,
    Stop,
}

/// Incremental decoder for framed or raw log output.
#[derive(Debug, Default)]
pub struct LogDecoder {
    buffer: Vec<u8>,
    framed: Option<bool>,
    partial: [Vec<u8>; 4],
}

impl LogDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<LogLine> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();

        if self.framed.is_none() {
            if self.buffer.len() < FRAME_HEADER_LEN {
                return lines;
            }
            self.framed = Some(looks_framed(&self.buffer));
        }

        if self.framed == Some(true) {
            while let Some((stream, size)) = frame_header(&self.buffer) {
                let end = FRAME_HEADER_LEN + size;
                if self.buffer.len() < end {
                    break;
                }
                let payload: Vec<u8> = self.buffer.drain(..end).skip(FRAME_HEADER_LEN).collect();
                self.split_lines(stream, &payload, &mut lines);
            }
        } else {
            let payload = std::mem::take(&mut self.buffer);
            self.split_lines(LogStream::Raw, &payload, &mut lines);
        }
        lines
    }

    /// Flush buffered partial lines at end of output.
    pub fn finish(&mut self) -> Vec<LogLine> {
        let mut lines = Vec::new();
        if !self.buffer.is_empty() {
            // Too short to ever become a frame.
            let rest = std::mem::take(&mut self.buffer);
            self.split_lines(LogStream::Raw, &rest, &mut lines);
        }
        for stream in [
            LogStream::Stdin,
            LogStream::Stdout,
            LogStream::Stderr,
            LogStream::Raw,
        ] {
            let rest = std::mem::take(&mut self.partial[stream.slot()]);
            if !rest.is_empty() {
                lines.push(LogLine::parse(stream, &String::from_utf8_lossy(&rest)));
            }
        }
        lines
    }

    fn split_lines(&mut self, stream: LogStream, payload: &[u8], out: &mut Vec<LogLine>) {
        let partial = &mut self.partial[stream.slot()];
        for byte in payload {
            if *byte == b'\n' {
                let line = std::mem::take(partial);
                out.push(LogLine::parse(stream, &String::from_utf8_lossy(&line)));
            } else {
                partial.push(*byte);
            }
        }
    }
}

fn looks_framed(buffer: &[u8]) -> bool {
    LogStream::from_frame_type(buffer[0]).is_some() && buffer[1..4] == [0, 0, 0]
}

fn frame_header(buffer: &[u8]) -> Option<(LogStream, usize)> {
    if buffer.len() < FRAME_HEADER_LEN {
        return None;
    }
    let stream = LogStream::from_frame_type(buffer[0]).unwrap_or(LogStream::Stdout);
    let size = u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]) as usize;
    Some((stream, size))
}

/// Decode a complete log body in one go.
pub fn decode_all(body: &[u8]) -> Vec<LogLine> {
    let mut decoder = LogDecoder::new();
    let mut lines = decoder.push(body);
    lines.extend(decoder.finish());
    lines
}

/// How a follow subscription ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowOutcome {
    /// The callback returned [`LogControl::Stop`].
    Stopped,
    /// The engine closed the stream (container exited).
    Ended,
    /// The handle was cancelled.
    Cancelled,
}

/// Handle to a background log-follow task.
///
/// Cancelling or dropping the handle ends the task, which drops the response
/// and closes its connection.
#[derive(Debug)]
pub struct LogHandle {
    container_id: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<FollowOutcome>>>,
}

impl LogHandle {
    pub(crate) fn spawn<F>(
        container_id: &str,
        url: String,
        response: reqwest::Response,
        callback: F,
        cancel: CancellationToken,
    ) -> Self
    where
        F: FnMut(&LogLine) -> LogControl + Send + 'static,
    {
        let task = tokio::spawn(pump(url, response, callback, cancel.clone()));
        Self {
            container_id: container_id.to_string(),
            cancel,
            task: Some(task),
        }
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Ask the task to stop without waiting for it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Cancel the subscription and wait until the task has ended.
    pub async fn finish(mut self) -> Result<FollowOutcome> {
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for the subscription to end on its own.
    pub async fn wait(mut self) -> Result<FollowOutcome> {
        self.join().await
    }

    async fn join(&mut self) -> Result<FollowOutcome> {
        match self.task.take() {
            Some(task) => task.await.unwrap_or_else(|e| {
                Err(EngineError::Transport {
                    url: self.container_id.clone(),
                    reason: format!("log task failed: {}", e),
                })
            }),
            None => Ok(FollowOutcome::Cancelled),
        }
    }
}

impl Drop for LogHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            self.cancel.cancel();
            task.abort();
        }
    }
}

async fn pump<F>(
    url: String,
    mut response: reqwest::Response,
    mut callback: F,
    cancel: CancellationToken,
) -> Result<FollowOutcome>
where
    F: FnMut(&LogLine) -> LogControl + Send + 'static,
{
    let mut decoder = LogDecoder::new();
    let mut lines_seen = 0u64;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::debug!("Log follow on {} cancelled after {} lines", url, lines_seen);
                return Ok(FollowOutcome::Cancelled);
            }

            chunk = response.chunk() => {
                let (lines, ended) = match chunk {
                    Ok(Some(bytes)) => (decoder.push(&bytes), false),
                    Ok(None) => (decoder.finish(), true),
                    Err(e) => return Err(EngineError::transport(&url, e)),
                };
                for line in &lines {
                    lines_seen += 1;
                    tracing::trace!("log {:?}: {}", line.stream, line.text);
                    if callback(line) == LogControl::Stop {
                        return Ok(FollowOutcome::Stopped);
                    }
                }
                if ended {
                    tracing::debug!("Log follow on {} ended after {} lines", url, lines_seen);
                    return Ok(FollowOutcome::Ended);
                }
            }
        }
    }
}

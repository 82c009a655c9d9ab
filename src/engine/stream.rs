//! Streaming JSON decoding for build, pull and push responses.
//!
//! The engine answers these calls with one long-lived body carrying a
//! sequence of JSON objects. Object boundaries do not line up with the
//! HTTP chunks, so the decoder buffers bytes until a complete value can be
//! parsed:
//!
//! ```text
//!   chunk 1: {"status":"Downloading","progressDe
//!   chunk 2: tail":{"current":10,"total":20}}\n{"status":"Done"}\n
//!            └──────── one event ──────────┘   └─ one event ─┘
//! ```
//!
//! Malformed input is skipped up to the next line break and logged as a
//! warning. It never aborts the stream.
//!
//! Every byte is scanned once. The decoder tracks nesting depth and string
//! state so that `serde_json` only sees a candidate once its outermost
//! object or array has closed.

use std::collections::{HashMap, VecDeque};

use serde_json::Value;
use tokio::sync::OwnedSemaphorePermit;

use crate::engine::error::{EngineError, Result};

/// Incremental decoder for a concatenated stream of JSON objects and arrays.
#[derive(Debug, Default)]
pub struct JsonStreamDecoder {
    buffer: Vec<u8>,
    /// Bytes of `buffer` already scanned.
    scanned: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
    /// Discarding a malformed fragment up to the next newline.
    skipping: bool,
    warnings: usize,
}

impl JsonStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and return every value it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(chunk);
        let mut values = Vec::new();
        // Start of the value (or malformed fragment) being accumulated.
        let mut start = 0;

        for i in self.scanned..self.buffer.len() {
            let b = self.buffer[i];

            if self.skipping {
                if b == b'\n' {
                    self.skip(start, i + 1, "not valid JSON");
                    start = i + 1;
                }
                continue;
            }

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                continue;
            }

            match b {
                b'{' | b'[' => self.depth += 1,
                b'"' if self.depth > 0 => self.in_string = true,
                b'}' | b']' if self.depth > 0 => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        match serde_json::from_slice::<Value>(&self.buffer[start..=i]) {
                            Ok(value) => {
                                values.push(value);
                                start = i + 1;
                            }
                            Err(_) => self.skipping = true,
                        }
                    }
                }
                // A value broken across lines is only given up on once it
                // can no longer be completed.
                b'\n' if self.depth > 0 => {
                    if let Err(e) = serde_json::from_slice::<Value>(&self.buffer[start..i])
                        && !e.is_eof()
                    {
                        self.skip(start, i + 1, &e.to_string());
                        start = i + 1;
                    }
                }
                _ if self.depth > 0 => {}
                b if b.is_ascii_whitespace() => start = i + 1,
                _ => self.skipping = true,
            }
        }

        self.buffer.drain(..start);
        self.scanned = self.buffer.len();
        values
    }

    /// Drop `buffer[from..to]` as malformed and reset the scan state.
    fn skip(&mut self, from: usize, to: usize, reason: &str) {
        let skipped = String::from_utf8_lossy(&self.buffer[from..to]);
        tracing::warn!(
            "Skipping malformed stream chunk ({}): {}",
            reason,
            skipped.trim()
        );
        self.warnings += 1;
        self.depth = 0;
        self.in_string = false;
        self.escaped = false;
        self.skipping = false;
    }

    /// Signal end of input. Leftover bytes that never formed a value are
    /// dropped with a warning.
    pub fn finish(&mut self) {
        let rest = String::from_utf8_lossy(&self.buffer).trim().to_string();
        if !rest.is_empty() {
            tracing::warn!("Dropping incomplete stream data at end of response: {}", rest);
            self.warnings += 1;
        }
        self.buffer.clear();
        self.scanned = 0;
        self.depth = 0;
        self.in_string = false;
        self.escaped = false;
        self.skipping = false;
    }

    /// Number of malformed fragments skipped so far.
    pub fn warnings(&self) -> usize {
        self.warnings
    }

    /// Bytes held back waiting for the rest of a value.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

/// One decoded event from a build, pull or push stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Layer transfer progress.
    Progress {
        id: Option<String>,
        status: Option<String>,
        current: Option<u64>,
        total: Option<u64>,
        /// Pre-rendered progress bar, when the engine sends one.
        progress: Option<String>,
    },
    /// Plain status line (`Pulling from library/alpine`, `Digest: ...`).
    Status { id: Option<String>, status: String },
    /// Build output line.
    Stream(String),
    /// Error reported inside the stream.
    Error {
        message: String,
        detail: Option<String>,
    },
    /// Anything else (e.g. `aux` build results).
    Other(Value),
}

impl StreamEvent {
    /// Classify a decoded value. Errors win over progress, progress over status.
    pub fn classify(value: Value) -> Self {
        let text = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);

        if let Some(error) = text("error") {
            let detail = value
                .get("errorDetail")
                .and_then(|d| d.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string);
            return StreamEvent::Error {
                message: detail.clone().unwrap_or(error),
                detail,
            };
        }

        let progress_detail = value.get("progressDetail");
        let current = progress_detail
            .and_then(|d| d.get("current"))
            .and_then(Value::as_u64);
        let total = progress_detail
            .and_then(|d| d.get("total"))
            .and_then(Value::as_u64);
        if current.is_some() || total.is_some() {
            return StreamEvent::Progress {
                id: text("id"),
                status: text("status"),
                current,
                total,
                progress: text("progress"),
            };
        }

        if let Some(status) = text("status") {
            return StreamEvent::Status {
                id: text("id"),
                status,
            };
        }
        if let Some(stream) = text("stream") {
            return StreamEvent::Stream(stream);
        }
        StreamEvent::Other(value)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StreamEvent::Error { .. })
    }
}

/// Renders stream events through `tracing`, keeping per-layer progress so
/// that each layer is reported once per ten percent instead of per chunk.
#[derive(Debug)]
pub struct ProgressLog {
    operation: String,
    layers: HashMap<String, u64>,
}

impl ProgressLog {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            layers: HashMap::new(),
        }
    }

    pub fn handle(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Progress {
                id,
                status,
                current,
                total,
                ..
            } => {
                let (Some(current), Some(total)) = (current, total) else {
                    return;
                };
                if *total == 0 {
                    return;
                }
                let percent = current.saturating_mul(100) / total;
                let layer = id.clone().unwrap_or_default();
                let last = self.layers.entry(layer.clone()).or_insert(0);
                if percent >= *last + 10 || (percent == 100 && *last != 100) {
                    *last = percent;
                    tracing::info!(
                        "{} {} {}: {}%",
                        self.operation,
                        layer,
                        status.as_deref().unwrap_or(""),
                        percent
                    );
                }
            }
            StreamEvent::Status { id, status } => match id {
                Some(id) => tracing::info!("{} {}: {}", self.operation, id, status),
                None => tracing::info!("{} {}", self.operation, status),
            },
            StreamEvent::Stream(line) => {
                let line = line.trim_end();
                if !line.is_empty() {
                    tracing::info!("{} | {}", self.operation, line);
                }
            }
            StreamEvent::Error { message, .. } => {
                tracing::error!("{} failed: {}", self.operation, message);
            }
            StreamEvent::Other(value) => tracing::debug!("{} {}", self.operation, value),
        }
    }
}

/// A live streaming response. Holds one engine connection until dropped.
pub struct EventStream {
    url: String,
    response: Option<reqwest::Response>,
    decoder: JsonStreamDecoder,
    pending: VecDeque<StreamEvent>,
    errors: Vec<String>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("url", &self.url)
            .field("open", &self.response.is_some())
            .field("errors", &self.errors.len())
            .finish()
    }
}

impl EventStream {
    pub(crate) fn new(
        url: String,
        response: reqwest::Response,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            url,
            response: Some(response),
            decoder: JsonStreamDecoder::new(),
            pending: VecDeque::new(),
            errors: Vec::new(),
            _permit: permit,
        }
    }

    /// Next decoded event, or `None` once the engine closed the body.
    pub async fn next_event(&mut self) -> Result<Option<StreamEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                if let StreamEvent::Error { message, .. } = &event {
                    self.errors.push(message.clone());
                }
                return Ok(Some(event));
            }

            let Some(response) = self.response.as_mut() else {
                return Ok(None);
            };
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let values = self.decoder.push(&chunk);
                    self.pending
                        .extend(values.into_iter().map(StreamEvent::classify));
                }
                Ok(None) => {
                    self.decoder.finish();
                    self.response = None;
                }
                Err(e) => {
                    self.response = None;
                    return Err(EngineError::transport(&self.url, e));
                }
            }
        }
    }

    /// Error messages seen so far.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Malformed fragments skipped so far.
    pub fn warnings(&self) -> usize {
        self.decoder.warnings()
    }

    /// Drain the stream, handing every event to `on_event`. Fails if any
    /// error event was observed.
    pub async fn drain_with<F>(mut self, operation: &str, mut on_event: F) -> Result<()>
    where
        F: FnMut(&StreamEvent),
    {
        while let Some(event) = self.next_event().await? {
            on_event(&event);
        }
        match self.errors.first() {
            None => Ok(()),
            Some(first) => Err(EngineError::Stream {
                operation: operation.to_string(),
                message: first.clone(),
                count: self.errors.len(),
            }),
        }
    }

    /// Drain the stream and report progress through `tracing`.
    pub async fn finish(self, operation: &str) -> Result<()> {
        let mut log = ProgressLog::new(operation);
        self.drain_with(operation, |event| log.handle(event)).await
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn test_object_straddling_chunks_yields_one_event() {
        let mut decoder = JsonStreamDecoder::new();
        let first = decoder.push(br#"{"status":"Downloading","progressDe"#);
        assert!(first.is_empty());
        assert!(decoder.pending_bytes() > 0);

        let second = decoder.push(br#"tail":{"current":10,"total":20},"id":"abc"}"#);
        assert_eq!(second.len(), 1);
        assert_eq!(decoder.pending_bytes(), 0);
        assert_eq!(
            StreamEvent::classify(second[0].clone()),
            StreamEvent::Progress {
                id: Some("abc".to_string()),
                status: Some("Downloading".to_string()),
                current: Some(10),
                total: Some(20),
                progress: None,
            }
        );
    }

    #[test]
    fn test_several_values_in_one_chunk() {
        let mut decoder = JsonStreamDecoder::new();
        let values = decoder.push(b"{\"status\":\"a\"}\r\n{\"status\":\"b\"}{\"stream\":\"c\"}\n");
        assert_eq!(values.len(), 3);
        assert_eq!(decoder.warnings(), 0);
    }

    #[test]
    fn test_split_inside_multibyte_character() {
        let text = "{\"stream\":\"gr\u{fc}n\"}";
        let bytes = text.as_bytes();
        let split = text.find('\u{fc}').unwrap() + 1;

        let mut decoder = JsonStreamDecoder::new();
        assert!(decoder.push(&bytes[..split]).is_empty());
        let values = decoder.push(&bytes[split..]);
        assert_eq!(values, vec![json!({"stream": "gr\u{fc}n"})]);
    }

    #[test]
    fn test_malformed_line_is_skipped() {
        let mut decoder = JsonStreamDecoder::new();
        let values = decoder.push(b"{\"status\":\"a\"}\nnot json at all\n{\"status\":\"b\"}\n");
        assert_eq!(values, vec![json!({"status": "a"}), json!({"status": "b"})]);
        assert_eq!(decoder.warnings(), 1);
    }

    #[test]
    fn test_malformed_fragment_waits_for_line_end() {
        let mut decoder = JsonStreamDecoder::new();
        assert!(decoder.push(b"oops").is_empty());
        let values = decoder.push(b" still oops\n{\"status\":\"ok\"}");
        assert_eq!(values, vec![json!({"status": "ok"})]);
        assert_eq!(decoder.warnings(), 1);
    }

    #[test]
    fn test_nested_object_in_malformed_line_is_not_an_event() {
        let mut decoder = JsonStreamDecoder::new();
        let values = decoder.push(b"{\"aux\":{\"error\":\"x\"} garbage}\n{\"status\":\"ok\"}\n");
        assert_eq!(values, vec![json!({"status": "ok"})]);
        assert_eq!(decoder.warnings(), 1);
    }

    #[test]
    fn test_braces_inside_strings_do_not_end_a_value() {
        let mut decoder = JsonStreamDecoder::new();
        let values = decoder.push(br#"{"stream":"} {\"x\": [\n"}"#);
        assert_eq!(values, vec![json!({"stream": "} {\"x\": [\n"})]);
        assert_eq!(decoder.warnings(), 0);
    }

    #[test]
    fn test_large_value_fed_byte_by_byte() {
        let layers: Vec<_> = (0..2_000).map(|i| json!({"id": i, "digest": "sha256:0"})).collect();
        let text = format!("{}\n", json!({"aux": {"layers": layers}}));

        let mut decoder = JsonStreamDecoder::new();
        let mut values = Vec::new();
        for byte in text.as_bytes() {
            values.extend(decoder.push(std::slice::from_ref(byte)));
        }
        assert_eq!(values.len(), 1);
        assert_eq!(values[0]["aux"]["layers"].as_array().unwrap().len(), 2_000);
        assert_eq!(decoder.pending_bytes(), 0);
        assert_eq!(decoder.warnings(), 0);
    }

    #[test]
    fn test_value_split_across_lines_still_decodes() {
        let mut decoder = JsonStreamDecoder::new();
        assert!(decoder.push(b"{\"status\":\n").is_empty());
        let values = decoder.push(b"\"ok\"}\n");
        assert_eq!(values, vec![json!({"status": "ok"})]);
        assert_eq!(decoder.warnings(), 0);
    }

    #[test]
    fn test_finish_drops_incomplete_tail() {
        let mut decoder = JsonStreamDecoder::new();
        assert!(decoder.push(b"{\"status\":").is_empty());
        decoder.finish();
        assert_eq!(decoder.warnings(), 1);
        assert_eq!(decoder.pending_bytes(), 0);
    }

    #[test]
    fn test_classify_error_prefers_detail_message() {
        let event = StreamEvent::classify(json!({
            "error": "pull failed",
            "errorDetail": {"message": "manifest unknown"}
        }));
        assert!(event.is_error());
        assert_eq!(
            event,
            StreamEvent::Error {
                message: "manifest unknown".to_string(),
                detail: Some("manifest unknown".to_string()),
            }
        );
    }

    #[test]
    fn test_classify_status_with_empty_progress_detail() {
        let event = StreamEvent::classify(json!({
            "status": "Pulling fs layer",
            "progressDetail": {},
            "id": "abc"
        }));
        assert_eq!(
            event,
            StreamEvent::Status {
                id: Some("abc".to_string()),
                status: "Pulling fs layer".to_string(),
            }
        );
    }

    #[test]
    fn test_classify_stream_and_other() {
        assert_eq!(
            StreamEvent::classify(json!({"stream": "Step 1/2 : FROM alpine\n"})),
            StreamEvent::Stream("Step 1/2 : FROM alpine\n".to_string())
        );
        let aux = json!({"aux": {"ID": "sha256:abc"}});
        assert_eq!(StreamEvent::classify(aux.clone()), StreamEvent::Other(aux));
    }
}

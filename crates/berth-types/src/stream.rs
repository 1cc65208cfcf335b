use serde::{Deserialize, Serialize};

/// One record of the newline-delimited progress protocol used by every
/// long-running operation (pulls, compose runs). A stream ends with exactly
/// one terminal record: `error` or `done`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Discrete phase marker ("pulling image", "starting services").
    Step { message: String },
    /// Literal echo of a sub-command about to run.
    Cmd { message: String },
    /// Binary-transfer progress keyed by a layer/item id.
    Progress { id: String, current: u64, total: u64 },
    /// Free-text output line.
    Info { message: String },
    /// Terminal: the operation failed.
    Error { message: String },
    /// Terminal: the operation succeeded.
    Done { message: String },
}

impl StreamEvent {
    pub fn info(message: impl Into<String>) -> Self {
        StreamEvent::Info {
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        StreamEvent::Error {
            message: message.into(),
        }
    }

    pub fn done(message: impl Into<String>) -> Self {
        StreamEvent::Done {
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Error { .. } | StreamEvent::Done { .. })
    }

    /// Serialized wire form: one JSON object followed by a newline.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        line.push('\n');
        line
    }
}

/// Accumulates arbitrarily-chunked bytes and yields complete lines.
/// Transports deliver chunk boundaries anywhere, so a trailing partial line
/// stays buffered until the next chunk (or `finish`).
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Drains whatever is left after the transport closed.
    pub fn finish(self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.buf).into_owned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_handles_arbitrary_chunk_boundaries() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(b"first li").is_empty());
        let lines = decoder.push(b"ne\nsecond\nthird par");
        assert_eq!(lines, vec!["first line".to_string(), "second".to_string()]);
        let lines = decoder.push(b"t\n");
        assert_eq!(lines, vec!["third part".to_string()]);
        assert_eq!(decoder.finish(), None);
    }

    #[test]
    fn decoder_yields_partial_tail_on_finish() {
        let mut decoder = LineDecoder::new();
        decoder.push(b"done\ntail without newline");
        assert_eq!(decoder.finish().as_deref(), Some("tail without newline"));
    }

    #[test]
    fn decoder_strips_carriage_returns() {
        let mut decoder = LineDecoder::new();
        let lines = decoder.push(b"windows line\r\n");
        assert_eq!(lines, vec!["windows line".to_string()]);
    }

    #[test]
    fn events_round_trip_and_flag_terminals() {
        let event = StreamEvent::Progress {
            id: "f90a...".to_string(),
            current: 512,
            total: 2048,
        };
        let line = event.to_line();
        assert!(line.ends_with('\n'));
        let parsed: StreamEvent = serde_json::from_str(line.trim()).expect("parse");
        assert_eq!(parsed, event);
        assert!(!parsed.is_terminal());
        assert!(StreamEvent::done("ok").is_terminal());
        assert!(StreamEvent::error("boom").is_terminal());
    }
}

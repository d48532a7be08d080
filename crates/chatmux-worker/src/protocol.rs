//! Line framing and parsing for the worker wire protocol.

use crate::error::WorkerError;
use crate::Result;
use chatmux_core::types::{WorkerCommand, WorkerEvent, WorkerResponse};

/// One parsed inbound line from a worker.
#[derive(Debug)]
pub enum WorkerLine {
    /// A response correlated to a pending request.
    Response(WorkerResponse),

    /// A streamed event belonging to the turn in flight.
    Event(WorkerEvent),
}

/// Parse a complete line into a response or event.
pub fn parse_line(line: &str) -> Result<WorkerLine> {
    let value: serde_json::Value = serde_json::from_str(line)
        .map_err(|e| WorkerError::Protocol(format!("invalid JSON: {}", e)))?;

    match value.get("type").and_then(serde_json::Value::as_str) {
        Some("response") => {
            let response = serde_json::from_value(value)
                .map_err(|e| WorkerError::Protocol(format!("invalid response: {}", e)))?;
            Ok(WorkerLine::Response(response))
        }
        Some(_) => {
            let event = serde_json::from_value(value)
                .map_err(|e| WorkerError::Protocol(format!("invalid event: {}", e)))?;
            Ok(WorkerLine::Event(event))
        }
        None => Err(WorkerError::Protocol("missing type field".to_string())),
    }
}

/// Serialize a command as one newline-terminated frame.
pub fn encode_command(command: &WorkerCommand) -> Result<String> {
    let mut line = serde_json::to_string(command)
        .map_err(|e| WorkerError::Protocol(format!("unserializable command: {}", e)))?;
    line.push('\n');
    Ok(line)
}

/// Accumulates raw bytes and yields complete lines.
///
/// Handles arbitrary chunk boundaries: a line split across reads is buffered
/// until its terminating newline arrives.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain all complete lines it produced.
    ///
    /// Empty lines are skipped; a trailing `\r` is stripped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut raw: Vec<u8> = self.buf.drain(..=pos).collect();
            raw.pop(); // the newline
            if raw.last() == Some(&b'\r') {
                raw.pop();
            }
            if raw.is_empty() {
                continue;
            }
            lines.push(String::from_utf8_lossy(&raw).into_owned());
        }
        lines
    }

    /// Bytes held back waiting for a newline.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line() {
        let mut buf = LineBuffer::new();
        let lines = buf.push(b"{\"type\":\"message_start\"}\n");
        assert_eq!(lines, vec!["{\"type\":\"message_start\"}"]);
        assert_eq!(buf.pending(), 0);
    }

    #[test]
    fn test_split_across_chunks() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"{\"type\":\"text_de").is_empty());
        assert!(buf.push(b"lta\",\"text\":\"a\"").is_empty());
        let lines = buf.push(b"}\n{\"type\":\"message_end\"}\n");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "{\"type\":\"text_delta\",\"text\":\"a\"}");
        assert_eq!(lines[1], "{\"type\":\"message_end\"}");
    }

    #[test]
    fn test_byte_at_a_time() {
        let input = b"{\"type\":\"message_end\"}\n";
        let mut buf = LineBuffer::new();
        let mut lines = Vec::new();
        for byte in input {
            lines.extend(buf.push(std::slice::from_ref(byte)));
        }
        assert_eq!(lines, vec!["{\"type\":\"message_end\"}"]);
    }

    #[test]
    fn test_crlf_and_blank_lines() {
        let mut buf = LineBuffer::new();
        let lines = buf.push(b"{\"a\":1}\r\n\n\n{\"b\":2}\n");
        assert_eq!(lines, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn test_parse_response_line() {
        let line = r#"{"type":"response","id":"req_1","ok":true,"data":{"pong":true}}"#;
        match parse_line(line).unwrap() {
            WorkerLine::Response(resp) => {
                assert_eq!(resp.id, "req_1");
                assert!(resp.ok);
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_event_line() {
        let line = r#"{"type":"tool_call","tool":"bash"}"#;
        match parse_line(line).unwrap() {
            WorkerLine::Event(WorkerEvent::ToolCall { tool, .. }) => assert_eq!(tool, "bash"),
            other => panic!("expected tool_call, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_line("not json").is_err());
        assert!(parse_line(r#"{"no":"type"}"#).is_err());
        assert!(parse_line(r#"{"type":"no_such_event"}"#).is_err());
    }

    #[test]
    fn test_encode_command_newline_terminated() {
        let cmd = WorkerCommand::new("req_1", "ping", None);
        let line = encode_command(&cmd).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }
}

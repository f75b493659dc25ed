//! Translation of acpx stdout into [`RuntimeEvent`]s.
//!
//! acpx writes one JSON value per line. Two families matter:
//!
//! | Line shape                                               | Event                         |
//! |----------------------------------------------------------|-------------------------------|
//! | `session/update` + `agent_message_chunk` (text)          | `text_delta { stream: output }` |
//! | `session/update` + `agent_thought_chunk` (text)          | `text_delta { stream: thought }` |
//! | `session/update` + `tool_call` / `tool_call_update`      | `tool_call { "<title> (<status>)" }` |
//! | `{ "type": "error", code, message, retryable? }`         | `error`                       |
//! | `{ "type": "done", stopReason }`                         | `done`                        |
//! | JSON-RPC response with `result.stopReason`               | `done`                        |
//! | anything else (e.g. `session/load` traffic)              | skipped                       |
//!
//! Text is forwarded byte-for-byte; adjacent chunks concatenate to the
//! full message, so leading and trailing whitespace is significant.

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_stream::wrappers::SplitStream;
use tracing::{debug, warn};

/// Which channel a text delta belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextStream {
    Thought,
    Output,
}

/// Normalized event produced during a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    TextDelta {
        stream: TextStream,
        text: String,
    },
    ToolCall {
        text: String,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retryable: Option<bool>,
    },
    Done {
        #[serde(
            rename = "stopReason",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        stop_reason: Option<String>,
    },
}

impl RuntimeEvent {
    /// `done` and `error` end a turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    pub fn output(text: impl Into<String>) -> Self {
        Self::TextDelta {
            stream: TextStream::Output,
            text: text.into(),
        }
    }

    pub fn thought(text: impl Into<String>) -> Self {
        Self::TextDelta {
            stream: TextStream::Thought,
            text: text.into(),
        }
    }

    pub fn error(message: impl Into<String>, code: Option<String>) -> Self {
        Self::Error {
            message: message.into(),
            code,
            retryable: None,
        }
    }
}

/// Map one stdout line to at most one event.
///
/// Returns `Ok(None)` for blank or unrecognised lines and `Err` for lines
/// that are not JSON. Callers should log the `Err` and keep reading.
pub fn parse_prompt_event_line(line: &str) -> Result<Option<RuntimeEvent>, serde_json::Error> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let v: Value = serde_json::from_str(trimmed)?;
    Ok(parse_value(&v))
}

fn parse_value(v: &Value) -> Option<RuntimeEvent> {
    match v.get("type").and_then(Value::as_str) {
        Some("error") => return Some(parse_error(v)),
        Some("done") => {
            return Some(RuntimeEvent::Done {
                stop_reason: str_field(v, "stopReason"),
            });
        }
        _ => {}
    }

    if v.get("method").and_then(Value::as_str) == Some("session/update") {
        let update = v.get("params").and_then(|p| p.get("update"))?;
        return parse_session_update(update);
    }

    // The `session/prompt` response carries the stop reason too.
    if v.get("id").is_some() {
        if let Some(reason) = v
            .get("result")
            .and_then(|r| r.get("stopReason"))
            .and_then(Value::as_str)
        {
            return Some(RuntimeEvent::Done {
                stop_reason: Some(reason.to_string()),
            });
        }
    }

    if let Some(method) = v.get("method").and_then(Value::as_str) {
        debug!(method, "ignoring acpx protocol traffic");
    }
    None
}

fn parse_error(v: &Value) -> RuntimeEvent {
    let code = match v.get("code") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };
    RuntimeEvent::Error {
        message: str_field(v, "message").unwrap_or_else(|| "acpx reported an error".to_string()),
        code,
        retryable: v.get("retryable").and_then(Value::as_bool),
    }
}

fn parse_session_update(update: &Value) -> Option<RuntimeEvent> {
    let kind = update.get("sessionUpdate").and_then(Value::as_str)?;
    match kind {
        "agent_message_chunk" | "agent_thought_chunk" => {
            let content = update.get("content")?;
            if content.get("type").and_then(Value::as_str) != Some("text") {
                return None;
            }
            let text = content.get("text").and_then(Value::as_str)?.to_string();
            let stream = if kind == "agent_thought_chunk" {
                TextStream::Thought
            } else {
                TextStream::Output
            };
            Some(RuntimeEvent::TextDelta { stream, text })
        }
        "tool_call" | "tool_call_update" => {
            let title = non_empty(update, "title")
                .or_else(|| non_empty(update, "toolCallId"))
                .unwrap_or_else(|| "tool call".to_string());
            let text = match non_empty(update, "status") {
                Some(status) => format!("{title} ({status})"),
                None => title,
            };
            Some(RuntimeEvent::ToolCall { text })
        }
        other => {
            debug!(session_update = other, "ignoring session update");
            None
        }
    }
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(str::to_string)
}

fn non_empty(v: &Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Line-by-line translator with exactly-once terminal semantics.
///
/// After the first `done` or `error`, every further line is swallowed.
#[derive(Debug, Default)]
pub struct PromptEventTranslator {
    terminated: bool,
}

impl PromptEventTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one raw line; returns the event to surface, if any.
    pub fn push_line(&mut self, line: &str) -> Option<RuntimeEvent> {
        match parse_prompt_event_line(line) {
            Ok(Some(event)) => self.admit(event),
            Ok(None) => None,
            Err(e) => {
                warn!(line = line.trim(), error = %e, "skipping malformed acpx output line");
                None
            }
        }
    }

    /// Apply the terminal latch to an already-built event.
    pub fn admit(&mut self, event: RuntimeEvent) -> Option<RuntimeEvent> {
        if self.terminated {
            return None;
        }
        if event.is_terminal() {
            self.terminated = true;
        }
        Some(event)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }
}

/// Turn a child's stdout into a lazily-read event stream.
///
/// Lines are split on `\n` and decoded lossily so a stray invalid byte costs
/// one line, not the rest of the turn. The stream ends at EOF.
pub fn translate_lines<R>(reader: R) -> impl Stream<Item = RuntimeEvent> + Send
where
    R: AsyncRead + Send + Unpin + 'static,
{
    async_stream::stream! {
        let mut translator = PromptEventTranslator::new();
        let mut lines = SplitStream::new(BufReader::new(reader).split(b'\n'));

        while let Some(next) = lines.next().await {
            match next {
                Ok(bytes) => {
                    let line = String::from_utf8_lossy(&bytes);
                    if let Some(event) = translator.push_line(&line) {
                        yield event;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "error reading acpx stdout");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(update: Value) -> String {
        serde_json::json!({
            "jsonrpc": "2.0",
            "method": "session/update",
            "params": { "sessionId": "s-1", "update": update },
        })
        .to_string()
    }

    fn chunk(kind: &str, text: &str) -> String {
        update(serde_json::json!({
            "sessionUpdate": kind,
            "content": { "type": "text", "text": text },
        }))
    }

    #[test]
    fn message_chunk_is_forwarded_verbatim() {
        let event = parse_prompt_event_line(&chunk("agent_message_chunk", "  padded  ")).unwrap();
        assert_eq!(event, Some(RuntimeEvent::output("  padded  ")));
    }

    #[test]
    fn thought_chunk_maps_to_thought_stream() {
        let event = parse_prompt_event_line(&chunk("agent_thought_chunk", "thinking")).unwrap();
        assert_eq!(event, Some(RuntimeEvent::thought("thinking")));
    }

    #[test]
    fn non_text_content_is_skipped() {
        let line = update(serde_json::json!({
            "sessionUpdate": "agent_message_chunk",
            "content": { "type": "image", "data": "..." },
        }));
        assert_eq!(parse_prompt_event_line(&line).unwrap(), None);
    }

    #[test]
    fn tool_call_renders_title_and_status() {
        let line = update(serde_json::json!({
            "sessionUpdate": "tool_call",
            "toolCallId": "tool-1",
            "title": "run-tests",
            "status": "in_progress",
            "kind": "command",
        }));
        assert_eq!(
            parse_prompt_event_line(&line).unwrap(),
            Some(RuntimeEvent::ToolCall {
                text: "run-tests (in_progress)".to_string()
            })
        );
    }

    #[test]
    fn tool_call_update_falls_back_to_id() {
        let line = update(serde_json::json!({
            "sessionUpdate": "tool_call_update",
            "toolCallId": "tool-9",
            "status": "completed",
        }));
        assert_eq!(
            parse_prompt_event_line(&line).unwrap(),
            Some(RuntimeEvent::ToolCall {
                text: "tool-9 (completed)".to_string()
            })
        );
    }

    #[test]
    fn error_line_maps_fields() {
        let line = r#"{"type":"error","code":"-32000","message":"X"}"#;
        assert_eq!(
            parse_prompt_event_line(line).unwrap(),
            Some(RuntimeEvent::Error {
                message: "X".to_string(),
                code: Some("-32000".to_string()),
                retryable: None,
            })
        );
    }

    #[test]
    fn error_line_with_numeric_code_and_retryable() {
        let line = r#"{"type":"error","code":429,"message":"slow down","retryable":true}"#;
        assert_eq!(
            parse_prompt_event_line(line).unwrap(),
            Some(RuntimeEvent::Error {
                message: "slow down".to_string(),
                code: Some("429".to_string()),
                retryable: Some(true),
            })
        );
    }

    #[test]
    fn done_line_maps_stop_reason() {
        assert_eq!(
            parse_prompt_event_line(r#"{"type":"done","stopReason":"end_turn"}"#).unwrap(),
            Some(RuntimeEvent::Done {
                stop_reason: Some("end_turn".to_string())
            })
        );
        assert_eq!(
            parse_prompt_event_line(r#"{"type":"done"}"#).unwrap(),
            Some(RuntimeEvent::Done { stop_reason: None })
        );
    }

    #[test]
    fn prompt_response_maps_to_done() {
        let line = r#"{"jsonrpc":"2.0","id":"req-1","result":{"stopReason":"cancelled"}}"#;
        assert_eq!(
            parse_prompt_event_line(line).unwrap(),
            Some(RuntimeEvent::Done {
                stop_reason: Some("cancelled".to_string())
            })
        );
    }

    #[test]
    fn unrelated_rpc_traffic_is_ignored() {
        let load = r#"{"jsonrpc":"2.0","id":0,"method":"session/load","params":{"sessionId":"s"}}"#;
        let load_err = r#"{"jsonrpc":"2.0","id":0,"error":{"code":-32002,"message":"Resource not found"}}"#;
        let plan = update(serde_json::json!({ "sessionUpdate": "plan", "entries": [] }));
        assert_eq!(parse_prompt_event_line(load).unwrap(), None);
        assert_eq!(parse_prompt_event_line(load_err).unwrap(), None);
        assert_eq!(parse_prompt_event_line(&plan).unwrap(), None);
        assert_eq!(parse_prompt_event_line("   ").unwrap(), None);
    }

    #[test]
    fn malformed_line_is_an_error() {
        assert!(parse_prompt_event_line("this is not json").is_err());
    }

    #[test]
    fn translator_latches_after_first_terminal() {
        let mut t = PromptEventTranslator::new();
        assert!(t.push_line(&chunk("agent_message_chunk", "ok")).is_some());
        assert!(t.push_line(r#"{"type":"done","stopReason":"end_turn"}"#).is_some());
        assert!(t.is_terminated());
        assert_eq!(t.push_line(r#"{"type":"done","stopReason":"end_turn"}"#), None);
        assert_eq!(t.push_line(r#"{"type":"error","message":"late"}"#), None);
        assert_eq!(t.push_line(&chunk("agent_message_chunk", "late")), None);
    }

    #[test]
    fn translator_skips_garbage_without_latching() {
        let mut t = PromptEventTranslator::new();
        assert_eq!(t.push_line("{{{{"), None);
        assert!(!t.is_terminated());
        assert!(t.push_line(&chunk("agent_message_chunk", "still here")).is_some());
    }

    #[test]
    fn runtime_event_serializes_with_type_tag() {
        let json = serde_json::to_value(RuntimeEvent::Done {
            stop_reason: Some("end_turn".to_string()),
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({ "type": "done", "stopReason": "end_turn" }));

        let json = serde_json::to_value(RuntimeEvent::thought("hm")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "type": "text_delta", "stream": "thought", "text": "hm" })
        );
    }

    #[tokio::test]
    async fn translate_lines_preserves_order_and_spacing() {
        let input = [
            chunk("agent_message_chunk", "alpha"),
            "not json at all".to_string(),
            chunk("agent_message_chunk", " beta"),
            String::new(),
            chunk("agent_message_chunk", " gamma"),
            r#"{"type":"done","stopReason":"end_turn"}"#.to_string(),
            r#"{"type":"done","stopReason":"end_turn"}"#.to_string(),
        ]
        .join("\n");

        let events: Vec<RuntimeEvent> =
            translate_lines(std::io::Cursor::new(input.into_bytes())).collect().await;

        assert_eq!(
            events,
            vec![
                RuntimeEvent::output("alpha"),
                RuntimeEvent::output(" beta"),
                RuntimeEvent::output(" gamma"),
                RuntimeEvent::Done {
                    stop_reason: Some("end_turn".to_string())
                },
            ]
        );
    }

    #[tokio::test]
    async fn translate_lines_survives_invalid_utf8() {
        let mut input = vec![0xff, 0xfe, b'\n'];
        input.extend_from_slice(chunk("agent_message_chunk", "fine").as_bytes());
        input.push(b'\n');

        let events: Vec<RuntimeEvent> =
            translate_lines(std::io::Cursor::new(input)).collect().await;
        assert_eq!(events, vec![RuntimeEvent::output("fine")]);
    }
}

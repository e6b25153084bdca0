//! Server-Sent Events conversion: turns a `ResponseEvent` stream into axum's
//! `Sse` type, starting with a `started` event and closing on the first
//! terminal event.

use crate::wire::ResponseEvent;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use std::convert::Infallible;

pub fn sse_stream(
    thread_id: String,
    response_stream: impl Stream<Item = ResponseEvent> + Send + 'static,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let started = stream::once(async move {
        Ok(Event::default()
            .event("started")
            .data(serde_json::json!({ "thread_id": thread_id }).to_string()))
    });
    let body = response_stream.map(|event| Ok(response_event_to_sse(event)));
    Sse::new(started.chain(body)).keep_alive(KeepAlive::default())
}

fn response_event_to_sse(event: ResponseEvent) -> Event {
    let (name, payload) = response_event_name_and_payload(&event);
    Event::default().event(name).data(payload.to_string())
}

fn response_event_name_and_payload(event: &ResponseEvent) -> (&'static str, serde_json::Value) {
    match event {
        ResponseEvent::Thinking { text } => ("thinking", serde_json::json!({ "text": text })),
        ResponseEvent::Text { text } => ("text", serde_json::json!({ "text": text })),
        ResponseEvent::ToolUse { id, name, input } => {
            ("tool_use", serde_json::json!({ "id": id, "name": name, "input": input }))
        }
        ResponseEvent::ToolResult { id, output } => {
            ("tool_result", serde_json::json!({ "id": id, "output": output }))
        }
        ResponseEvent::File { name, mime_type, data_base64 } => (
            "file",
            serde_json::json!({ "name": name, "mime_type": mime_type, "data_base64": data_base64 }),
        ),
        ResponseEvent::Usage { input_tokens, output_tokens } => (
            "usage",
            serde_json::json!({ "input_tokens": input_tokens, "output_tokens": output_tokens }),
        ),
        ResponseEvent::ToolState { id, state } => ("tool_state", serde_json::json!({ "id": id, "state": state })),
        ResponseEvent::ToolApprovalRequest { tool_id, tool_name, input } => (
            "tool_approval",
            serde_json::json!({ "tool_id": tool_id, "tool_name": tool_name, "input": input }),
        ),
        ResponseEvent::SessionInit { session_id } => ("session_init", serde_json::json!({ "session_id": session_id })),
        ResponseEvent::SessionOrphaned { reason } => ("session_orphaned", serde_json::json!({ "reason": reason })),
        ResponseEvent::Cancelled => ("cancelled", serde_json::json!({})),
        ResponseEvent::Done { text } => ("done", serde_json::json!({ "text": text })),
        ResponseEvent::Error { message } => ("error", serde_json::json!({ "message": message })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_event_maps_to_done_name() {
        let (name, payload) = response_event_name_and_payload(&ResponseEvent::Done { text: "hi".into() });
        assert_eq!(name, "done");
        assert_eq!(payload["text"], "hi");
    }

    #[test]
    fn cancelled_event_has_empty_payload() {
        let (name, payload) = response_event_name_and_payload(&ResponseEvent::Cancelled);
        assert_eq!(name, "cancelled");
        assert_eq!(payload, serde_json::json!({}));
    }
}

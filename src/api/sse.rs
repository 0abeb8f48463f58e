//! Server-Sent Events support

use crate::runtime::SseEvent;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use serde_json::json;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Convert broadcast stream to SSE stream
pub fn sse_stream(
    init_event: SseEvent,
    broadcast_rx: tokio::sync::broadcast::Receiver<SseEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let init = futures::stream::once(async move { Ok(sse_event_to_axum(init_event)) });

    let broadcasts = BroadcastStream::new(broadcast_rx).filter_map(|result| match result {
        Ok(event) => Some(Ok(sse_event_to_axum(event))),
        Err(_) => None, // Skip lagged messages
    });

    let combined = init.chain(broadcasts);

    Sse::new(combined).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn sse_event_to_axum(event: SseEvent) -> Event {
    let (event_type, data) = sse_payload(event);
    Event::default().event(event_type).data(data.to_string())
}

fn sse_payload(event: SseEvent) -> (&'static str, serde_json::Value) {
    match event {
        SseEvent::Init { state } => ("init", json!({ "type": "init", "state": state })),
        SseEvent::Message { message } => {
            ("message", json!({ "type": "message", "message": message }))
        }
        SseEvent::StateChange { state } => (
            "state_change",
            json!({ "type": "state_change", "state": state }),
        ),
        SseEvent::Diagnostic { message } => (
            "diagnostic",
            json!({ "type": "diagnostic", "message": message }),
        ),
        SseEvent::Status { text } => ("status", json!({ "type": "status", "text": text })),
        SseEvent::UserTalking { talking } => (
            "user_talking",
            json!({ "type": "user_talking", "talking": talking }),
        ),
        SseEvent::Error { message } => ("error", json!({ "type": "error", "message": message })),
    }
}

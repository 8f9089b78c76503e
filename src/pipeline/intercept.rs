//! Synthetic responses for requests that never need an upstream call:
//! conversation-title warmup probes and suggestion-mode probes. Answering
//! them locally keeps them from burning slots, RPM, and 30-minute quota.

use axum::http::StatusCode;
use bytes::Bytes;
use serde_json::{json, Value};

use crate::sse::ReplyChannel;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterceptKind {
    /// Title-generation / warmup probe; answered with "New Conversation".
    Warmup,
    /// Suggestion-mode probe; answered with an empty completion.
    SuggestionMode,
}

const TITLE_PROMPT: &str = "Please write a 5-10 word title for the following conversation:";
const TOPIC_PROMPT: &str =
    "nalyze if this message indicates a new conversation topic. If it does, extract a 2-3 word title";

/// Classify a request body, cheaply. The substring pre-check keeps the JSON
/// parse off the hot path for ordinary requests.
pub fn detect_intercept(body: &[u8]) -> Option<InterceptKind> {
    let text = std::str::from_utf8(body).ok()?;
    let has_suggestion = text.contains("[SUGGESTION MODE:");
    let has_warmup_keyword = text.contains("title") || text.contains("Warmup");
    if !has_suggestion && !has_warmup_keyword {
        return None;
    }

    let value: Value = serde_json::from_slice(body).ok()?;
    let messages = value.get("messages").and_then(Value::as_array);

    if has_suggestion {
        if let Some(last) = messages.and_then(|messages| messages.last()) {
            if last.get("role").and_then(Value::as_str) == Some("user")
                && first_text_block(last)
                    .map(|text| text.starts_with("[SUGGESTION MODE:"))
                    .unwrap_or(false)
            {
                return Some(InterceptKind::SuggestionMode);
            }
        }
    }

    if has_warmup_keyword {
        if let Some(messages) = messages {
            for message in messages {
                for text in text_blocks(message) {
                    if text.contains(TITLE_PROMPT) || text == "Warmup" {
                        return Some(InterceptKind::Warmup);
                    }
                }
            }
        }
        if let Some(system) = value.get("system").and_then(Value::as_array) {
            for block in system {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    if text.contains(TOPIC_PROMPT) {
                        return Some(InterceptKind::Warmup);
                    }
                }
            }
        }
    }

    None
}

fn first_text_block(message: &Value) -> Option<&str> {
    message
        .get("content")
        .and_then(Value::as_array)
        .and_then(|content| content.first())
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .and_then(|block| block.get("text").and_then(Value::as_str))
}

fn text_blocks(message: &Value) -> Vec<&str> {
    message
        .get("content")
        .and_then(Value::as_array)
        .map(|content| {
            content
                .iter()
                .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default()
}

struct MockReply {
    message_id: &'static str,
    deltas: &'static [&'static str],
    output_tokens: u32,
}

fn mock_reply(kind: InterceptKind) -> MockReply {
    match kind {
        InterceptKind::SuggestionMode => MockReply {
            message_id: "msg_mock_suggestion",
            deltas: &[""],
            output_tokens: 1,
        },
        InterceptKind::Warmup => MockReply {
            message_id: "msg_mock_warmup",
            deltas: &["New", " Conversation"],
            output_tokens: 2,
        },
    }
}

/// Write the synthetic reply in whichever shape the client asked for.
pub async fn send_mock_response(
    reply: &mut ReplyChannel,
    model: &str,
    kind: InterceptKind,
    stream: bool,
) {
    let mock = mock_reply(kind);
    if !stream {
        let text: String = mock.deltas.concat();
        let _ = reply.send_json(
            StatusCode::OK,
            json!({
                "id": mock.message_id,
                "type": "message",
                "role": "assistant",
                "model": model,
                "content": [{"type": "text", "text": text}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 10, "output_tokens": mock.output_tokens},
            }),
        );
        return;
    }

    if reply.begin_stream(StatusCode::OK, sse_headers()).is_err() {
        return;
    }

    let message_start = json!({
        "type": "message_start",
        "message": {
            "id": mock.message_id,
            "type": "message",
            "role": "assistant",
            "model": model,
            "content": [],
            "stop_reason": null,
            "stop_sequence": null,
            "usage": {"input_tokens": 10, "output_tokens": 0},
        },
    });
    let message_delta = json!({
        "type": "message_delta",
        "delta": {"stop_reason": "end_turn", "stop_sequence": null},
        "usage": {"input_tokens": 10, "output_tokens": mock.output_tokens},
    });

    let mut events = vec![
        format!("event: message_start\ndata: {message_start}\n\n"),
        "event: content_block_start\ndata: {\"content_block\":{\"text\":\"\",\"type\":\"text\"},\"index\":0,\"type\":\"content_block_start\"}\n\n"
            .to_string(),
    ];
    for delta in mock.deltas {
        let event = json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "text_delta", "text": delta},
        });
        events.push(format!("event: content_block_delta\ndata: {event}\n\n"));
    }
    events.push("event: content_block_stop\ndata: {\"index\":0,\"type\":\"content_block_stop\"}\n\n".to_string());
    events.push(format!("event: message_delta\ndata: {message_delta}\n\n"));
    events.push("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n".to_string());

    for event in events {
        if reply.write_chunk(Bytes::from(event)).await.is_err() {
            return;
        }
    }
}

fn sse_headers() -> axum::http::HeaderMap {
    let mut headers = axum::http::HeaderMap::new();
    headers.insert(
        axum::http::header::CONTENT_TYPE,
        axum::http::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        axum::http::header::CACHE_CONTROL,
        axum::http::HeaderValue::from_static("no-cache"),
    );
    headers.insert("x-accel-buffering", axum::http::HeaderValue::from_static("no"));
    headers
}

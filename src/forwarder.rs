//! Default pass-through forwarder: relays the request body to the account's
//! upstream endpoint and streams the response back. Model-specific payload
//! transformations belong to dedicated forwarders behind the same trait.

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use futures_util::StreamExt;
use serde_json::Value;

use crate::entities::{Account, ForwardError, ForwardRequest, ForwardResult, Forwarder};
use crate::sse::ReplyChannel;

/// Upstream statuses that trigger the account-switch loop instead of ending
/// the request.
const FAILOVER_STATUSES: &[u16] = &[401, 403, 429, 500, 502, 503, 504, 529];

pub struct HttpForwarder {
    client: reqwest::Client,
}

impl HttpForwarder {
    pub fn new() -> Result<Self, ForwardError> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|err| ForwardError::Terminal(format!("http client init: {err}")))?;
        Ok(Self { client })
    }

    /// The effective model may differ from what the caller sent (group model
    /// mapping); rewrite it into the payload before relaying.
    fn effective_body(request: &ForwardRequest) -> Vec<u8> {
        let Ok(mut value) = serde_json::from_slice::<Value>(&request.body) else {
            return request.body.to_vec();
        };
        if value.get("model").and_then(Value::as_str) == Some(request.model.as_str()) {
            return request.body.to_vec();
        }
        value["model"] = Value::String(request.model.clone());
        serde_json::to_vec(&value).unwrap_or_else(|_| request.body.to_vec())
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(
        &self,
        request: &ForwardRequest,
        account: &Account,
        reply: &mut ReplyChannel,
    ) -> Result<ForwardResult, ForwardError> {
        if account.base_url.is_empty() {
            return Err(ForwardError::Terminal(format!(
                "account {} has no upstream url",
                account.id
            )));
        }
        let url = format!("{}/v1/messages", account.base_url.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .header("content-type", "application/json")
            .header("x-api-key", &account.api_key)
            .header("anthropic-version", "2023-06-01")
            .body(Self::effective_body(request))
            .send()
            .await
            .map_err(|err| {
                // Connection-level failures are as switchable as 5xx replies.
                tracing::warn!(account_id = account.id, %err, "upstream connect failed");
                ForwardError::Failover { status: 502 }
            })?;

        let status = response.status().as_u16();
        if FAILOVER_STATUSES.contains(&status) {
            return Err(ForwardError::Failover { status });
        }

        if request.stream {
            let mut headers = HeaderMap::new();
            for name in ["content-type", "cache-control"] {
                if let Some(value) = response.headers().get(name) {
                    headers.insert(name, value.clone());
                }
            }
            headers.entry("x-accel-buffering").or_insert(HeaderValue::from_static("no"));
            reply
                .begin_stream(StatusCode::from_u16(status).unwrap_or(StatusCode::OK), headers)
                .map_err(|_| ForwardError::Terminal("client disconnected".to_string()))?;

            let mut usage = UsageScan::default();
            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                let chunk = chunk
                    .map_err(|err| ForwardError::Terminal(format!("upstream stream: {err}")))?;
                usage.ingest(&chunk);
                reply
                    .write_chunk(chunk)
                    .await
                    .map_err(|_| ForwardError::Terminal("client disconnected".to_string()))?;
            }
            return Ok(ForwardResult {
                status,
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
            });
        }

        let payload = response
            .bytes()
            .await
            .map_err(|err| ForwardError::Terminal(format!("upstream body: {err}")))?;
        let value: Value = serde_json::from_slice(&payload)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&payload).into_owned()));
        let (input_tokens, output_tokens) = usage_from_message(&value);
        reply
            .send_json(StatusCode::from_u16(status).unwrap_or(StatusCode::OK), value)
            .map_err(|_| ForwardError::Terminal("client disconnected".to_string()))?;
        Ok(ForwardResult {
            status,
            input_tokens,
            output_tokens,
        })
    }
}

fn usage_from_message(value: &Value) -> (u64, u64) {
    let usage = value.get("usage");
    let read = |field: &str| {
        usage
            .and_then(|usage| usage.get(field))
            .and_then(Value::as_u64)
            .unwrap_or(0)
    };
    (read("input_tokens"), read("output_tokens"))
}

/// Best-effort usage extraction from an SSE stream: scans complete `data:`
/// lines for usage objects, keeping the last one seen.
#[derive(Default)]
struct UsageScan {
    buffer: Vec<u8>,
    input_tokens: u64,
    output_tokens: u64,
}

impl UsageScan {
    fn ingest(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let Some(data) = line.trim().strip_prefix("data: ") else {
                continue;
            };
            let Ok(event) = serde_json::from_str::<Value>(data) else {
                continue;
            };
            if let Some(usage) = event.get("usage").or_else(|| {
                event.get("message").and_then(|message| message.get("usage"))
            }) {
                if let Some(input) = usage.get("input_tokens").and_then(Value::as_u64) {
                    self.input_tokens = input;
                }
                if let Some(output) = usage.get("output_tokens").and_then(Value::as_u64) {
                    self.output_tokens = output;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_scan_keeps_last_counts() {
        let mut scan = UsageScan::default();
        scan.ingest(b"event: message_start\ndata: {\"message\":{\"usage\":{\"input_tokens\":12,\"output_tokens\":0}}}\n\n");
        scan.ingest(b"data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":40}}\n\n");
        assert_eq!(scan.input_tokens, 12);
        assert_eq!(scan.output_tokens, 40);
    }

    #[test]
    fn usage_scan_handles_split_chunks() {
        let mut scan = UsageScan::default();
        scan.ingest(b"data: {\"usage\":{\"input_tok");
        scan.ingest(b"ens\":5,\"output_tokens\":7}}\n");
        assert_eq!(scan.input_tokens, 5);
        assert_eq!(scan.output_tokens, 7);
    }

    #[test]
    fn model_rewrite_only_when_mapped() {
        let request = ForwardRequest {
            body: bytes::Bytes::from_static(b"{\"model\":\"claude-3-opus\",\"stream\":false}"),
            model: "claude-opus-4-20250514".to_string(),
            stream: false,
        };
        let body = HttpForwarder::effective_body(&request);
        let value: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(value["model"], "claude-opus-4-20250514");

        let unchanged = ForwardRequest {
            body: bytes::Bytes::from_static(b"{\"model\":\"claude-3-opus\"}"),
            model: "claude-3-opus".to_string(),
            stream: false,
        };
        assert_eq!(HttpForwarder::effective_body(&unchanged), unchanged.body.to_vec());
    }
}

//! Session identity: the sticky-session hash, model family parsing, and
//! Claude Code client validation.

use axum::http::HeaderMap;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Model families drive slot-pool partitioning and same-session parallelism.
/// Opus and sonnet get hard-isolated slot ranges; haiku shares the whole pool
/// and allows limited same-session parallelism.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModelFamily {
    Opus,
    Sonnet,
    Haiku,
}

impl ModelFamily {
    pub fn parse(model: &str) -> Option<ModelFamily> {
        if model.contains("opus") {
            Some(ModelFamily::Opus)
        } else if model.contains("sonnet") {
            Some(ModelFamily::Sonnet)
        } else if model.contains("haiku") {
            Some(ModelFamily::Haiku)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModelFamily::Opus => "opus",
            ModelFamily::Sonnet => "sonnet",
            ModelFamily::Haiku => "haiku",
        }
    }

    /// Haiku requests skip the per-session mutex; Claude Code issues them in
    /// parallel bursts and serialising those would stall the client.
    pub fn uses_session_mutex(self) -> bool {
        !matches!(self, ModelFamily::Haiku)
    }
}

/// Derive the sticky-session hash from request metadata.
///
/// The hash must be stable across retries of the same conversation turn and
/// across replicas; everything downstream treats it as an opaque string. An
/// empty hash routes the request through the non-session fast path.
pub fn session_hash(metadata_user_id: &str) -> String {
    if metadata_user_id.is_empty() {
        return String::new();
    }
    let mut hasher = Sha256::new();
    hasher.update(metadata_user_id.as_bytes());
    hex_lower(&hasher.finalize())
}

pub(crate) fn hex_lower(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}

/// The subset of the request body the admission core needs.
#[derive(Clone, Debug, Default)]
pub struct ParsedRequest {
    pub model: String,
    pub stream: bool,
    pub metadata_user_id: String,
    /// True when the latest message carries a tool_result block, i.e. the
    /// turn was produced by the harness rather than typed by a person.
    pub is_tool_result: bool,
}

impl ParsedRequest {
    pub fn parse(body: &[u8]) -> Option<ParsedRequest> {
        let value: Value = serde_json::from_slice(body).ok()?;
        let model = value.get("model").and_then(Value::as_str).unwrap_or_default().to_string();
        let stream = value.get("stream").and_then(Value::as_bool).unwrap_or(false);
        let metadata_user_id = value
            .get("metadata")
            .and_then(|meta| meta.get("user_id"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let is_tool_result = value
            .get("messages")
            .and_then(Value::as_array)
            .and_then(|messages| messages.last())
            .and_then(|last| last.get("content"))
            .and_then(Value::as_array)
            .map(|content| {
                content
                    .iter()
                    .any(|block| block.get("type").and_then(Value::as_str) == Some("tool_result"))
            })
            .unwrap_or(false);
        Some(ParsedRequest {
            model,
            stream,
            metadata_user_id,
            is_tool_result,
        })
    }

    pub fn session_hash(&self) -> String {
        session_hash(&self.metadata_user_id)
    }
}

/// Header-level validation of Claude Code clients, used when a group (or the
/// whole deployment) is restricted to the official CLI. The checks mirror
/// what the CLI actually sends.
pub fn claude_code_headers_valid(headers: &HeaderMap) -> bool {
    let header = |name: &str| headers.get(name).and_then(|value| value.to_str().ok()).unwrap_or("");

    if header("x-app") != "cli" {
        return false;
    }
    if header("anthropic-version") != "2023-06-01" {
        return false;
    }
    let beta = header("anthropic-beta");
    beta.contains("claude-code-") || beta.contains("oauth-") || beta.contains("interleaved-thinking")
}

/// Body-level validation: the CLI stamps `metadata.user_id` as
/// `user_{64 hex}_account_{uuid}_session_{uuid}`.
pub fn claude_code_user_id_valid(metadata_user_id: &str) -> bool {
    let Some(rest) = metadata_user_id.strip_prefix("user_") else {
        return false;
    };
    let Some((client, rest)) = rest.split_once("_account_") else {
        return false;
    };
    let Some((account, session)) = rest.split_once("_session_") else {
        return false;
    };
    client.len() == 64
        && client.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
        && !account.is_empty()
        && account.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase() || b == b'-')
        && session.len() == 36
        && session.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase() || b == b'-')
}

/// Combined client check used by the pipeline: valid headers plus a
/// plausible CLI user id when one is present.
pub fn is_claude_code_client(headers: &HeaderMap, parsed: &ParsedRequest) -> bool {
    if !claude_code_headers_valid(headers) {
        return false;
    }
    parsed.metadata_user_id.is_empty() || claude_code_user_id_valid(&parsed.metadata_user_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn family_parsing_matches_model_names() {
        assert_eq!(ModelFamily::parse("claude-opus-4-20250514"), Some(ModelFamily::Opus));
        assert_eq!(ModelFamily::parse("claude-sonnet-4-20250514"), Some(ModelFamily::Sonnet));
        assert_eq!(ModelFamily::parse("claude-3-5-haiku-20241022"), Some(ModelFamily::Haiku));
        assert_eq!(ModelFamily::parse("gpt-4o"), None);
    }

    #[test]
    fn session_hash_is_stable_and_distinct() {
        let a = session_hash("user_aa_account_bb_session_cc");
        let b = session_hash("user_aa_account_bb_session_cc");
        let c = session_hash("user_aa_account_bb_session_dd");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(session_hash("").is_empty());
    }

    #[test]
    fn parse_extracts_model_stream_and_metadata() {
        let body = serde_json::json!({
            "model": "claude-sonnet-4-20250514",
            "stream": true,
            "metadata": {"user_id": "user_abc"},
            "messages": [
                {"role": "user", "content": [{"type": "text", "text": "hi"}]},
                {"role": "user", "content": [{"type": "tool_result", "tool_use_id": "t1"}]}
            ]
        });
        let parsed = ParsedRequest::parse(body.to_string().as_bytes()).expect("parse");
        assert_eq!(parsed.model, "claude-sonnet-4-20250514");
        assert!(parsed.stream);
        assert_eq!(parsed.metadata_user_id, "user_abc");
        assert!(parsed.is_tool_result);
    }

    #[test]
    fn parse_tolerates_string_content() {
        let body = serde_json::json!({
            "model": "claude-3-5-haiku-20241022",
            "messages": [{"role": "user", "content": "plain text"}]
        });
        let parsed = ParsedRequest::parse(body.to_string().as_bytes()).expect("parse");
        assert!(!parsed.is_tool_result);
        assert!(!parsed.stream);
    }

    #[test]
    fn header_validation_requires_cli_fingerprint() {
        let mut headers = HeaderMap::new();
        headers.insert("x-app", HeaderValue::from_static("cli"));
        headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
        headers.insert(
            "anthropic-beta",
            HeaderValue::from_static("claude-code-20250219,interleaved-thinking-2025-05-14"),
        );
        assert!(claude_code_headers_valid(&headers));

        headers.insert("x-app", HeaderValue::from_static("web"));
        assert!(!claude_code_headers_valid(&headers));
    }

    #[test]
    fn user_id_shape_validation() {
        let client = "a".repeat(64);
        let good = format!(
            "user_{client}_account_550e8400-e29b-41d4-a716-446655440000_session_6ba7b810-9dad-11d1-80b4-00c04fd430c8"
        );
        assert!(claude_code_user_id_valid(&good));
        assert!(!claude_code_user_id_valid("user_short_account_x_session_y"));
        assert!(!claude_code_user_id_valid(""));
    }
}

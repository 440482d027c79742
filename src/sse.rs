//! Server-Sent Events parsing and synthesis.
//!
//! Two directions: extracting metadata from an upstream SSE stream as it is
//! being forwarded (for token-usage observation), and synthesizing a
//! substitute SSE stream or JSON body when `BufferEngine` serves a compact
//! request from a precomputed checkpoint instead of forwarding it.

use serde_json::json;
use uuid::Uuid;

// ============================================================================
// SSE Detection
// ============================================================================

/// Check if a response is SSE based on its content-type header.
pub fn is_sse_response(headers: &reqwest::header::HeaderMap) -> bool {
    headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("text/event-stream"))
        .unwrap_or(false)
}

// ============================================================================
// Line-Level Extractors (real-time, during forwarding)
// ============================================================================

/// Extract the `usage` object from a `message_delta` event, if present.
/// This is the authoritative token-usage source for a streamed response
/// (DESIGN.md Open Question (b)).
pub fn extract_usage_delta(line: &str) -> Option<serde_json::Value> {
    let data = parse_sse_data_line(line)?;
    if data.get("type")?.as_str()? != "message_delta" {
        return None;
    }
    data.get("usage").cloned()
}

/// Pull `input_tokens` out of a `usage` object — the non-streaming response
/// body's top-level `usage`, or a `message_delta` event's `usage` field.
pub fn input_tokens_from_usage(usage: &serde_json::Value) -> Option<u32> {
    usage.get("input_tokens")?.as_u64().map(|v| v as u32)
}

/// Extract the `stop_reason` from a `message_delta` event, if present.
pub fn extract_stop_reason(line: &str) -> Option<String> {
    let data = parse_sse_data_line(line)?;
    if data.get("type")?.as_str()? != "message_delta" {
        return None;
    }
    data.get("delta")?
        .get("stop_reason")?
        .as_str()
        .map(String::from)
}

/// Extract model name from a `message_start` event, if present.
pub fn extract_model(line: &str) -> Option<String> {
    let data = parse_sse_data_line(line)?;
    if data.get("type")?.as_str()? != "message_start" {
        return None;
    }
    data.get("message")?.get("model")?.as_str().map(String::from)
}

// ============================================================================
// Stream Assembly (post-stream, for observation/logging)
// ============================================================================

/// Assemble an accumulated SSE body into a structured JSON representation,
/// mirroring the shape a non-streaming response would have had.
pub fn assemble_to_json(body: &str) -> Option<serde_json::Value> {
    let mut content_blocks = Vec::new();
    let mut model = String::new();
    let mut stop_reason: Option<String> = None;
    let mut usage_data: Option<serde_json::Value> = None;

    for line in body.lines() {
        let Some(data) = parse_sse_data_line(line.trim()) else {
            continue;
        };

        let event_type = data.get("type").and_then(|v| v.as_str()).unwrap_or("");

        match event_type {
            "message_start" => {
                if let Some(message) = data.get("message") {
                    model = message
                        .get("model")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string();
                }
            }
            "content_block_start" => {
                if let Some(block) = data.get("content_block") {
                    content_blocks.push(block.clone());
                }
            }
            "content_block_delta" => {
                if let Some(delta) = data.get("delta") {
                    if let Some(last_block) = content_blocks.last_mut() {
                        if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                            if let Some(existing_text) = last_block.get_mut("text") {
                                if let Some(s) = existing_text.as_str() {
                                    *existing_text = json!(format!("{s}{text}"));
                                }
                            } else if let Some(obj) = last_block.as_object_mut() {
                                obj.insert("text".to_string(), json!(text));
                            }
                        }
                    }
                }
            }
            "message_delta" => {
                if let Some(delta) = data.get("delta") {
                    stop_reason = delta
                        .get("stop_reason")
                        .and_then(|v| v.as_str())
                        .map(String::from);
                }
                if let Some(usage) = data.get("usage") {
                    usage_data = Some(usage.clone());
                }
            }
            _ => {}
        }
    }

    if !content_blocks.is_empty() || !model.is_empty() {
        Some(json!({
            "model": model,
            "content": content_blocks,
            "stop_reason": stop_reason,
            "usage": usage_data,
        }))
    } else {
        None
    }
}

// ============================================================================
// Substitute Response Synthesis
// ============================================================================

/// Build the non-streaming JSON body for a swap response (spec §4.5): same
/// shape the client expects from the completion endpoint, with the
/// assistant-message text equal to the checkpoint content.
pub fn synthesize_substitute_json(
    model: &str,
    checkpoint_content: &str,
    input_tokens: u32,
    output_tokens: u32,
) -> serde_json::Value {
    json!({
        "id": format!("msg_{}", Uuid::new_v4().simple()),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": [{ "type": "text", "text": checkpoint_content }],
        "stop_reason": "end_turn",
        "stop_sequence": null,
        "usage": {
            "input_tokens": input_tokens,
            "output_tokens": output_tokens,
        },
    })
}

/// Build the equivalent SSE event sequence for a swap response when the
/// client requested streaming: `message_start`, one `content_block_start` /
/// `content_block_delta` / `content_block_stop` triple carrying the full
/// checkpoint text as a single delta, `message_delta` with the final usage,
/// `message_stop`, then the `[DONE]` sentinel.
pub fn synthesize_substitute_sse(
    model: &str,
    checkpoint_content: &str,
    input_tokens: u32,
    output_tokens: u32,
) -> String {
    let message_id = format!("msg_{}", Uuid::new_v4().simple());
    let mut out = String::new();

    push_event(
        &mut out,
        "message_start",
        &json!({
            "type": "message_start",
            "message": {
                "id": message_id,
                "type": "message",
                "role": "assistant",
                "model": model,
                "content": [],
                "stop_reason": null,
                "usage": { "input_tokens": input_tokens, "output_tokens": 0 },
            }
        }),
    );

    push_event(
        &mut out,
        "content_block_start",
        &json!({
            "type": "content_block_start",
            "index": 0,
            "content_block": { "type": "text", "text": "" }
        }),
    );

    push_event(
        &mut out,
        "content_block_delta",
        &json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": { "type": "text_delta", "text": checkpoint_content }
        }),
    );

    push_event(
        &mut out,
        "content_block_stop",
        &json!({ "type": "content_block_stop", "index": 0 }),
    );

    push_event(
        &mut out,
        "message_delta",
        &json!({
            "type": "message_delta",
            "delta": { "stop_reason": "end_turn", "stop_sequence": null },
            "usage": { "output_tokens": output_tokens }
        }),
    );

    push_event(&mut out, "message_stop", &json!({ "type": "message_stop" }));

    out.push_str("data: [DONE]\n\n");
    out
}

fn push_event(out: &mut String, event: &str, data: &serde_json::Value) {
    out.push_str("event: ");
    out.push_str(event);
    out.push('\n');
    out.push_str("data: ");
    out.push_str(&data.to_string());
    out.push_str("\n\n");
}

// ============================================================================
// Internal Helpers
// ============================================================================

/// Parse an SSE "data:" line into JSON. Returns `None` for non-data lines,
/// empty payloads, or the `[DONE]` sentinel.
fn parse_sse_data_line(line: &str) -> Option<serde_json::Value> {
    let json_str = line.strip_prefix("data:")?.trim();
    if json_str.is_empty() || json_str == "[DONE]" {
        return None;
    }
    serde_json::from_str(json_str).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_usage_from_message_delta() {
        let line = r#"data: {"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":42}}"#;
        let usage = extract_usage_delta(line).unwrap();
        assert_eq!(usage["output_tokens"], 42);
    }

    #[test]
    fn input_tokens_from_usage_reads_the_field() {
        let usage = serde_json::json!({"input_tokens": 85, "output_tokens": 12});
        assert_eq!(input_tokens_from_usage(&usage), Some(85));
        assert_eq!(input_tokens_from_usage(&serde_json::json!({"output_tokens": 12})), None);
    }

    #[test]
    fn ignores_done_sentinel() {
        assert!(extract_usage_delta("data: [DONE]").is_none());
        assert!(parse_sse_data_line("data: [DONE]").is_none());
    }

    #[test]
    fn extracts_model_from_message_start() {
        let line = r#"data: {"type":"message_start","message":{"model":"claude-3-5-sonnet-20241022"}}"#;
        assert_eq!(extract_model(line).unwrap(), "claude-3-5-sonnet-20241022");
    }

    #[test]
    fn assembles_text_deltas_across_chunks() {
        let body = [
            r#"data: {"type":"message_start","message":{"model":"tiny"}}"#,
            r#"data: {"type":"content_block_start","content_block":{"type":"text","text":""}}"#,
            r#"data: {"type":"content_block_delta","delta":{"text":"hello "}}"#,
            r#"data: {"type":"content_block_delta","delta":{"text":"world"}}"#,
            r#"data: {"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":2}}"#,
        ]
        .join("\n");
        let assembled = assemble_to_json(&body).unwrap();
        assert_eq!(assembled["content"][0]["text"], "hello world");
        assert_eq!(assembled["stop_reason"], "end_turn");
    }

    #[test]
    fn synthesized_json_carries_checkpoint_text() {
        let value = synthesize_substitute_json("tiny", "SUMMARY-X", 85, 12);
        assert_eq!(value["content"][0]["text"], "SUMMARY-X");
        assert_eq!(value["usage"]["input_tokens"], 85);
        assert_eq!(value["stop_reason"], "end_turn");
    }

    #[test]
    fn synthesized_sse_ends_with_done_and_contains_checkpoint_text() {
        let stream = synthesize_substitute_sse("tiny", "SUMMARY-X", 85, 12);
        assert!(stream.contains("SUMMARY-X"));
        assert!(stream.trim_end().ends_with("data: [DONE]"));
        assert!(stream.contains("event: message_stop"));
    }
}

use serde_json::Value;

use crate::models::{NormalizedEvent, TokenUsage, WireFormat};

/**
 * \brief 按线格式分发到对应解析器。
 */
pub fn parse_chunk(format: WireFormat, fragment: &str) -> Vec<NormalizedEvent> {
    match format {
        WireFormat::OpenAiCompatible => parse_openai_compatible(fragment),
        WireFormat::Anthropic => parse_anthropic(fragment),
        WireFormat::Ollama => parse_ollama(fragment),
        WireFormat::Unsupported => vec![NormalizedEvent::error(
            "provider wire format is not supported",
        )],
    }
}

/**
 * \brief OpenAI 兼容 SSE：`data: {...}`，`data: [DONE]` 结束。
 */
pub fn parse_openai_compatible(fragment: &str) -> Vec<NormalizedEvent> {
    let mut out = Vec::new();
    for payload in sse_payloads(fragment) {
        if payload == "[DONE]" {
            out.push(NormalizedEvent::done(None));
            continue;
        }
        let Ok(v) = serde_json::from_str::<Value>(payload) else {
            continue;
        };
        if let Some(message) = error_message(&v) {
            out.push(NormalizedEvent::error(message));
            continue;
        }
        let choice = v.get("choices").and_then(|c| c.get(0));
        if let Some(text) = choice
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content"))
            .and_then(Value::as_str)
        {
            if !text.is_empty() {
                out.push(NormalizedEvent::content(text));
            }
        }
        if let Some(usage) = v.get("usage").filter(|u| u.is_object()) {
            out.push(NormalizedEvent::Usage(TokenUsage {
                prompt_tokens: usage.get("prompt_tokens").and_then(Value::as_u64),
                completion_tokens: usage.get("completion_tokens").and_then(Value::as_u64),
                total_tokens: usage.get("total_tokens").and_then(Value::as_u64),
            }));
        }
        if let Some(reason) = choice
            .and_then(|c| c.get("finish_reason"))
            .and_then(Value::as_str)
        {
            out.push(NormalizedEvent::done(Some(reason)));
        }
    }
    out
}

/**
 * \brief Anthropic SSE：同时接受旧版 `completion` 与 `content_block_delta` 两种载荷。
 */
pub fn parse_anthropic(fragment: &str) -> Vec<NormalizedEvent> {
    let mut out = Vec::new();
    for payload in sse_payloads(fragment) {
        if payload == "[DONE]" {
            out.push(NormalizedEvent::done(None));
            continue;
        }
        let Ok(v) = serde_json::from_str::<Value>(payload) else {
            continue;
        };
        match v.get("type").and_then(Value::as_str).unwrap_or_default() {
            "completion" => {
                if let Some(text) = v.get("text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        out.push(NormalizedEvent::content(text));
                    }
                }
                if let Some(reason) = v.get("stop_reason").and_then(Value::as_str) {
                    out.push(NormalizedEvent::done(Some(reason)));
                }
            }
            "content_block_delta" => {
                if let Some(text) = v
                    .get("delta")
                    .and_then(|d| d.get("text"))
                    .and_then(Value::as_str)
                {
                    if !text.is_empty() {
                        out.push(NormalizedEvent::content(text));
                    }
                }
            }
            "message_start" => {
                let prompt = v
                    .get("message")
                    .and_then(|m| m.get("usage"))
                    .and_then(|u| u.get("input_tokens"))
                    .and_then(Value::as_u64);
                if prompt.is_some() {
                    out.push(NormalizedEvent::Usage(TokenUsage {
                        prompt_tokens: prompt,
                        ..TokenUsage::default()
                    }));
                }
            }
            "message_delta" => {
                let completion = v
                    .get("usage")
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(Value::as_u64);
                if completion.is_some() {
                    out.push(NormalizedEvent::Usage(TokenUsage {
                        completion_tokens: completion,
                        ..TokenUsage::default()
                    }));
                }
                if let Some(reason) = v
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(Value::as_str)
                {
                    out.push(NormalizedEvent::done(Some(reason)));
                }
            }
            "message_stop" => out.push(NormalizedEvent::done(None)),
            "error" => {
                let message = error_message(&v).unwrap_or_else(|| "provider error".to_string());
                out.push(NormalizedEvent::error(message));
            }
            _ => {}
        }
    }
    out
}

/**
 * \brief Ollama 逐行 JSON：`response` 为增量文本，`done:true` 结束。
 */
pub fn parse_ollama(fragment: &str) -> Vec<NormalizedEvent> {
    let mut out = Vec::new();
    for line in fragment.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let Ok(v) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if let Some(message) = error_message(&v) {
            out.push(NormalizedEvent::error(message));
            continue;
        }
        let text = v
            .get("response")
            .and_then(Value::as_str)
            .or_else(|| {
                v.get("message")
                    .and_then(|m| m.get("content"))
                    .and_then(Value::as_str)
            })
            .unwrap_or_default();
        if !text.is_empty() {
            out.push(NormalizedEvent::content(text));
        }

        let prompt = v.get("prompt_eval_count").and_then(Value::as_u64);
        let completion = v.get("eval_count").and_then(Value::as_u64);
        if prompt.is_some() || completion.is_some() {
            out.push(NormalizedEvent::Usage(TokenUsage {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: Some(prompt.unwrap_or(0) + completion.unwrap_or(0)),
            }));
        }

        if v.get("done").and_then(Value::as_bool).unwrap_or(false) {
            let reason = v
                .get("done_reason")
                .and_then(Value::as_str)
                .unwrap_or("stop");
            out.push(NormalizedEvent::done(Some(reason)));
        }
    }
    out
}

/**
 * \brief 提取 SSE `data:` 载荷；跳过空行、注释行和 `event:` 行。
 */
fn sse_payloads(fragment: &str) -> impl Iterator<Item = &str> {
    fragment.lines().filter_map(|line| {
        let line = line.trim();
        if line.is_empty() || line.starts_with(':') || line.starts_with("event:") {
            return None;
        }
        let payload = line.strip_prefix("data:").map(str::trim_start).unwrap_or(line);
        if payload.is_empty() {
            None
        } else {
            Some(payload)
        }
    })
}

fn error_message(v: &Value) -> Option<String> {
    let err = v.get("error").filter(|e| !e.is_null())?;
    if let Some(s) = err.as_str() {
        return Some(s.to_string());
    }
    Some(
        err.get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(events: &[NormalizedEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                NormalizedEvent::Content { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_openai_delta_and_done_sentinel() {
        let events = parse_openai_compatible(r#"data: {"choices":[{"delta":{"content":"4"}}]}"#);
        assert_eq!(events, vec![NormalizedEvent::content("4")]);
        assert_eq!(
            parse_openai_compatible("data: [DONE]"),
            vec![NormalizedEvent::done(None)]
        );
    }

    #[test]
    fn test_openai_finish_reason_and_usage() {
        let line = r#"data: {"choices":[{"delta":{"content":"!"},"finish_reason":"stop"}],"usage":{"prompt_tokens":3,"completion_tokens":5,"total_tokens":8}}"#;
        let events = parse_openai_compatible(line);
        assert_eq!(
            events,
            vec![
                NormalizedEvent::content("!"),
                NormalizedEvent::Usage(TokenUsage {
                    prompt_tokens: Some(3),
                    completion_tokens: Some(5),
                    total_tokens: Some(8),
                }),
                NormalizedEvent::done(Some("stop")),
            ]
        );
    }

    #[test]
    fn test_openai_skips_comments_and_garbage() {
        assert!(parse_openai_compatible(": keep-alive").is_empty());
        assert!(parse_openai_compatible("data: {not json").is_empty());
        assert!(parse_openai_compatible("").is_empty());
        assert!(parse_openai_compatible(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#)
            .is_empty());
    }

    #[test]
    fn test_openai_error_payload() {
        let events =
            parse_openai_compatible(r#"data: {"error":{"message":"rate limited","code":429}}"#);
        assert_eq!(events, vec![NormalizedEvent::error("rate limited")]);
    }

    #[test]
    fn test_openai_multiple_lines_in_one_fragment() {
        let fragment = "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"b\"}}]}\n";
        assert_eq!(texts(&parse_openai_compatible(fragment)), "ab");
    }

    #[test]
    fn test_anthropic_content_block_delta_and_stop() {
        let fragment = concat!(
            "event: message_start\n",
            "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":12}}}\n",
            "event: content_block_delta\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n",
            "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n",
            "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":2}}\n",
            "data: {\"type\":\"message_stop\"}\n",
        );
        let events = parse_anthropic(fragment);
        assert_eq!(texts(&events), "Hello");
        assert_eq!(
            events.first(),
            Some(&NormalizedEvent::Usage(TokenUsage {
                prompt_tokens: Some(12),
                ..TokenUsage::default()
            }))
        );
        assert_eq!(
            events.iter().find(|e| e.is_terminal()),
            Some(&NormalizedEvent::done(Some("end_turn")))
        );
    }

    #[test]
    fn test_anthropic_legacy_completion_shape() {
        let events = parse_anthropic(
            r#"data: {"type":"completion","completion":"","text":"Hi","stop_reason":"stop_sequence"}"#,
        );
        assert_eq!(
            events,
            vec![
                NormalizedEvent::content("Hi"),
                NormalizedEvent::done(Some("stop_sequence")),
            ]
        );
    }

    #[test]
    fn test_anthropic_error_event() {
        let events = parse_anthropic(
            r#"data: {"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        );
        assert_eq!(events, vec![NormalizedEvent::error("Overloaded")]);
    }

    #[test]
    fn test_anthropic_ignores_ping_and_garbage() {
        assert!(parse_anthropic(r#"data: {"type":"ping"}"#).is_empty());
        assert!(parse_anthropic("data: <html>").is_empty());
    }

    #[test]
    fn test_ollama_response_usage_and_done() {
        let fragment = "{\"response\":\"Hi\"}\n{\"response\":\" there\"}\n{\"done\":true,\"done_reason\":\"stop\",\"prompt_eval_count\":4,\"eval_count\":2}\n";
        let events = parse_ollama(fragment);
        assert_eq!(
            events,
            vec![
                NormalizedEvent::content("Hi"),
                NormalizedEvent::content(" there"),
                NormalizedEvent::Usage(TokenUsage {
                    prompt_tokens: Some(4),
                    completion_tokens: Some(2),
                    total_tokens: Some(6),
                }),
                NormalizedEvent::done(Some("stop")),
            ]
        );
    }

    #[test]
    fn test_ollama_done_defaults_reason_and_skips_bad_lines() {
        let events = parse_ollama("garbage\n{\"done\":true}");
        assert_eq!(events, vec![NormalizedEvent::done(Some("stop"))]);
    }

    #[test]
    fn test_ollama_chat_shape_and_error() {
        let events = parse_ollama(r#"{"message":{"role":"assistant","content":"yo"},"done":false}"#);
        assert_eq!(events, vec![NormalizedEvent::content("yo")]);
        let events = parse_ollama(r#"{"error":"model 'x' not found"}"#);
        assert_eq!(events, vec![NormalizedEvent::error("model 'x' not found")]);
    }

    #[test]
    fn test_unsupported_yields_error() {
        let events = parse_chunk(WireFormat::Unsupported, "anything");
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], NormalizedEvent::Error { .. }));
    }
}

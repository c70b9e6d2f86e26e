use serde_json::Value;

use crate::family::ModelFamily;

#[derive(Debug, Clone, Copy)]
pub struct SanitizerConfig {
    /// When `true` (default), sibling metadata keys (`groundingMetadata`,
    /// `searchEntryPoint`, non-google keys like `cache_control`) survive a
    /// signature strip and the `metadata` object is only dropped once it's
    /// left empty. When `false`, the whole `metadata` object is dropped as
    /// soon as a signature is stripped out of it, sibling keys included.
    pub preserve_non_signature_metadata: bool,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            preserve_non_signature_metadata: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SanitizeOutcome {
    pub payload: Value,
    pub modified: bool,
    pub signatures_stripped: u32,
}

/// Strip family-incompatible thinking signatures from an outgoing request
/// payload so a conversation can be replayed against a different model
/// family. Recurses into the small closed set of shapes a request body can
/// take; never drops a whole part, only its signature fields (and any
/// metadata wrapper left empty by that removal).
pub fn sanitize_cross_model_payload(
    mut payload: Value,
    target_model: &str,
    config: &SanitizerConfig,
) -> SanitizeOutcome {
    let target = ModelFamily::detect(target_model);
    let mut modified = false;
    let mut signatures_stripped = 0u32;

    if target != ModelFamily::Unknown {
        scan(&mut payload, target, config, &mut signatures_stripped, &mut modified);
    }

    SanitizeOutcome {
        payload,
        modified,
        signatures_stripped,
    }
}

fn scan(
    value: &mut Value,
    target: ModelFamily,
    config: &SanitizerConfig,
    stripped: &mut u32,
    modified: &mut bool,
) {
    let Some(obj) = value.as_object_mut() else {
        return;
    };

    if let Some(contents) = obj.get_mut("contents").and_then(Value::as_array_mut) {
        for content in contents {
            if let Some(parts) = content.get_mut("parts").and_then(Value::as_array_mut) {
                strip_gemini_parts(parts, target, config, stripped, modified);
            }
        }
    }

    if let Some(messages) = obj.get_mut("messages").and_then(Value::as_array_mut) {
        strip_claude_messages(messages, target, stripped, modified);
    }

    if let Some(extra_body) = obj.get_mut("extra_body").and_then(Value::as_object_mut) {
        if let Some(messages) = extra_body.get_mut("messages").and_then(Value::as_array_mut) {
            strip_claude_messages(messages, target, stripped, modified);
        }
    }

    if let Some(requests) = obj.get_mut("requests").and_then(Value::as_array_mut) {
        for request in requests {
            scan(request, target, config, stripped, modified);
        }
    }
}

/// `contents[*].parts` is Gemini-shaped content. Pass through unchanged
/// when the target is also Gemini; otherwise strip `thoughtSignature` and
/// any `metadata.google.thoughtSignature`.
fn strip_gemini_parts(
    parts: &mut [Value],
    target: ModelFamily,
    config: &SanitizerConfig,
    stripped: &mut u32,
    modified: &mut bool,
) {
    if target == ModelFamily::Gemini {
        return;
    }

    for part in parts {
        let Some(part_obj) = part.as_object_mut() else {
            continue;
        };

        if part_obj.remove("thoughtSignature").is_some() {
            *stripped += 1;
            *modified = true;
        }

        let mut drop_metadata = false;
        let mut stripped_from_metadata = false;
        if let Some(metadata) = part_obj.get_mut("metadata").and_then(Value::as_object_mut) {
            if let Some(google) = metadata.get_mut("google").and_then(Value::as_object_mut) {
                if google.remove("thoughtSignature").is_some() {
                    *stripped += 1;
                    *modified = true;
                    stripped_from_metadata = true;
                }
                if google.is_empty() {
                    metadata.remove("google");
                }
            }
            if config.preserve_non_signature_metadata {
                if metadata.is_empty() {
                    drop_metadata = true;
                }
            } else if stripped_from_metadata {
                drop_metadata = true;
            }
        }
        if drop_metadata {
            part_obj.remove("metadata");
        }
    }
}

/// `messages[*].content` (and its `extra_body` mirror) is Claude-shaped.
/// Pass through unchanged when the target is also Claude; otherwise drop
/// `signature` from `thinking`/`redacted_thinking` blocks.
fn strip_claude_messages(
    messages: &mut [Value],
    target: ModelFamily,
    stripped: &mut u32,
    modified: &mut bool,
) {
    if target == ModelFamily::Claude {
        return;
    }

    for message in messages {
        let Some(content) = message.get_mut("content").and_then(Value::as_array_mut) else {
            continue;
        };
        for block in content {
            let Some(block_obj) = block.as_object_mut() else {
                continue;
            };
            let is_thinking_block = matches!(
                block_obj.get("type").and_then(Value::as_str),
                Some("thinking") | Some("redacted_thinking")
            );
            if is_thinking_block && block_obj.remove("signature").is_some() {
                *stripped += 1;
                *modified = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_gemini_signatures_for_claude_target() {
        let payload = json!({
            "contents": [
                {},
                {
                    "parts": [
                        {"thought": true, "text": "...", "thoughtSignature": "x".repeat(60)},
                        {
                            "functionCall": {"name": "Bash", "args": {}},
                            "metadata": {"google": {"thoughtSignature": "y".repeat(60)}}
                        }
                    ]
                }
            ]
        });

        let outcome = sanitize_cross_model_payload(payload, "claude-opus-4-6", &SanitizerConfig::default());
        assert!(outcome.modified);
        assert_eq!(outcome.signatures_stripped, 2);

        let parts = &outcome.payload["contents"][1]["parts"];
        assert!(parts[0].get("thoughtSignature").is_none());
        assert!(parts[1].get("metadata").is_none());
        assert_eq!(parts[1]["functionCall"]["name"], "Bash");
    }

    #[test]
    fn same_family_is_a_no_op() {
        let payload = json!({
            "contents": [{
                "parts": [{"thought": true, "text": "...", "thoughtSignature": "sig"}]
            }]
        });
        let outcome = sanitize_cross_model_payload(payload.clone(), "gemini-3-flash", &SanitizerConfig::default());
        assert!(!outcome.modified);
        assert_eq!(outcome.signatures_stripped, 0);
        assert_eq!(outcome.payload, payload);
    }

    #[test]
    fn sanitization_is_idempotent() {
        let payload = json!({
            "contents": [{
                "parts": [{
                    "thoughtSignature": "sig",
                    "metadata": {"google": {"thoughtSignature": "sig"}, "groundingMetadata": {"x": 1}}
                }]
            }]
        });
        let first = sanitize_cross_model_payload(payload, "claude-opus", &SanitizerConfig::default());
        assert!(first.modified);
        let second = sanitize_cross_model_payload(first.payload, "claude-opus", &SanitizerConfig::default());
        assert!(!second.modified);
        assert_eq!(second.signatures_stripped, 0);
    }

    #[test]
    fn preserves_sibling_metadata_keys() {
        let payload = json!({
            "contents": [{
                "parts": [{
                    "metadata": {
                        "google": {"thoughtSignature": "sig"},
                        "groundingMetadata": {"x": 1}
                    }
                }]
            }]
        });
        let outcome = sanitize_cross_model_payload(payload, "claude-opus", &SanitizerConfig::default());
        let metadata = &outcome.payload["contents"][0]["parts"][0]["metadata"];
        assert!(metadata.get("google").is_none());
        assert_eq!(metadata["groundingMetadata"]["x"], 1);
    }

    #[test]
    fn drops_whole_metadata_object_when_preserve_is_disabled() {
        let payload = json!({
            "contents": [{
                "parts": [{
                    "metadata": {
                        "google": {"thoughtSignature": "sig"},
                        "groundingMetadata": {"x": 1}
                    }
                }]
            }]
        });
        let config = SanitizerConfig { preserve_non_signature_metadata: false };
        let outcome = sanitize_cross_model_payload(payload, "claude-opus", &config);
        assert!(outcome.modified);
        assert!(outcome.payload["contents"][0]["parts"][0].get("metadata").is_none());
    }

    #[test]
    fn strips_claude_thinking_signature_for_gemini_target() {
        let payload = json!({
            "messages": [{
                "role": "assistant",
                "content": [
                    {"type": "thinking", "thinking": "...", "signature": "sig"},
                    {"type": "text", "text": "hello"}
                ]
            }]
        });
        let outcome = sanitize_cross_model_payload(payload, "gemini-3-pro", &SanitizerConfig::default());
        assert!(outcome.modified);
        assert_eq!(outcome.signatures_stripped, 1);
        let content = &outcome.payload["messages"][0]["content"];
        assert!(content[0].get("signature").is_none());
        assert_eq!(content[1]["text"], "hello");
    }

    #[test]
    fn unknown_target_family_makes_no_changes() {
        let payload = json!({
            "contents": [{"parts": [{"thoughtSignature": "sig"}]}]
        });
        let outcome = sanitize_cross_model_payload(payload.clone(), "llama-3", &SanitizerConfig::default());
        assert!(!outcome.modified);
        assert_eq!(outcome.payload, payload);
    }

    #[test]
    fn wrapped_requests_are_recursed_into() {
        let payload = json!({
            "requests": [
                {"contents": [{"parts": [{"thoughtSignature": "sig"}]}]}
            ]
        });
        let outcome = sanitize_cross_model_payload(payload, "claude-opus", &SanitizerConfig::default());
        assert!(outcome.modified);
        assert_eq!(outcome.signatures_stripped, 1);
    }
}

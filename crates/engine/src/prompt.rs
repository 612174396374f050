//! Prompt assembler: template rendering and media separation.
//!
//! The text path renders request messages through the model's chat template
//! with a Jinja-compatible engine. Filesystem access is disabled: the
//! environment has no loader, so includes and extends fail to resolve.
//!
//! The multimodal path rewrites OpenAI-style content arrays into plain
//! messages, replacing each media payload with the engine's media marker and
//! returning the decoded buffers in marker order.

use base64::Engine as _;
use kronk_api::{Error, Result};
use minijinja::{context, Environment, ErrorKind};
use serde_json::Value;

/// The engine's default media marker, expanded during multimodal prefill.
pub const MEDIA_MARKER: &str = "<__media__>";

const MEDIA_TYPES: [&str; 4] = ["image_url", "image", "video_url", "audio_url"];

/// A rendered prompt plus the media buffers aligned with its markers.
#[derive(Debug, Clone)]
pub struct AssembledPrompt {
    pub prompt: String,
    pub media: Vec<Vec<u8>>,
}

/// Renders requests through one resolved chat-template source.
#[derive(Debug, Clone)]
pub struct PromptAssembler {
    template: String,
}

impl PromptAssembler {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Rewrite media content, render the template, return prompt + buffers.
    pub fn assemble(&self, request: &Value) -> Result<AssembledPrompt> {
        let (request, media) = openai_to_media(request)?;
        let prompt = self.render(&request)?;

        Ok(AssembledPrompt { prompt, media })
    }

    /// Render the request's messages (and tools, when present) through the
    /// template. The result must be non-empty.
    pub fn render(&self, request: &Value) -> Result<String> {
        let messages = request
            .get("messages")
            .ok_or_else(|| Error::invalid("missing messages field"))?;

        let tools = request.get("tools").cloned().unwrap_or(Value::Null);

        let env = environment();
        let prompt = env
            .render_str(
                &self.template,
                context! {
                    messages => messages,
                    tools => tools,
                    add_generation_prompt => true,
                },
            )
            .map_err(|e| Error::invalid(format!("failed to execute template: {e}")))?;

        if prompt.is_empty() {
            return Err(Error::invalid("template produced an empty prompt"));
        }

        Ok(prompt)
    }
}

/// The rendering environment. `items()` on maps yields `[key, value]` pairs
/// sorted by key: request documents travel as serde_json maps, which keep
/// their keys ordered.
fn environment() -> Environment<'static> {
    let mut env = Environment::new();

    env.add_function("strftime_now", |format: String| {
        chrono::Local::now().format(&format).to_string()
    });

    env.add_function(
        "raise_exception",
        |msg: String| -> std::result::Result<String, minijinja::Error> {
            Err(minijinja::Error::new(ErrorKind::InvalidOperation, msg))
        },
    );

    env
}

/// Whether any message carries an OpenAI-style media content array.
pub fn is_media_request(request: &Value) -> bool {
    let Some(messages) = request.get("messages").and_then(Value::as_array) else {
        return false;
    };

    messages.iter().any(|message| {
        message
            .get("content")
            .and_then(Value::as_array)
            .map(|docs| {
                docs.iter().any(|doc| {
                    doc.get("type")
                        .and_then(Value::as_str)
                        .map(|t| MEDIA_TYPES.contains(&t))
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    })
}

/// Rewrite OpenAI media content into marker messages plus decoded buffers.
/// A request without media passes through unchanged.
pub fn openai_to_media(request: &Value) -> Result<(Value, Vec<Vec<u8>>)> {
    let mut request = request.clone();

    let messages = request
        .get("messages")
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| Error::invalid("missing messages field"))?;

    let mut rewritten = Vec::with_capacity(messages.len());
    let mut media: Vec<Vec<u8>> = Vec::new();

    for message in &messages {
        let content = message
            .get("content")
            .ok_or_else(|| Error::invalid("expecting content field"))?;

        // A plain string means text only; the message passes through.
        if content.is_string() {
            rewritten.push(message.clone());
            continue;
        }

        let docs = content.as_array().ok_or_else(|| {
            Error::invalid("expecting the content field to be an array of documents")
        })?;

        // The text and media travel in two separate documents.
        if docs.len() != 2 {
            return Err(Error::invalid(
                "expecting 2 documents inside the content field",
            ));
        }

        let mut text: Option<String> = None;
        let mut data: Option<Vec<u8>> = None;

        for doc in docs {
            let typ = doc.get("type").and_then(Value::as_str).unwrap_or_default();

            if typ == "text" {
                text = Some(
                    doc.get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                );
                continue;
            }

            let field = doc
                .get(typ)
                .ok_or_else(|| Error::invalid(format!("missing {typ:?} field under content")))?;

            let obj = field
                .as_object()
                .ok_or_else(|| Error::invalid(format!("{typ:?} field is not a document")))?;

            let payload = obj
                .get("url")
                .or_else(|| obj.get("data"))
                .ok_or_else(|| Error::invalid("expecting url or data field"))?;

            let payload = payload
                .as_str()
                .ok_or_else(|| Error::invalid("expecting media to be a base64 string"))?;

            data = Some(decode_media(payload)?);
        }

        let (Some(text), Some(data)) = (text, data) else {
            return Err(Error::invalid(
                "expecting one text and one media document inside the content field",
            ));
        };

        let role = message
            .get("role")
            .and_then(Value::as_str)
            .unwrap_or("user");

        // The media message precedes its text, each marker on its own line.
        rewritten.push(serde_json::json!({
            "role": role,
            "content": format!("{MEDIA_MARKER}\n"),
        }));
        rewritten.push(serde_json::json!({
            "role": role,
            "content": text,
        }));

        media.push(data);
    }

    request["messages"] = Value::Array(rewritten);

    Ok((request, media))
}

/// Strip any `data:…;base64,` prefix and decode the payload.
fn decode_media(payload: &str) -> Result<Vec<u8>> {
    let payload = match payload.find(";base64,") {
        Some(idx) if payload.starts_with("data:") => &payload[idx + ";base64,".len()..],
        _ => payload,
    };

    base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| Error::invalid(format!("unable to decode base64 data: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHATML: &str = "{% for m in messages %}<|im_start|>{{ m.role }}\n{{ m.content }}<|im_end|>\n{% endfor %}{% if add_generation_prompt %}<|im_start|>assistant\n{% endif %}";

    fn image_request(text: &str, encoded: &str) -> Value {
        serde_json::json!({
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": text},
                    {"type": "image_url", "image_url": {"url": encoded}},
                ],
            }],
        })
    }

    #[test]
    fn text_requests_pass_through_unchanged() {
        let request = serde_json::json!({
            "messages": [{"role": "user", "content": "hello"}],
        });

        let (rewritten, media) = openai_to_media(&request).unwrap();
        assert_eq!(rewritten, request);
        assert!(media.is_empty());
        assert!(!is_media_request(&request));
    }

    #[test]
    fn media_is_decoded_and_replaced_with_markers() {
        let data = b"this is not really an image but it will do";
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
        let request = image_request("what do you see in the picture?", &encoded);

        assert!(is_media_request(&request));

        let (rewritten, media) = openai_to_media(&request).unwrap();
        assert_eq!(media.len(), 1);
        assert_eq!(media[0], data);

        let messages = rewritten["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(
            messages[0]["content"].as_str().unwrap(),
            format!("{MEDIA_MARKER}\n")
        );
        assert_eq!(
            messages[1]["content"].as_str().unwrap(),
            "what do you see in the picture?"
        );
    }

    #[test]
    fn data_uri_prefixes_are_stripped() {
        let data = b"pixels";
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
        let payload = format!("data:image/png;base64,{encoded}");

        assert_eq!(decode_media(&payload).unwrap(), data);
        assert_eq!(decode_media(&encoded).unwrap(), data);
    }

    #[test]
    fn malformed_media_requests_are_invalid() {
        // Missing messages entirely.
        let request = serde_json::json!({});
        assert!(matches!(
            openai_to_media(&request),
            Err(Error::InvalidArgument(_))
        ));

        // Wrong document count.
        let request = serde_json::json!({
            "messages": [{"role": "user", "content": [{"type": "text", "text": "x"}]}],
        });
        assert!(matches!(
            openai_to_media(&request),
            Err(Error::InvalidArgument(_))
        ));

        // Bad base64.
        let request = image_request("hi", "!!! not base64 !!!");
        assert!(matches!(
            openai_to_media(&request),
            Err(Error::InvalidArgument(_))
        ));

        // Missing content field.
        let request = serde_json::json!({"messages": [{"role": "user"}]});
        assert!(matches!(
            openai_to_media(&request),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn render_is_stable_across_calls() {
        let assembler = PromptAssembler::new(CHATML);
        let request = serde_json::json!({
            "messages": [{"role": "user", "content": "Echo back the word: Gorilla"}],
        });

        let first = assembler.render(&request).unwrap();
        let second = assembler.render(&request).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            first,
            "<|im_start|>user\nEcho back the word: Gorilla<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[test]
    fn empty_render_is_invalid() {
        let assembler = PromptAssembler::new("");
        let request = serde_json::json!({"messages": []});
        assert!(matches!(
            assembler.render(&request),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn raise_exception_aborts_the_render() {
        let assembler = PromptAssembler::new("{{ raise_exception('unsupported role') }}");
        let request = serde_json::json!({"messages": []});

        match assembler.render(&request) {
            Err(Error::InvalidArgument(msg)) => assert!(msg.contains("unsupported role")),
            other => panic!("expected invalid-argument, got {other:?}"),
        }
    }

    #[test]
    fn items_yields_key_sorted_pairs() {
        let assembler = PromptAssembler::new(
            "{% for kv in messages[0].content.items() %}{{ kv[0] }}={{ kv[1] }};{% endfor %}",
        );

        // serde_json maps keep keys ordered, so items() is deterministic.
        let request = serde_json::json!({
            "messages": [{"role": "user", "content": {"zeta": 1, "alpha": 2}}],
        });

        let out = assembler.render(&request).unwrap();
        assert_eq!(out, "alpha=2;zeta=1;");
    }

    #[test]
    fn strftime_now_renders_a_date() {
        let assembler = PromptAssembler::new("today: {{ strftime_now('%Y-%m-%d') }}");
        let request = serde_json::json!({"messages": []});

        let out = assembler.render(&request).unwrap();
        assert!(out.starts_with("today: "));
        assert_eq!(out.len(), "today: 2026-01-01".len());
    }

    #[test]
    fn assemble_returns_prompt_and_buffers() {
        let data = b"giraffe pixels";
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
        let assembler = PromptAssembler::new(CHATML);

        let assembled = assembler
            .assemble(&image_request("What is in this picture?", &encoded))
            .unwrap();

        assert!(assembled.prompt.contains(MEDIA_MARKER));
        assert!(assembled.prompt.contains("What is in this picture?"));
        assert_eq!(assembled.media, vec![data.to_vec()]);
    }
}

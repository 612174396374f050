//! Request types for chat, vision and embedding calls.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// Request for chat models. Tools are optional; when present the model may
/// answer with a tool call instead of completion content.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDef>,
    #[serde(default)]
    pub params: SamplingParams,
}

/// Request for vision models. The image is read from disk and expanded into
/// the prompt through the projection file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionRequest {
    pub image_path: PathBuf,
    pub message: ChatMessage,
    #[serde(default)]
    pub params: SamplingParams,
}

/// Request for embedding models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedRequest {
    pub text: String,
}

/// Sampling options for a single request. Unset fields take engine defaults;
/// `max_tokens` defaults to the model's context window minus the prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub typical_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat_last_n: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

/// A single argument of a tool parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
}

/// The function half of a tool definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFunction {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

/// A tool the model may call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: ToolFunction,
}

impl ToolDef {
    /// Create a function tool with the given name and description.
    pub fn function(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: "function".to_string(),
            function: ToolFunction {
                name: name.into(),
                description: description.into(),
                parameters: serde_json::Map::new(),
            },
        }
    }

    /// Add a named parameter to the tool function.
    pub fn with_parameter(mut self, name: &str, arg: ToolParameter) -> Self {
        self.function
            .parameters
            .insert("type".to_string(), serde_json::json!("object"));

        let properties = self
            .function
            .parameters
            .entry("properties".to_string())
            .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));

        if let Some(properties) = properties.as_object_mut() {
            properties.insert(
                name.to_string(),
                serde_json::json!({"type": arg.kind, "description": arg.description}),
            );
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampling_params_parse_from_an_openai_body() {
        let body = serde_json::json!({
            "model": "qwen2.5-0.5b-instruct-q8_0",
            "messages": [{"role": "user", "content": "hi"}],
            "temperature": 0.2,
            "max_tokens": 64,
            "stop": ["</s>"],
            "stream": true,
        });

        let params: SamplingParams = serde_json::from_value(body).unwrap();
        assert_eq!(params.temperature, Some(0.2));
        assert_eq!(params.max_tokens, Some(64));
        assert_eq!(params.stop, vec!["</s>".to_string()]);
        assert!(params.top_p.is_none());
    }

    #[test]
    fn tool_builder_accumulates_parameters() {
        let tool = ToolDef::function("get_weather", "weather lookup")
            .with_parameter(
                "location",
                ToolParameter {
                    kind: "string".to_string(),
                    description: "city".to_string(),
                },
            )
            .with_parameter(
                "unit",
                ToolParameter {
                    kind: "string".to_string(),
                    description: "celsius or fahrenheit".to_string(),
                },
            );

        assert_eq!(tool.kind, "function");
        let properties = tool.function.parameters["properties"].as_object().unwrap();
        assert!(properties.contains_key("location"));
        assert!(properties.contains_key("unit"));
    }
}

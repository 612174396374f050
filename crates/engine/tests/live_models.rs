//! End-to-end scenarios against real model files. Models are resolved
//! through the standard layout, so point KRONK_MODELS at a directory
//! containing the .gguf files below and run:
//!
//!   cargo test -p kronk_engine --test live_models -- --ignored
//!
//! Every streaming test routes through `check_stream_invariants`, which
//! asserts the properties that hold for every stream regardless of model.

use kronk_api::{
    CancelToken, ChatMessage, ChatRequest, ChatResponse, EmbedRequest, SamplingParams, ToolDef,
    VisionRequest, FINISH_REASON_ERROR, FINISH_REASON_STOP, ROLE_ASSISTANT,
};
use kronk_core::Config;
use kronk_engine::Dispatcher;
use std::path::PathBuf;

const SIMPLE_CHAT_MODEL: &str = "qwen2.5-0.5b-instruct-q8_0";
const THINK_CHAT_MODEL: &str = "Qwen3-8B-Q8_0";
const GPT_CHAT_MODEL: &str = "gpt-oss-20b-Q8_0";
const VISION_MODEL: &str = "Qwen2.5-VL-3B-Instruct-Q8_0";
const EMBED_MODEL: &str = "embeddinggemma-300m-qat-Q8_0";

fn dispatcher() -> Dispatcher {
    Dispatcher::new(Config::default()).expect("dispatcher")
}

fn echo_request() -> ChatRequest {
    ChatRequest {
        messages: vec![ChatMessage::new("user", "Echo back the word: Gorilla")],
        tools: Vec::new(),
        params: SamplingParams::default(),
    }
}

fn weather_request() -> ChatRequest {
    ChatRequest {
        messages: vec![ChatMessage::new(
            "user",
            "What is the weather like in London, England?",
        )],
        tools: vec![ToolDef::function("get_weather", "Get the current weather for a location")
            .with_parameter(
                "location",
                kronk_api::ToolParameter {
                    kind: "string".to_string(),
                    description: "The city and country".to_string(),
                },
            )],
        params: SamplingParams::default(),
    }
}

async fn collect(mut rx: tokio::sync::mpsc::Receiver<ChatResponse>) -> Vec<ChatResponse> {
    let mut responses = Vec::new();
    while let Some(response) = rx.recv().await {
        responses.push(response);
    }
    responses
}

/// The properties every stream must satisfy.
fn check_stream_invariants(responses: &[ChatResponse]) {
    assert!(!responses.is_empty(), "stream produced no responses");

    let terminal = responses.last().unwrap();
    assert!(
        !terminal.finish_reason().is_empty(),
        "last response must be terminal"
    );

    let terminal_count = responses
        .iter()
        .filter(|r| !r.finish_reason().is_empty())
        .count();
    assert_eq!(terminal_count, 1, "exactly one terminal response");

    let mut content = String::new();
    let mut reasoning = String::new();
    let mut last_index = 0;

    for response in responses {
        let choice = &response.choices[0];
        let usage = &response.usage;

        assert_eq!(choice.delta.role, ROLE_ASSISTANT);

        assert_eq!(
            usage.output_tokens,
            usage.reasoning_tokens + usage.completion_tokens,
            "output = reasoning + completion"
        );

        assert!(
            choice.index > last_index || responses.len() == 1,
            "indices strictly increase: {} then {}",
            last_index,
            choice.index
        );
        last_index = choice.index;

        assert_eq!(response.id, responses[0].id, "stream id is stable");

        if response.finish_reason().is_empty() {
            content.push_str(&choice.delta.content);
            reasoning.push_str(&choice.delta.reasoning);
        }
    }

    if terminal.finish_reason() == FINISH_REASON_STOP {
        let delta = &terminal.choices[0].delta;
        assert_eq!(delta.content, content, "content concatenation matches");
        assert_eq!(delta.reasoning, reasoning, "reasoning concatenation matches");
    }
}

// =============================================================================

#[tokio::test]
#[ignore = "requires local model files"]
async fn simple_chat_echoes_the_word() {
    let dispatcher = dispatcher();
    let cancel = CancelToken::new();

    let rx = dispatcher
        .chat_stream(&cancel, SIMPLE_CHAT_MODEL, echo_request())
        .await
        .expect("stream");

    let responses = collect(rx).await;
    check_stream_invariants(&responses);

    let terminal = responses.last().unwrap();
    assert_eq!(terminal.finish_reason(), FINISH_REASON_STOP);
    assert!(terminal.choices[0].delta.content.contains("Gorilla"));
    assert_eq!(terminal.choices[0].delta.reasoning, "");
    assert!(terminal.usage.input_tokens > 0);
    assert!(terminal.usage.completion_tokens > 0);
    assert_eq!(terminal.usage.reasoning_tokens, 0);
}

#[tokio::test]
#[ignore = "requires local model files"]
async fn reasoning_chat_splits_regions() {
    let dispatcher = dispatcher();
    let cancel = CancelToken::new();

    let rx = dispatcher
        .chat_stream(&cancel, THINK_CHAT_MODEL, echo_request())
        .await
        .expect("stream");

    let responses = collect(rx).await;
    check_stream_invariants(&responses);

    let terminal = responses.last().unwrap();
    assert_eq!(terminal.finish_reason(), FINISH_REASON_STOP);
    assert!(terminal.choices[0].delta.content.contains("Gorilla"));
    assert!(terminal.choices[0].delta.reasoning.contains("Gorilla"));
    assert!(terminal.usage.reasoning_tokens > 0);
    assert!(terminal.usage.completion_tokens > 0);
}

#[tokio::test]
#[ignore = "requires local model files"]
async fn tool_call_via_tool_call_tags() {
    let dispatcher = dispatcher();
    let cancel = CancelToken::new();

    let rx = dispatcher
        .chat_stream(&cancel, THINK_CHAT_MODEL, weather_request())
        .await
        .expect("stream");

    let responses = collect(rx).await;
    check_stream_invariants(&responses);

    let terminal = responses.last().unwrap();
    assert_eq!(terminal.finish_reason(), FINISH_REASON_STOP);
    assert_eq!(terminal.choices[0].delta.content, "");

    let calls = &terminal.choices[0].delta.tool_calls;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].name, "get_weather");
    assert!(calls[0].arguments["location"]
        .as_str()
        .unwrap_or_default()
        .contains("London"));
    assert!(!calls[0].id.is_empty());
}

#[tokio::test]
#[ignore = "requires local model files"]
async fn tool_call_via_channel_dialect() {
    let dispatcher = dispatcher();
    let cancel = CancelToken::new();

    let rx = dispatcher
        .chat_stream(&cancel, GPT_CHAT_MODEL, weather_request())
        .await
        .expect("stream");

    let responses = collect(rx).await;
    check_stream_invariants(&responses);

    let terminal = responses.last().unwrap();
    let calls = &terminal.choices[0].delta.tool_calls;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].name, "get_weather");
    assert!(calls[0].arguments["location"]
        .as_str()
        .unwrap_or_default()
        .contains("London"));
}

#[tokio::test]
#[ignore = "requires local model files and images/samples/giraffe.jpg"]
async fn vision_describes_the_picture() {
    let dispatcher = dispatcher();
    let cancel = CancelToken::new();

    let image = std::env::var("KRONK_TEST_IMAGE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("images/samples/giraffe.jpg"));

    let rx = dispatcher
        .vision_stream(
            &cancel,
            VISION_MODEL,
            VisionRequest {
                image_path: image,
                message: ChatMessage::new("user", "What is in this picture?"),
                params: SamplingParams::default(),
            },
        )
        .await
        .expect("stream");

    let responses = collect(rx).await;
    check_stream_invariants(&responses);

    let terminal = responses.last().unwrap();
    assert_eq!(terminal.object, "vision");
    assert_eq!(terminal.finish_reason(), FINISH_REASON_STOP);
    assert!(terminal.choices[0]
        .delta
        .content
        .to_lowercase()
        .contains("giraffe"));
}

#[tokio::test]
#[ignore = "requires local model files"]
async fn embedding_is_unit_length() {
    let dispatcher = dispatcher();
    let cancel = CancelToken::new();

    let vector = dispatcher
        .embed(
            &cancel,
            EMBED_MODEL,
            EmbedRequest {
                text: "Embed this sentence".to_string(),
            },
        )
        .await
        .expect("embedding");

    let info = dispatcher.model_info(EMBED_MODEL).await.expect("info");
    assert_eq!(vector.len(), info.n_embd as usize);
    assert!(vector.first().copied().unwrap_or(0.0) != 0.0);
    assert!(vector.last().copied().unwrap_or(0.0) != 0.0);

    let norm: f64 = vector.iter().map(|v| (*v as f64) * (*v as f64)).sum();
    assert!((norm.sqrt() - 1.0).abs() < 1e-6);
}

// =============================================================================

#[tokio::test]
#[ignore = "requires local model files"]
async fn max_tokens_zero_terminates_immediately() {
    let dispatcher = dispatcher();
    let cancel = CancelToken::new();

    let mut request = echo_request();
    request.params.max_tokens = Some(0);

    let rx = dispatcher
        .chat_stream(&cancel, SIMPLE_CHAT_MODEL, request)
        .await
        .expect("stream");

    let responses = collect(rx).await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].finish_reason(), FINISH_REASON_STOP);
    assert_eq!(responses[0].choices[0].delta.content, "");
}

#[tokio::test]
#[ignore = "requires local model files"]
async fn cancellation_emits_at_most_one_more_response() {
    let dispatcher = dispatcher();
    let cancel = CancelToken::new();

    let mut rx = dispatcher
        .chat_stream(&cancel, SIMPLE_CHAT_MODEL, echo_request())
        .await
        .expect("stream");

    // Let the stream produce something, then pull the plug. Deltas already
    // buffered in the channel may still arrive; after them the stream ends
    // with at most one error terminal.
    let first = rx.recv().await.expect("first response");
    assert!(first.finish_reason().is_empty());
    cancel.cancel("test cancellation");

    let mut terminals = 0;
    let mut last_was_terminal = false;
    while let Some(response) = rx.recv().await {
        last_was_terminal = !response.finish_reason().is_empty();
        if last_was_terminal {
            terminals += 1;
            assert_eq!(response.finish_reason(), FINISH_REASON_ERROR);
        }
    }
    assert!(terminals <= 1, "at most one error terminal after cancellation");
    assert!(terminals == 0 || last_was_terminal, "the terminal comes last");
}

#[tokio::test]
#[ignore = "requires local model files"]
async fn unload_reports_busy_while_streaming() {
    let dispatcher = dispatcher();
    let cancel = CancelToken::new();

    let mut rx = dispatcher
        .chat_stream(&cancel, SIMPLE_CHAT_MODEL, echo_request())
        .await
        .expect("stream");

    // A stream is outstanding, so a zero-deadline unload must report busy.
    let _ = rx.recv().await;
    match dispatcher
        .unload(SIMPLE_CHAT_MODEL, Some(std::time::Duration::ZERO))
        .await
    {
        Err(kronk_api::Error::Busy { active }) => assert!(active > 0),
        other => panic!("expected busy, got {other:?}"),
    }

    drop(rx);
}

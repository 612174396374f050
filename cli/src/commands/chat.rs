//! One-shot chat against a local model

use anyhow::Result;
use kronk_api::{CancelToken, ChatMessage, ChatRequest, SamplingParams, FINISH_REASON_ERROR};
use kronk_core::Config;
use kronk_engine::Dispatcher;
use std::io::Write;

pub async fn execute(
    model: &str,
    prompt: &str,
    max_tokens: Option<usize>,
    temperature: Option<f32>,
) -> Result<()> {
    let dispatcher = Dispatcher::new(Config::load()?)?;
    let cancel = CancelToken::new();

    let request = ChatRequest {
        messages: vec![ChatMessage::new("user", prompt)],
        tools: Vec::new(),
        params: SamplingParams {
            max_tokens,
            temperature,
            ..Default::default()
        },
    };

    let mut rx = dispatcher.chat_stream(&cancel, model, request).await?;
    let mut stdout = std::io::stdout();

    while let Some(response) = rx.recv().await {
        let choice = &response.choices[0];

        if response.is_terminal() {
            if choice.finish_reason == FINISH_REASON_ERROR {
                anyhow::bail!("{}", choice.delta.content);
            }

            println!();
            println!();
            println!(
                "[input: {} tokens, output: {} tokens, {:.1} tok/s]",
                response.usage.input_tokens,
                response.usage.output_tokens,
                response.usage.tokens_per_second,
            );
            break;
        }

        if !choice.delta.reasoning.is_empty() {
            eprint!("{}", choice.delta.reasoning);
        }
        if !choice.delta.content.is_empty() {
            print!("{}", choice.delta.content);
            stdout.flush()?;
        }
    }

    Ok(())
}

//! Compute an embedding vector

use anyhow::Result;
use kronk_api::{CancelToken, EmbedRequest};
use kronk_core::Config;
use kronk_engine::Dispatcher;

pub async fn execute(model: &str, text: &str) -> Result<()> {
    let dispatcher = Dispatcher::new(Config::load()?)?;
    let cancel = CancelToken::new();

    let vector = dispatcher
        .embed(
            &cancel,
            model,
            EmbedRequest {
                text: text.to_string(),
            },
        )
        .await?;

    println!("{}", serde_json::to_string(&vector)?);
    eprintln!("[{} dimensions]", vector.len());

    Ok(())
}

//! Show a model's card information

use anyhow::Result;
use kronk_core::Config;
use kronk_engine::Dispatcher;

pub async fn execute(model: &str) -> Result<()> {
    let dispatcher = Dispatcher::new(Config::load()?)?;
    let info = dispatcher.model_info(model).await?;

    println!("{}", serde_json::to_string_pretty(&info)?);

    Ok(())
}

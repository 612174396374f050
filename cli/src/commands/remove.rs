//! Remove a model from disk

use anyhow::Result;
use kronk_core::Layout;

pub async fn execute(model: &str) -> Result<()> {
    let removed = Layout::new().remove_model(model)?;

    println!("Removed {}", removed.model_file.display());
    if let Some(proj) = removed.projection_file {
        println!("Removed {}", proj.display());
    }

    Ok(())
}

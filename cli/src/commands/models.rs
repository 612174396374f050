//! List models on disk

use anyhow::Result;
use kronk_core::Layout;

pub async fn execute() -> Result<()> {
    let layout = Layout::new();
    let models = layout.list_models()?;

    if models.is_empty() {
        println!("No models found in {}", layout.models_dir().display());
        return Ok(());
    }

    println!("{:<48} {:>10} {}", "MODEL", "SIZE", "PROJECTION");
    for model in models {
        let size = std::fs::metadata(&model.model_file)
            .map(|m| format_size(m.len()))
            .unwrap_or_else(|_| "-".to_string());

        let projection = if model.projection_file.is_some() {
            "yes"
        } else {
            ""
        };

        println!("{:<48} {:>10} {}", model.id, size, projection);
    }

    Ok(())
}

fn format_size(bytes: u64) -> String {
    const GB: f64 = 1024.0 * 1024.0 * 1024.0;
    const MB: f64 = 1024.0 * 1024.0;

    let bytes = bytes as f64;
    if bytes >= GB {
        format!("{:.1} GB", bytes / GB)
    } else {
        format!("{:.0} MB", bytes / MB)
    }
}

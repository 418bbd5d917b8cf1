//! `pulse config`.

use std::path::Path;

use anyhow::Result;
use pulse_core::ClientConfig;

/// Print the resolved configuration with secrets masked.
pub fn show(config: &ClientConfig, path: &Path, json_output: bool) -> Result<()> {
    let mut shown = config.clone();
    shown.anon_key = shown.anon_key.as_deref().map(mask);
    shown.ai_key = shown.ai_key.as_deref().map(mask);

    if json_output {
        println!("{}", serde_json::to_string_pretty(&shown)?);
        return Ok(());
    }
    println!("# {}", path.display());
    print!("{}", toml::to_string_pretty(&shown)?);
    println!();
    println!("# backend: {}", if config.is_backend_configured() { "configured" } else { "not configured" });
    println!("# text generation: {}", if config.is_ai_configured() { "configured" } else { "pass-through" });
    Ok(())
}

fn mask(secret: &str) -> String {
    let visible: String = secret.chars().take(4).collect();
    format!("{}…", visible)
}

use anyhow::Result;
use serde_json::json;
use std::path::PathBuf;
use tracing::info;

use formpilot::config::FlowConfig;

/// Print the effective configuration, optionally writing the defaults first
pub fn handle_config(path: Option<PathBuf>, init: bool) -> Result<()> {
    let path = match path {
        Some(p) => p,
        None => FlowConfig::default_path()?,
    };

    if init {
        if path.exists() {
            anyhow::bail!("Config file '{}' already exists", path.display());
        }
        FlowConfig::default().save(&path)?;
        info!("Wrote default config to {}", path.display());
    }

    let config = FlowConfig::load(Some(&path)).or_else(|e| {
        if path.exists() {
            Err(e)
        } else {
            Ok(FlowConfig::default())
        }
    })?;
    let output = json!({
        "path": path.display().to_string(),
        "exists": path.exists(),
        "config": config,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

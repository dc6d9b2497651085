//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command and drives the
//! muster-core engine through an [`Engine`] built by [`init_engine`].

pub mod artifact;
pub mod plan;
pub mod template;

use muster_core::{Engine, EngineConfig};
use std::collections::HashMap;

/// Global flags shared by every command.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub config: Option<String>,
    pub db: Option<String>,
    pub template_dir: Option<String>,
}

/// Build an engine from the config file (or defaults) plus command-line
/// overrides.
pub fn init_engine(options: &EngineOptions) -> Result<Engine, String> {
    let mut config = match &options.config {
        Some(path) => {
            tracing::info!("[CLI] Loading config from '{}'", path);
            EngineConfig::from_file(path).map_err(|e| e.to_string())?
        }
        None => EngineConfig::default(),
    };
    if let Some(db) = &options.db {
        config.artifact_db_path = Some(db.clone());
    }
    if let Some(dir) = &options.template_dir {
        config.template_dirs.push(dir.clone());
    }
    let engine = Engine::from_config(config).map_err(|e| e.to_string())?;
    tracing::info!(
        "[CLI] Engine ready: {} template(s), artifacts {}",
        engine.templates().list().len(),
        engine.config().artifact_db_path.as_deref().unwrap_or("in memory")
    );
    Ok(engine)
}

/// Parse `key=value` pairs into a plan context. Values that parse as JSON
/// keep their type; anything else is a string.
pub fn parse_context(entries: &[String]) -> Result<HashMap<String, serde_json::Value>, String> {
    let mut context = HashMap::new();
    for entry in entries {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| format!("Invalid context entry '{}', expected key=value", entry))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("Invalid context entry '{}': empty key", entry));
        }
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        context.insert(key.to_string(), value);
    }
    Ok(context)
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}…", kept)
    }
}

//! `muster artifact`: inspect the artifact store.
//!
//! Only meaningful with a durable store (`--db` / `MUSTER_DB_PATH`); the
//! in-memory store starts empty for every invocation.

use muster_core::models::DEFAULT_CONTENT_TYPE;
use muster_core::Engine;

use super::print_json;

pub async fn list(engine: &Engine, prefix: &str) -> Result<(), String> {
    let keys = engine.artifacts().list(prefix).await.map_err(|e| e.to_string())?;
    if keys.is_empty() {
        println!("No artifacts under '{}'.", prefix);
        return Ok(());
    }
    for key in &keys {
        println!("{}", key);
    }
    println!("\n{} artifact(s)", keys.len());
    Ok(())
}

pub async fn show(engine: &Engine, key: &str, content_type: &str) -> Result<(), String> {
    let content = engine
        .artifacts()
        .load(key, content_type)
        .await
        .map_err(|e| e.to_string())?;

    if content_type == DEFAULT_CONTENT_TYPE {
        let value: serde_json::Value = serde_json::from_slice(&content)
            .map_err(|e| format!("Artifact {} is not valid JSON: {}", key, e))?;
        print_json(&value);
    } else {
        println!("{}", String::from_utf8_lossy(&content));
    }
    Ok(())
}

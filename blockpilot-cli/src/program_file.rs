use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use blockpilot::ProgramGraph;
use serde_json::Value;

/// A program read from disk.
///
/// Accepts either a bare workspace document or the `{name, data,
/// failsafeEnabled}` record the program store hands out.
#[derive(Debug)]
pub struct ProgramFile {
    pub graph: ProgramGraph,
    /// Workspace document text, unwrapped from any store record.
    pub document: String,
    /// Failsafe setting carried by a store record.
    pub failsafe: Option<bool>,
}

pub fn parse_program(text: &str) -> Result<ProgramFile> {
    let value: Value = serde_json::from_str(text).context("Program is not valid JSON")?;

    if let Some(data) = value.get("data").and_then(Value::as_str) {
        if value.get("blocks").is_none() {
            let failsafe = value
                .get("failsafeEnabled")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            let graph = ProgramGraph::from_json_str(data)
                .context("Stored program contains an invalid workspace document")?;
            return Ok(ProgramFile {
                graph,
                document: data.to_string(),
                failsafe: Some(failsafe),
            });
        }
    }

    let graph = ProgramGraph::from_value(value).context("Invalid workspace document")?;
    Ok(ProgramFile {
        graph,
        document: text.to_string(),
        failsafe: None,
    })
}

pub fn read_program(path: &Path) -> Result<ProgramFile> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read program file {}", path.display()))?;
    parse_program(&text).with_context(|| format!("Failed to load {}", path.display()))
}

/// Writes a workspace document, pretty-printed when it parses as JSON.
pub fn write_document(path: &Path, document: &str) -> Result<()> {
    let text = match serde_json::from_str::<Value>(document) {
        Ok(value) => serde_json::to_string_pretty(&value)?,
        Err(_) => document.to_string(),
    };
    fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))
}

//! Descriptor - 関数フォルダの JSON 設定
//!
//! ```json
//! { "name": "hello", "function": { "route": "/hi", "type": "http", "entry": "index", "subscribesTo": "ticker" } }
//! ```
//!
//! `name` だけが必須。`route` は `"/" + name`、`type` は `http` がデフォルト。

use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use super::FunctionKind;
use crate::error::{FnHostError, Result};

#[derive(Debug, Deserialize)]
struct RawDescriptor {
    name: Option<String>,
    #[serde(default)]
    function: Option<RawFunction>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFunction {
    route: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    entry: Option<String>,
    subscribes_to: Option<String>,
}

/// Parsed descriptor with defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    pub name: String,
    pub route: String,
    pub kind: FunctionKind,
    /// Entry point override; loaders fall back to their own default.
    pub entry: Option<String>,
    /// Trigger name whose emissions this function receives.
    pub subscribes_to: Option<String>,
    /// The whole descriptor, kept opaque for listing.
    pub raw: Value,
}

impl Descriptor {
    /// Parse descriptor text. `path` is only used in error messages.
    pub fn parse(path: &Path, text: &str) -> Result<Self> {
        let raw: Value = serde_json::from_str(text)
            .map_err(|e| FnHostError::configuration(path, format!("malformed JSON: {e}")))?;
        let parsed: RawDescriptor = serde_json::from_value(raw.clone())
            .map_err(|e| FnHostError::configuration(path, e.to_string()))?;

        let name = match parsed.name {
            Some(name) if !name.trim().is_empty() => name,
            _ => return Err(FnHostError::configuration(path, "missing required field `name`")),
        };
        let function = parsed.function.unwrap_or_default();

        let kind = match function.kind {
            None => FunctionKind::Http,
            Some(kind) => FunctionKind::parse(&kind)
                .ok_or_else(|| FnHostError::UnrecognizedKind { name: name.clone(), kind })?,
        };

        let route = match function.route {
            Some(route) if route.starts_with('/') => route,
            Some(route) => format!("/{route}"),
            None => format!("/{name}"),
        };

        Ok(Self {
            name,
            route,
            kind,
            entry: function.entry.filter(|e| !e.trim().is_empty()),
            subscribes_to: function.subscribes_to.filter(|t| !t.is_empty()),
            raw,
        })
    }

    /// Read `folder/file_name` and parse it.
    pub async fn read(folder: &Path, file_name: &str) -> Result<Self> {
        let path = folder.join(file_name);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| FnHostError::configuration(&path, format!("cannot read descriptor: {e}")))?;
        Self::parse(&path, &text)
    }
}

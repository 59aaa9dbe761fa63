//! Data models for MCP replies.
//!
//! Tool calls answer with a compact `key: value` summary instead of their full
//! result, and park the bulk data (element trees) in a JSON artifact file
//! named by the `file` field. Everything here is decoded tolerantly: missing
//! fields reduce what can be asserted, they never fail decoding.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum number of elements the server returns in one traversal.
pub const ELEMENT_CAP: usize = 5_000;

/// Guidance line the server appends to summaries that reference an artifact.
pub const ARTIFACT_GUIDANCE: &str = "DO NOT read the full file";

// =============================================================================
// Handshake
// =============================================================================

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

/// MCP initialize response payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitializeResult {
    #[serde(default, rename = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default, rename = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

impl InitializeResult {
    /// Decode leniently; an unexpected shape yields an empty result.
    pub fn from_value(value: Value) -> Self {
        serde_json::from_value(value).unwrap_or_default()
    }

    /// `name version` for logs, or `unknown server`.
    pub fn server_label(&self) -> String {
        match &self.server_info {
            Some(ServerInfo {
                name: Some(name),
                version,
            }) => match version {
                Some(v) => format!("{} {}", name, v),
                None => name.clone(),
            },
            _ => "unknown server".to_string(),
        }
    }
}

// =============================================================================
// Capabilities
// =============================================================================

/// One entry of `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Value,
}

impl ToolDescriptor {
    /// Extract `result.tools`, in order. Entries without a name are skipped.
    pub fn list_from_result(result: &Value) -> Vec<ToolDescriptor> {
        result
            .get("tools")
            .and_then(Value::as_array)
            .map(|tools| {
                tools
                    .iter()
                    .filter_map(|tool| serde_json::from_value(tool.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

// =============================================================================
// Compact Tool Results
// =============================================================================

/// Decoded compact summary of one `tools/call`.
///
/// Format:
///
/// ```text
/// status: success
/// pid: 4242
/// app: TextEdit
/// file: /tmp/macos-use/open_1700000000.json
/// file_size: 48213 bytes (311 elements)
/// visible_elements:
///   [AXButton] "Close" (12,8 14x16)
/// ```
///
/// Only unindented `key: value` lines are fields. Indented lines belong to a
/// listing section and are kept in `raw` only.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    raw: String,
    fields: HashMap<String, String>,
    /// The reply's MCP `isError` flag.
    flagged_error: bool,
}

impl ToolResult {
    /// Parse compact summary text.
    pub fn parse(text: &str) -> Self {
        let mut fields = HashMap::new();

        for line in text.split('\n') {
            if line.starts_with(|c: char| c == ' ' || c == '\t') {
                continue;
            }
            if let Some((key, value)) = line.split_once(": ") {
                fields.insert(key.trim().to_string(), value.trim().to_string());
            }
        }

        Self {
            raw: text.to_string(),
            fields,
            flagged_error: false,
        }
    }

    /// Decode a `tools/call` result: the first content block's text, or an
    /// empty summary when there are no content blocks.
    pub fn from_call_result(result: &Value) -> Self {
        let text = result
            .get("content")
            .and_then(Value::as_array)
            .and_then(|blocks| blocks.first())
            .and_then(|block| block.get("text"))
            .and_then(Value::as_str)
            .unwrap_or("");

        let mut parsed = Self::parse(text);
        parsed.flagged_error = result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        parsed
    }

    /// Summary standing in for a tool call the server rejected with a
    /// JSON-RPC error object.
    pub fn from_rpc_error(code: i64, message: &str) -> Self {
        let mut parsed = Self::parse(&format!(
            "status: error\nerror: Server error {}: {}",
            code, message
        ));
        parsed.flagged_error = true;
        parsed
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Any top-level field by key.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn fields(&self) -> &HashMap<String, String> {
        &self.fields
    }

    /// `status`, or `unknown` when absent.
    pub fn status(&self) -> &str {
        self.field("status").unwrap_or("unknown")
    }

    pub fn is_success(&self) -> bool {
        self.status() == "success"
    }

    /// The tool reported a failure, either in its summary or via `isError`.
    pub fn is_error(&self) -> bool {
        self.status() == "error" || self.flagged_error
    }

    /// Numeric `pid`; a missing or non-numeric value is `None`.
    pub fn pid(&self) -> Option<i64> {
        self.field("pid").and_then(|v| v.parse().ok())
    }

    pub fn app(&self) -> Option<&str> {
        self.field("app")
    }

    pub fn file(&self) -> Option<&str> {
        self.field("file")
    }

    pub fn file_size(&self) -> Option<&str> {
        self.field("file_size")
    }

    /// `summary`, or an empty string.
    pub fn summary(&self) -> &str {
        self.field("summary").unwrap_or("")
    }

    /// `error`, falling back to `traversal_error`.
    pub fn error(&self) -> Option<&str> {
        self.field("error")
            .filter(|e| !e.is_empty())
            .or_else(|| self.field("traversal_error"))
    }

    /// Lines of the indented element listing (`  [AXRole] "text" ...`).
    pub fn visible_element_lines(&self) -> Vec<&str> {
        self.raw
            .split('\n')
            .filter(|line| line.starts_with("  ["))
            .collect()
    }

    /// Load the artifact named by `file`.
    ///
    /// No `file` field, or a path that does not exist, yields an empty
    /// artifact. A file that exists but cannot be read or parsed is an error.
    pub fn load_artifact(&self) -> Result<Artifact> {
        match self.file() {
            Some(path) => Artifact::load(Path::new(path)),
            None => Ok(Artifact::default()),
        }
    }
}

impl std::fmt::Display for ToolResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ToolResult(status={}, pid={:?}, app={:?}, summary={:?})",
            self.status(),
            self.pid(),
            self.app(),
            self.summary()
        )
    }
}

// =============================================================================
// Artifacts
// =============================================================================

/// Full JSON document a tool persisted next to its compact summary.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    document: Value,
}

impl Default for Artifact {
    fn default() -> Self {
        Self {
            document: Value::Object(serde_json::Map::new()),
        }
    }
}

impl Artifact {
    /// Read and parse `path`. A missing file is an empty artifact.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read artifact {}", path.display()))?;
        let document = serde_json::from_str(&content)
            .with_context(|| format!("Artifact {} is not valid JSON", path.display()))?;

        Ok(Self { document })
    }

    pub fn from_value(document: Value) -> Self {
        Self { document }
    }

    /// True for an empty document (no file, or `{}`).
    pub fn is_empty(&self) -> bool {
        match &self.document {
            Value::Object(map) => map.is_empty(),
            Value::Null => true,
            _ => false,
        }
    }

    /// `traversal.elements` as raw JSON, in order.
    pub fn raw_elements(&self) -> &[Value] {
        self.document
            .pointer("/traversal/elements")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// `traversal.elements` decoded, one entry per raw element.
    pub fn elements(&self) -> Vec<Element> {
        self.raw_elements().iter().map(Element::from_value).collect()
    }

    pub fn element_count(&self) -> usize {
        self.raw_elements().len()
    }

    pub fn stats(&self) -> TraversalStats {
        self.document
            .pointer("/traversal/stats")
            .cloned()
            .and_then(|s| serde_json::from_value(s).ok())
            .unwrap_or_default()
    }

    /// More elements than the server may ever return.
    ///
    /// Exactly [`ELEMENT_CAP`] elements with `truncated: true` is the normal
    /// capped case, not a violation.
    pub fn exceeds_cap(&self) -> bool {
        self.element_count() > ELEMENT_CAP
    }
}

/// `traversal.stats` of an artifact.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TraversalStats {
    /// `None` when the server omitted the key.
    #[serde(default)]
    pub truncated: Option<bool>,
    #[serde(default)]
    pub visible_elements_count: Option<u64>,
}

impl TraversalStats {
    pub fn is_truncated(&self) -> bool {
        self.truncated.unwrap_or(false)
    }
}

/// One accessibility element from a traversal.
///
/// Decoded field by field so that a `null` or oddly typed value only blanks
/// that field. Coordinates keep the JSON number the server sent so they can
/// be passed back unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Element {
    pub role: Option<String>,
    pub text: Option<String>,
    pub x: Option<Value>,
    pub y: Option<Value>,
    pub width: Option<Value>,
    pub height: Option<Value>,
    pub in_viewport: Option<bool>,
}

impl Element {
    pub fn from_value(value: &Value) -> Self {
        let string = |key: &str| value.get(key).and_then(Value::as_str).map(str::to_string);
        let number = |key: &str| value.get(key).filter(|v| v.is_number()).cloned();

        Self {
            role: string("role"),
            text: string("text"),
            x: number("x"),
            y: number("y"),
            width: number("width"),
            height: number("height"),
            in_viewport: value.get("in_viewport").and_then(Value::as_bool),
        }
    }

    pub fn role(&self) -> &str {
        self.role.as_deref().unwrap_or("")
    }

    pub fn text(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }

    pub fn is_in_viewport(&self) -> bool {
        self.in_viewport.unwrap_or(false)
    }

    pub fn has_position(&self) -> bool {
        self.x.is_some() && self.y.is_some()
    }

    pub fn has_area(&self) -> bool {
        let nonzero = |v: &Option<Value>| v.as_ref().and_then(Value::as_f64).is_some_and(|n| n != 0.0);
        nonzero(&self.width) && nonzero(&self.height)
    }

    /// Visible, labelled, sized button or static text.
    pub fn is_click_candidate(&self) -> bool {
        self.is_in_viewport()
            && !self.text().trim().is_empty()
            && self.has_area()
            && (self.role().contains("Button") || self.role().contains("StaticText"))
    }

    /// Visible and containing `needle`, case-insensitively.
    pub fn matches_search(&self, needle: &str) -> bool {
        self.is_in_viewport() && self.text().to_lowercase().contains(&needle.to_lowercase())
    }
}

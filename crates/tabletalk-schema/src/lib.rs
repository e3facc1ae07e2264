//! Table schema loading for tabletalk.
//!
//! A schema file describes the one table the agent may query. Three formats
//! are accepted, tried in order:
//!
//! 1. JSON with a `fields` array: `{"fields": [{"name": .., "type": ..,
//!    "description": ..}, ..]}`
//! 2. JSON with a `columns` map: `{"columns": {"city": "varchar", ..}}`
//! 3. Plain text, one `name: type` pair per line (`#` comments ignored)
//!
//! The parsed schema is read-only for the whole session: it sources both the
//! prompt schema text shown to the model and the identifier allow-list used
//! to catch hallucinated column references.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One column of the queryable table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub dtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, dtype: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dtype: dtype.into(),
            description: None,
        }
    }
}

/// The schema of the single table the agent answers questions about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table_name: String,
    pub columns: Vec<ColumnInfo>,
}

impl TableSchema {
    /// Ordered column names (the "schema provider" contract).
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Full schema text for prompt construction, one column per line with
    /// type and (when present) description.
    pub fn to_prompt_text(&self) -> String {
        let mut lines = vec![format!("Table: {}", self.table_name), "Columns:".to_string()];
        for c in &self.columns {
            let desc = c
                .description
                .as_deref()
                .map(|d| format!(" - {d}"))
                .unwrap_or_default();
            lines.push(format!("- {} ({}){desc}", c.name, c.dtype));
        }
        lines.join("\n")
    }

    /// Compact schema text restricted to a caller-chosen subset of columns.
    ///
    /// Wide tables drown small models; callers that know which columns matter
    /// can trim the prompt down to them. Columns not in `important` are
    /// omitted; an empty filter falls back to the full listing.
    pub fn to_compact_prompt_text(&self, important: &[&str]) -> String {
        if important.is_empty() {
            return self.to_prompt_text();
        }
        let mut lines = vec![format!("Table: {}", self.table_name), "Columns:".to_string()];
        for c in self.columns.iter().filter(|c| important.contains(&c.name.as_str())) {
            lines.push(format!("- {} ({})", c.name, c.dtype));
        }
        lines.join("\n")
    }
}

#[derive(Deserialize)]
struct FieldsFile {
    fields: Vec<FieldEntry>,
}

#[derive(Deserialize)]
struct FieldEntry {
    name: String,
    #[serde(default, rename = "type")]
    dtype: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Deserialize)]
struct ColumnsFile {
    columns: serde_json::Map<String, serde_json::Value>,
}

/// Read a schema file into a [`TableSchema`].
pub fn read_schema(path: &Path, table_name: &str) -> Result<TableSchema> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read schema file {}", path.display()))?;
    parse_schema(&raw, table_name)
        .with_context(|| format!("failed to parse schema file {}", path.display()))
}

/// Parse schema text (any accepted format) into a [`TableSchema`].
pub fn parse_schema(raw: &str, table_name: &str) -> Result<TableSchema> {
    if let Ok(f) = serde_json::from_str::<FieldsFile>(raw) {
        let columns = f
            .fields
            .into_iter()
            .map(|f| ColumnInfo {
                name: f.name,
                dtype: f.dtype.unwrap_or_else(|| "unknown".to_string()),
                description: f.description,
            })
            .collect::<Vec<_>>();
        if !columns.is_empty() {
            return Ok(TableSchema {
                table_name: table_name.to_string(),
                columns,
            });
        }
    }

    if let Ok(f) = serde_json::from_str::<ColumnsFile>(raw) {
        let columns = f
            .columns
            .into_iter()
            .map(|(name, v)| {
                let dtype = match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                ColumnInfo::new(name, dtype)
            })
            .collect::<Vec<_>>();
        if !columns.is_empty() {
            return Ok(TableSchema {
                table_name: table_name.to_string(),
                columns,
            });
        }
    }

    // JSON that matched neither shape must not reach the line parser; it
    // would fabricate columns out of JSON syntax.
    if serde_json::from_str::<serde_json::Value>(raw).is_ok() {
        return Err(anyhow!(
            "JSON schema has no usable `fields` array or `columns` map"
        ));
    }

    // Plain-text fallback: `name: type` lines.
    let mut columns = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((left, right)) = line.split_once(':') {
            let name = left.trim().trim_matches('`');
            let dtype = right.trim();
            if !name.is_empty() && !dtype.is_empty() {
                columns.push(ColumnInfo::new(name, dtype));
            }
        }
    }

    if columns.is_empty() {
        return Err(anyhow!(
            "schema text contains no recognizable columns (expected JSON `fields`/`columns` or `name: type` lines)"
        ));
    }

    Ok(TableSchema {
        table_name: table_name.to_string(),
        columns,
    })
}

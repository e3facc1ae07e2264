//! Answer rendering: plan, result table, narrative fields → markdown text.

use tabletalk_agent::{AnswerPayload, Table};

/// How many result rows to show in the rendered table. The row cap on the
/// query itself is separate; this only bounds the display.
const DISPLAY_ROWS: usize = 30;

fn cell_text(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Render a result table as a markdown table, capped at `max_rows` rows.
pub fn markdown_table(table: &Table, max_rows: usize) -> String {
    if table.is_empty() {
        return "_No rows returned._".to_string();
    }

    let mut out = String::new();
    out.push_str(&format!("| {} |\n", table.columns.join(" | ")));
    out.push_str(&format!(
        "|{}\n",
        " --- |".repeat(table.columns.len())
    ));
    for row in table.rows.iter().take(max_rows) {
        let cells: Vec<String> = row.iter().map(cell_text).collect();
        out.push_str(&format!("| {} |\n", cells.join(" | ")));
    }
    if table.row_count() > max_rows {
        out.push_str(&format!("_... {} more rows_\n", table.row_count() - max_rows));
    }
    out.trim_end().to_string()
}

/// Assemble the full answer text shown to the user.
pub fn render_answer(question: &str, payload: &AnswerPayload) -> String {
    let mut parts = Vec::new();
    parts.push(format!("**Question:** {question}"));
    if !payload.plan.is_empty() {
        let plan = payload
            .plan
            .iter()
            .map(|p| format!("- {p}"))
            .collect::<Vec<_>>()
            .join("\n");
        parts.push(format!("**Plan:**\n{plan}"));
    }
    parts.push(format!(
        "**Result:**\n{}",
        markdown_table(&payload.table, DISPLAY_ROWS)
    ));
    if !payload.interpretation.is_empty() {
        parts.push(format!("**Interpretation:** {}", payload.interpretation));
    }
    if !payload.assumptions.is_empty() {
        let assumptions = payload
            .assumptions
            .iter()
            .map(|a| format!("- {a}"))
            .collect::<Vec<_>>()
            .join("\n");
        parts.push(format!("**Assumptions:**\n{assumptions}"));
    }
    if !payload.followups.is_empty() {
        let followups = payload
            .followups
            .iter()
            .map(|f| format!("- {f}"))
            .collect::<Vec<_>>()
            .join("\n");
        parts.push(format!("**Suggested follow-ups:**\n{followups}"));
    }
    parts.join("\n\n")
}

//! Prompt construction for generation and repair turns.

use crate::state::ConversationState;

/// Widest relative-date window the model is told to use.
const MAX_DAYS: u32 = 400;

/// The JSON output contract plus the query rules the guards later enforce.
fn output_contract(table_view: &str, max_rows: usize) -> String {
    format!(
        r#"Return ONLY valid JSON (no markdown) with this shape:
{{
  "analysis_plan": ["..."],
  "sql": "WITH ... SELECT ...",
  "result_interpretation": "...",
  "assumptions": ["..."],
  "followups": ["..."]
}}

Rules:
- Use ONLY the available table/view names and columns.
- Prefer querying the view {table_view} which includes date_parsed.
- For "last N days": filter date_parsed >= (SELECT MAX(date_parsed) FROM {table_view}) - INTERVAL '{MAX_DAYS} days'
- Always protect division with NULLIF.
- ALWAYS exclude NULL/empty dimension values in GROUP BY queries (e.g., city IS NOT NULL AND city <> '').
- If asked "Which X has the highest ...", return ONLY the top 1 row using ORDER BY ... DESC LIMIT 1.
- Always include a LIMIT {max_rows} unless the query returns exactly 1 row.
- Never use write operations (no CREATE/DROP/INSERT/UPDATE/DELETE)."#
    )
}

/// The system prompt: schema, output contract, optional domain metric notes,
/// output style rules.
pub fn system_prompt(
    schema_text: &str,
    table_view: &str,
    max_rows: usize,
    domain_notes: &[String],
) -> String {
    let mut out = format!(
        r#"You are an expert analytics agent. You answer questions by generating SQL and interpreting results.

Available schema:
{schema_text}

You MUST follow this output contract:
{contract}"#,
        contract = output_contract(table_view, max_rows),
    );

    if !domain_notes.is_empty() {
        out.push_str("\n\nBusiness metric definitions (use when relevant):\n");
        for note in domain_notes {
            out.push_str(&format!("- {note}\n"));
        }
    }

    out.push_str(
        r#"
Output style rules:
- analysis_plan must have 2-4 short bullet items, not placeholders like "step1".
- result_interpretation should be 1-2 lines max."#,
    );
    out
}

/// Preamble of every repair turn.
pub const REFINE_PROMPT: &str = r#"The previous SQL failed or returned unusable output.

Given:
1) The user's question
2) The previous SQL
3) The error message OR why the output is unusable

Return ONLY valid JSON in the same format, with a corrected SQL.

Rules:
- Ensure SQL is complete and syntactically valid (all parentheses closed, no trailing WITH)."#;

/// The user message of a generation turn: lightly injected context (last
/// question + accumulated filters) followed by the question itself.
pub fn context_user_message(state: &ConversationState, question: &str) -> String {
    let context = serde_json::json!({
        "last_question": state.last_question,
        "last_filters": state.last_filters,
        "note": "If the new question is a follow-up like 'what about Mumbai?', apply those filters on top of last_filters.",
    });
    format!("Conversation context JSON:\n{context}\n\nUser question:\n{question}")
}

/// The user message of a repair turn: question, failing SQL, raw error.
pub fn refine_user_message(question: &str, prev_sql: &str, error: &str) -> String {
    format!("User question:\n{question}\n\nPrevious SQL:\n{prev_sql}\n\nError/Issue:\n{error}")
}

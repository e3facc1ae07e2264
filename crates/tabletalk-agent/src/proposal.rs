//! Structured-proposal decoding.
//!
//! The model must answer with one JSON object:
//!
//! ```json
//! {
//!   "analysis_plan": ["..."],
//!   "sql": "WITH ... SELECT ...",
//!   "result_interpretation": "...",
//!   "assumptions": ["..."],
//!   "followups": ["..."]
//! }
//! ```
//!
//! Only `sql` is strictly required; the other fields degrade to empty. Models
//! sometimes wrap the object in prose or a markdown fence, so decoding first
//! tries the text verbatim and then extracts the first *complete*
//! brace-balanced object (brace counting outside string state, which is more
//! robust than `rfind('}')` and never selects an inner brace).

use serde_json::Value;

/// One turn's proposed answer, consumed once per attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryProposal {
    pub plan: Vec<String>,
    pub sql: String,
    pub interpretation: String,
    pub assumptions: Vec<String>,
    pub followups: Vec<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProposalError {
    #[error("model response was not a JSON object: {0}")]
    Malformed(String),
    #[error("model proposal carries no usable `sql` string")]
    MissingSql,
}

/// Decode a raw model response into a [`QueryProposal`].
///
/// Structural failure (not an object) is [`ProposalError::Malformed`]; an
/// absent, non-string, or blank `sql` is [`ProposalError::MissingSql`]. No
/// partial recovery in either case.
pub fn parse_proposal(text: &str) -> Result<QueryProposal, ProposalError> {
    let object = extract_json_object(text)?;

    let sql = match object.get("sql") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        _ => return Err(ProposalError::MissingSql),
    };

    Ok(QueryProposal {
        plan: string_list(object.get("analysis_plan")),
        sql,
        interpretation: string_field(object.get("result_interpretation")),
        assumptions: string_list(object.get("assumptions")),
        followups: string_list(object.get("followups")),
    })
}

fn string_field(v: Option<&Value>) -> String {
    v.and_then(Value::as_str).unwrap_or_default().to_string()
}

fn string_list(v: Option<&Value>) -> Vec<String> {
    v.and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn extract_json_object(text: &str) -> Result<Value, ProposalError> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        if v.is_object() {
            return Ok(v);
        }
    }

    let Some(start) = trimmed.find('{') else {
        return Err(ProposalError::Malformed("no '{' found".to_string()));
    };

    let mut depth: i64 = 0;
    let mut in_string = false;
    let mut escape = false;
    let mut end: Option<usize> = None;

    for (idx, ch) in trimmed.char_indices().skip(start) {
        if in_string {
            if escape {
                escape = false;
                continue;
            }
            match ch {
                '\\' => escape = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(idx);
                    break;
                }
            }
            _ => {}
        }
    }

    let Some(end) = end else {
        return Err(ProposalError::Malformed(
            "no complete JSON object found".to_string(),
        ));
    };

    serde_json::from_str(&trimmed[start..=end]).map_err(|e| ProposalError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"{
        "analysis_plan": ["filter last 15 days", "aggregate by city"],
        "sql": "SELECT city FROM t_v",
        "result_interpretation": "top city by orders",
        "assumptions": ["dates parse"],
        "followups": ["split by platform?"]
    }"#;

    #[test]
    fn parses_complete_proposal() {
        let p = parse_proposal(FULL).unwrap();
        assert_eq!(p.plan.len(), 2);
        assert_eq!(p.sql, "SELECT city FROM t_v");
        assert_eq!(p.interpretation, "top city by orders");
        assert_eq!(p.assumptions, vec!["dates parse"]);
        assert_eq!(p.followups, vec!["split by platform?"]);
    }

    #[test]
    fn missing_optional_fields_default_to_empty() {
        let p = parse_proposal(r#"{"sql": "SELECT 1"}"#).unwrap();
        assert!(p.plan.is_empty());
        assert!(p.interpretation.is_empty());
        assert!(p.assumptions.is_empty());
        assert!(p.followups.is_empty());
    }

    #[test]
    fn extracts_object_from_markdown_fence() {
        let text = format!("Here you go:\n```json\n{FULL}\n```\nanything else?");
        let p = parse_proposal(&text).unwrap();
        assert_eq!(p.sql, "SELECT city FROM t_v");
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_extraction() {
        let text = r#"note: {"sql": "SELECT '}' FROM t_v"} trailing"#;
        let p = parse_proposal(text).unwrap();
        assert_eq!(p.sql, "SELECT '}' FROM t_v");
    }

    #[test]
    fn missing_sql_is_its_own_error() {
        let err = parse_proposal(r#"{"analysis_plan": ["a"]}"#).unwrap_err();
        assert!(matches!(err, ProposalError::MissingSql));
    }

    #[test]
    fn non_string_sql_is_missing() {
        let err = parse_proposal(r#"{"sql": 42}"#).unwrap_err();
        assert!(matches!(err, ProposalError::MissingSql));
    }

    #[test]
    fn blank_sql_is_missing() {
        let err = parse_proposal(r#"{"sql": "   "}"#).unwrap_err();
        assert!(matches!(err, ProposalError::MissingSql));
    }

    #[test]
    fn non_object_is_malformed() {
        assert!(matches!(
            parse_proposal("[1, 2, 3]"),
            Err(ProposalError::Malformed(_))
        ));
        assert!(matches!(
            parse_proposal("no json here"),
            Err(ProposalError::Malformed(_))
        ));
    }

    #[test]
    fn truncated_object_is_malformed() {
        assert!(matches!(
            parse_proposal(r#"{"sql": "SELECT 1" "#),
            Err(ProposalError::Malformed(_))
        ));
    }

    #[test]
    fn non_string_list_entries_are_dropped() {
        let p = parse_proposal(r#"{"sql": "SELECT 1", "assumptions": ["ok", 7, null]}"#).unwrap();
        assert_eq!(p.assumptions, vec!["ok"]);
    }
}

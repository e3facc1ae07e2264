//! Conversational memory carried across turns.
//!
//! The state is a small value owned by the caller: passed in each turn,
//! returned updated on success, returned untouched on any failure. Turns
//! replace the value instead of mutating it, so each turn's before/after
//! state stays inspectable and no locking is ever needed.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::engine::Table;

/// Memory carried across turns of one session.
///
/// `last_filters` is monotonically additive within a conversation unless the
/// caller resets it; a failed turn never touches it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationState {
    pub last_question: Option<String>,
    pub last_sql: Option<String>,
    #[serde(default)]
    pub last_filters: BTreeMap<String, String>,
    /// The sole value of the designated entity column from the most recent
    /// single-row result; resolves follow-ups like "that top city".
    pub top_entity: Option<String>,
}

impl ConversationState {
    /// The successor state after a successful turn: question and SQL
    /// replaced, filters copied forward and augmented from the question
    /// text, `top_entity` refreshed only by a one-row result that carries
    /// the entity column.
    pub fn after_success(
        &self,
        question: &str,
        sql: &str,
        table: &Table,
        lexicon: &FilterLexicon,
    ) -> ConversationState {
        let mut filters = self.last_filters.clone();
        filters.extend(lexicon.extract(question));

        let top_entity = single_row_entity(table, &lexicon.entity_column)
            .or_else(|| self.top_entity.clone());

        ConversationState {
            last_question: Some(question.to_string()),
            last_sql: Some(sql.to_string()),
            last_filters: filters,
            top_entity,
        }
    }
}

fn single_row_entity(table: &Table, entity_column: &str) -> Option<String> {
    if table.row_count() != 1 {
        return None;
    }
    let idx = table.column_index(entity_column)?;
    match table.rows[0].get(idx)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Substitute a remembered entity for the literal phrase "top city".
///
/// This is a narrow, literal substitution, not coreference resolution: if the
/// question mentions "top city" and a remembered entity exists, both "that
/// top city" and "top city" are replaced with the entity before the prompt is
/// built.
pub fn resolve_top_entity_phrase(question: &str, top_entity: Option<&str>) -> String {
    let Some(entity) = top_entity.map(str::trim).filter(|e| !e.is_empty()) else {
        return question.to_string();
    };
    if !question.to_lowercase().contains("top city") {
        return question.to_string();
    }
    question
        .replace("that top city", entity)
        .replace("top city", entity)
}

/// Fixed question-scanning vocabulary for filter extraction.
///
/// Deliberately small and swappable: the orchestration loop only calls
/// [`FilterLexicon::extract`], so a richer (or data-driven) extractor can
/// replace this without touching the loop.
#[derive(Debug, Clone)]
pub struct FilterLexicon {
    /// (surface form found in the question, canonical stored value)
    cities: Vec<(String, String)>,
    platforms: Vec<String>,
    pub city_key: String,
    pub platform_key: String,
    /// Result column whose single-row value becomes `top_entity`.
    pub entity_column: String,
}

impl Default for FilterLexicon {
    fn default() -> Self {
        let cities = [
            ("mumbai", "Mumbai"),
            ("delhi", "Delhi"),
            ("bangalore", "Bangalore"),
            // Canonical spelling: both surface forms store the same value.
            ("bengaluru", "Bangalore"),
            ("pune", "Pune"),
            ("hyderabad", "Hyderabad"),
            ("chennai", "Chennai"),
            ("kolkata", "Kolkata"),
            ("ahmedabad", "Ahmedabad"),
        ]
        .into_iter()
        .map(|(s, c)| (s.to_string(), c.to_string()))
        .collect();

        Self {
            cities,
            platforms: vec!["web".to_string(), "app".to_string()],
            city_key: "city".to_string(),
            platform_key: "platform".to_string(),
            entity_column: "city".to_string(),
        }
    }
}

impl FilterLexicon {
    /// Scan the raw question (case-insensitive) for vocabulary matches; each
    /// match sets/overwrites the corresponding filter key.
    pub fn extract(&self, question: &str) -> BTreeMap<String, String> {
        let qlow = question.to_lowercase();
        let mut filters = BTreeMap::new();

        for (surface, canonical) in &self.cities {
            if qlow.contains(surface.as_str()) {
                filters.insert(self.city_key.clone(), canonical.clone());
            }
        }

        for platform in &self.platforms {
            if qlow.contains(&format!(" {platform}")) || qlow.ends_with(platform.as_str()) {
                filters.insert(self.platform_key.clone(), platform.clone());
            }
        }

        filters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn one_row_table() -> Table {
        Table {
            columns: vec!["city".to_string(), "orders".to_string()],
            rows: vec![vec![json!("Mumbai"), json!(120)]],
        }
    }

    fn multi_row_table() -> Table {
        Table {
            columns: vec!["city".to_string()],
            rows: vec![vec![json!("Pune")], vec![json!("Delhi")]],
        }
    }

    #[test]
    fn extracts_city_with_canonical_spelling() {
        let lex = FilterLexicon::default();
        let filters = lex.extract("How is Bengaluru doing?");
        assert_eq!(filters.get("city").map(String::as_str), Some("Bangalore"));
    }

    #[test]
    fn extracts_platform() {
        let lex = FilterLexicon::default();
        let filters = lex.extract("how about that city on web?");
        assert_eq!(filters.get("platform").map(String::as_str), Some("web"));
    }

    #[test]
    fn no_matches_yields_empty() {
        let lex = FilterLexicon::default();
        assert!(lex.extract("total orders overall").is_empty());
    }

    #[test]
    fn after_success_replaces_question_and_sql() {
        let state = ConversationState::default();
        let next = state.after_success(
            "orders in Pune",
            "SELECT 1",
            &multi_row_table(),
            &FilterLexicon::default(),
        );
        assert_eq!(next.last_question.as_deref(), Some("orders in Pune"));
        assert_eq!(next.last_sql.as_deref(), Some("SELECT 1"));
        assert_eq!(next.last_filters.get("city").map(String::as_str), Some("Pune"));
    }

    #[test]
    fn filters_accumulate_across_turns() {
        let lex = FilterLexicon::default();
        let s1 = ConversationState::default().after_success(
            "orders in Mumbai",
            "q1",
            &multi_row_table(),
            &lex,
        );
        let s2 = s1.after_success("now on app", "q2", &multi_row_table(), &lex);
        assert_eq!(s2.last_filters.get("city").map(String::as_str), Some("Mumbai"));
        assert_eq!(s2.last_filters.get("platform").map(String::as_str), Some("app"));
    }

    #[test]
    fn single_row_result_sets_top_entity() {
        let state = ConversationState::default();
        let next = state.after_success("top city?", "q", &one_row_table(), &FilterLexicon::default());
        assert_eq!(next.top_entity.as_deref(), Some("Mumbai"));
    }

    #[test]
    fn multi_row_result_keeps_previous_top_entity() {
        let state = ConversationState {
            top_entity: Some("Mumbai".to_string()),
            ..Default::default()
        };
        let next = state.after_success("all cities", "q", &multi_row_table(), &FilterLexicon::default());
        assert_eq!(next.top_entity.as_deref(), Some("Mumbai"));
    }

    #[test]
    fn single_row_without_entity_column_keeps_previous() {
        let table = Table {
            columns: vec!["orders".to_string()],
            rows: vec![vec![json!(5)]],
        };
        let state = ConversationState {
            top_entity: Some("Delhi".to_string()),
            ..Default::default()
        };
        let next = state.after_success("total?", "q", &table, &FilterLexicon::default());
        assert_eq!(next.top_entity.as_deref(), Some("Delhi"));
    }

    #[test]
    fn resolves_top_city_phrase() {
        let out = resolve_top_entity_phrase("how about that top city on web?", Some("Mumbai"));
        assert_eq!(out, "how about Mumbai on web?");
    }

    #[test]
    fn bare_top_city_phrase_also_resolves() {
        let out = resolve_top_entity_phrase("top city by revenue?", Some("Pune"));
        assert_eq!(out, "Pune by revenue?");
    }

    #[test]
    fn no_entity_leaves_question_alone() {
        let q = "how about that top city on web?";
        assert_eq!(resolve_top_entity_phrase(q, None), q);
        assert_eq!(resolve_top_entity_phrase(q, Some("  ")), q);
    }

    #[test]
    fn unrelated_question_is_untouched() {
        let q = "orders by platform";
        assert_eq!(resolve_top_entity_phrase(q, Some("Mumbai")), q);
    }
}

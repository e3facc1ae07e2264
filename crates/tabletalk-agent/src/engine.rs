//! The external query-engine boundary.
//!
//! The core never links a database. It hands verified SQL to a
//! [`QueryEngine`] and gets back ordered rows with named columns, or an
//! error whose message is passed verbatim into the repair prompt.
//!
//! Implementations must be shareable (`Send + Sync`); an engine wrapping a
//! single connection that is not safe for concurrent use must serialize
//! access internally.

use serde::{Deserialize, Serialize};

/// Execution failed inside the engine. The message is the engine's own
/// human-readable diagnostic, unmodified.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct EngineError(pub String);

/// A tabular query result: ordered rows, named columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl Table {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Index of a column by name, case-insensitively (engines disagree on
    /// result-column casing).
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
    }
}

pub trait QueryEngine: Send + Sync {
    fn execute(&self, sql: &str) -> Result<Table, EngineError>;
}

/// Deterministic scripted engine for tests and offline demos: returns its
/// queued outcomes in order, one per call.
pub struct ScriptedEngine {
    outcomes: std::sync::Mutex<std::collections::VecDeque<Result<Table, EngineError>>>,
}

impl ScriptedEngine {
    pub fn new(outcomes: Vec<Result<Table, EngineError>>) -> Self {
        Self {
            outcomes: std::sync::Mutex::new(outcomes.into_iter().collect()),
        }
    }

    pub fn push(&self, outcome: Result<Table, EngineError>) {
        self.outcomes
            .lock()
            .expect("scripted engine lock poisoned")
            .push_back(outcome);
    }
}

impl QueryEngine for ScriptedEngine {
    fn execute(&self, _sql: &str) -> Result<Table, EngineError> {
        self.outcomes
            .lock()
            .expect("scripted engine lock poisoned")
            .pop_front()
            .unwrap_or_else(|| Err(EngineError("scripted engine has no outcomes left".to_string())))
    }
}

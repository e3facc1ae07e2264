//! tabletalk core: the query-synthesis safety-and-repair loop.
//!
//! A user question plus the prior conversation state goes in; the agent
//! prompts a chat model for a structured proposal, verifies the proposed SQL
//! (read-only shape, known identifiers, row cap), executes it through an
//! external engine, repairs failures with a bounded re-prompt cycle, and
//! returns the result plus the updated state.
//!
//! The pipeline, in one line:
//!
//!   "model proposes → tabletalk verifies → engine executes"
//!
//! Everything the model emits is untrusted until it has passed the guards in
//! [`guard`] and [`identifiers`].

pub mod agent;
pub mod engine;
pub mod guard;
pub mod identifiers;
pub mod proposal;
pub mod prompts;
pub mod state;

pub use agent::{Agent, AnswerPayload, TurnError, TurnReply};
pub use engine::{EngineError, QueryEngine, Table};
pub use guard::{ensure_limit, is_safe_select, validate, ValidationOutcome};
pub use proposal::{parse_proposal, ProposalError, QueryProposal};
pub use state::{ConversationState, FilterLexicon};

/// Strictness of the identifier validator.
///
/// The validator itself is always available; this decides what the loop does
/// with its verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierCheck {
    /// Skip the check entirely.
    Off,
    /// Unknown identifiers fail the turn immediately.
    FailFast,
    /// Unknown identifiers get one repair re-prompt; if the repaired query
    /// still fails either check, the turn fails.
    RepairOnce,
}

/// Immutable per-session configuration, constructed once and passed to the
/// agent. There is no process-global settings object.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base table name.
    pub table_name: String,
    /// Queryable view name the model is steered toward.
    pub view_name: String,
    /// Row cap appended to statements that carry no LIMIT of their own.
    pub max_rows: usize,
    /// Total execution attempts per turn (first try + repairs). The bound is
    /// part of the contract, not an incidental loop condition.
    pub max_execution_attempts: usize,
    pub identifier_check: IdentifierCheck,
    /// Sampling temperature for generation and repair calls.
    pub temperature: f32,
    /// Columns to show in the prompt schema text; empty means all.
    pub prompt_columns: Vec<String>,
    /// Domain-specific metric definitions appended to the system prompt.
    pub domain_notes: Vec<String>,
}

impl AgentConfig {
    pub fn new(table_name: impl Into<String>) -> Self {
        let table_name = table_name.into();
        let view_name = format!("{table_name}_v");
        Self {
            table_name,
            view_name,
            max_rows: 200,
            max_execution_attempts: 3,
            identifier_check: IdentifierCheck::RepairOnce,
            temperature: 0.1,
            prompt_columns: Vec::new(),
            domain_notes: Vec::new(),
        }
    }

    pub fn with_max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = max_rows;
        self
    }

    pub fn with_identifier_check(mut self, check: IdentifierCheck) -> Self {
        self.identifier_check = check;
        self
    }

    pub fn with_domain_notes(mut self, notes: Vec<String>) -> Self {
        self.domain_notes = notes;
        self
    }
}

//! The synthesis-repair loop.
//!
//! One turn is a bounded state machine:
//!
//! ```text
//! Generate → Parse → SafetyCheck → [IdentifierCheck] → Execute → Success
//!                                        │                 │
//!                                        └→ repair once    └→ Repair → SafetyCheck → Execute …
//! ```
//!
//! Parse and safety failures are terminal without repair (malformed output is
//! not an execution failure; repairing unsafe SQL is itself untrusted). The
//! execute↔repair cycle runs at most `max_execution_attempts` executions in
//! total, then surfaces the last engine error verbatim. Every terminal
//! failure returns the caller's state unchanged.

use std::collections::BTreeSet;

use tabletalk_llm::{ChatClient, LlmError, Message};
use tabletalk_schema::TableSchema;

use crate::engine::{EngineError, QueryEngine, Table};
use crate::guard::{ensure_limit, unsafe_reason};
use crate::identifiers::find_unknown;
use crate::proposal::{parse_proposal, ProposalError, QueryProposal};
use crate::prompts;
use crate::state::{resolve_top_entity_phrase, ConversationState, FilterLexicon};
use crate::{AgentConfig, IdentifierCheck};

/// Everything the external formatter needs from a successful turn.
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerPayload {
    pub plan: Vec<String>,
    pub sql: String,
    pub table: Table,
    pub interpretation: String,
    pub assumptions: Vec<String>,
    pub followups: Vec<String>,
}

/// Why a turn ended without a result.
#[derive(Debug, thiserror::Error)]
pub enum TurnError {
    #[error("model produced no usable SQL")]
    EmptyOrMissingQuery,
    #[error("unsafe statement: {0}")]
    UnsafeStatement(String),
    #[error("unknown identifiers: {0:?}")]
    UnknownIdentifiers(BTreeSet<String>),
    #[error("execution failed after {attempts} attempts: {last_error}")]
    Execution { last_error: String, attempts: usize },
    #[error("malformed model response: {0}")]
    MalformedResponse(String),
    #[error(transparent)]
    Transport(#[from] LlmError),
}

impl TurnError {
    /// Short user-visible failure text for this turn.
    pub fn user_message(&self) -> String {
        match self {
            TurnError::EmptyOrMissingQuery => {
                "I couldn't generate SQL for that. Try rephrasing your question with a specific metric or dimension.".to_string()
            }
            TurnError::UnsafeStatement(_) => {
                "I generated unsafe SQL (non-SELECT). Please rephrase your request as a read-only analytics question.".to_string()
            }
            TurnError::UnknownIdentifiers(names) => {
                let names = names.iter().cloned().collect::<Vec<_>>().join(", ");
                format!("I couldn't generate valid SQL. Unknown identifiers still present: {names}")
            }
            TurnError::Execution { last_error, .. } => {
                format!("I couldn't run the query due to an error: {last_error}")
            }
            TurnError::MalformedResponse(_) => {
                "The model's answer could not be decoded. Please try again.".to_string()
            }
            TurnError::Transport(e) => format!("The language model call failed: {e}"),
        }
    }
}

/// Outcome of one turn.
#[derive(Debug)]
pub enum TurnReply {
    Answer(AnswerPayload),
    Failure(TurnError),
}

/// The conversational analytics agent.
///
/// Holds the chat transport, the query engine, and the session-constant
/// pieces derived from the schema (system prompt, identifier allow-list).
/// Per-turn memory lives in the caller-owned [`ConversationState`].
pub struct Agent {
    chat: Box<dyn ChatClient>,
    engine: Box<dyn QueryEngine>,
    config: AgentConfig,
    lexicon: FilterLexicon,
    system_prompt: String,
    known_identifiers: BTreeSet<String>,
}

impl Agent {
    pub fn new(
        chat: Box<dyn ChatClient>,
        engine: Box<dyn QueryEngine>,
        schema: &TableSchema,
        config: AgentConfig,
    ) -> Self {
        let schema_text = if config.prompt_columns.is_empty() {
            schema.to_prompt_text()
        } else {
            let important: Vec<&str> = config.prompt_columns.iter().map(String::as_str).collect();
            schema.to_compact_prompt_text(&important)
        };
        let system_prompt = prompts::system_prompt(
            &schema_text,
            &config.view_name,
            config.max_rows,
            &config.domain_notes,
        );

        let mut known_identifiers: BTreeSet<String> = schema
            .column_names()
            .into_iter()
            .map(|c| c.to_lowercase())
            .collect();
        known_identifiers.insert(config.table_name.to_lowercase());
        known_identifiers.insert(config.view_name.to_lowercase());

        Self {
            chat,
            engine,
            config,
            lexicon: FilterLexicon::default(),
            system_prompt,
            known_identifiers,
        }
    }

    /// Swap the filter/entity vocabulary.
    pub fn with_lexicon(mut self, lexicon: FilterLexicon) -> Self {
        self.lexicon = lexicon;
        self
    }

    /// Extend the identifier allow-list, e.g. with live engine-reported
    /// columns that the schema file does not mention.
    pub fn with_extra_identifiers<I>(mut self, identifiers: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.known_identifiers
            .extend(identifiers.into_iter().map(|s| s.to_lowercase()));
        self
    }

    /// Run one turn. Always returns a state: the successor state on success,
    /// the input state unchanged on any failure.
    pub fn answer(&self, question: &str, state: &ConversationState) -> (TurnReply, ConversationState) {
        match self.try_answer(question, state) {
            Ok((payload, new_state)) => (TurnReply::Answer(payload), new_state),
            Err(err) => {
                tracing::debug!(%err, "turn failed");
                (TurnReply::Failure(err), state.clone())
            }
        }
    }

    fn try_answer(
        &self,
        question: &str,
        state: &ConversationState,
    ) -> Result<(AnswerPayload, ConversationState), TurnError> {
        // Anaphora resolution happens before the prompt is built.
        let resolved = resolve_top_entity_phrase(question, state.top_entity.as_deref());

        let messages = vec![
            Message::system(self.system_prompt.as_str()),
            Message::user(prompts::context_user_message(state, &resolved)),
        ];
        let text = self.chat.chat(&messages, self.config.temperature)?;

        let mut proposal = match parse_proposal(&text) {
            Ok(p) => p,
            Err(ProposalError::MissingSql) => return Err(TurnError::EmptyOrMissingQuery),
            Err(ProposalError::Malformed(e)) => return Err(TurnError::MalformedResponse(e)),
        };

        proposal.sql = ensure_limit(&proposal.sql, self.config.max_rows);
        if let Some(reason) = unsafe_reason(&proposal.sql) {
            return Err(TurnError::UnsafeStatement(reason));
        }

        if self.config.identifier_check != IdentifierCheck::Off {
            let unknown = find_unknown(&proposal.sql, &self.known_identifiers);
            if !unknown.is_empty() {
                if self.config.identifier_check == IdentifierCheck::FailFast {
                    return Err(TurnError::UnknownIdentifiers(unknown));
                }
                let listed = unknown.iter().cloned().collect::<Vec<_>>().join(", ");
                let error = format!(
                    "SQL referenced unknown identifiers/columns: {listed}. Regenerate using only the provided schema."
                );
                self.refine(&resolved, &mut proposal, &error)?;
                let still_unknown = find_unknown(&proposal.sql, &self.known_identifiers);
                if !still_unknown.is_empty() {
                    return Err(TurnError::UnknownIdentifiers(still_unknown));
                }
            }
        }

        let attempts = self.config.max_execution_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.engine.execute(&proposal.sql) {
                Ok(table) => {
                    let new_state =
                        state.after_success(question, &proposal.sql, &table, &self.lexicon);
                    let payload = AnswerPayload {
                        plan: proposal.plan,
                        sql: proposal.sql,
                        table,
                        interpretation: proposal.interpretation,
                        assumptions: proposal.assumptions,
                        followups: proposal.followups,
                    };
                    return Ok((payload, new_state));
                }
                Err(EngineError(message)) => {
                    tracing::warn!(attempt, error = %message, "query execution failed");
                    last_error = message;
                    // No repair after the final attempt: the bound is on
                    // executions, and exhaustion reports the last error.
                    if attempt < attempts {
                        self.refine(&resolved, &mut proposal, &last_error)?;
                    }
                }
            }
        }

        Err(TurnError::Execution {
            last_error,
            attempts,
        })
    }

    /// One repair re-prompt: previous SQL + raw error in, corrected proposal
    /// out, with the row cap and safety check re-applied. A repair that drops
    /// `sql` falls back to the previous SQL.
    fn refine(
        &self,
        question: &str,
        proposal: &mut QueryProposal,
        error: &str,
    ) -> Result<(), TurnError> {
        tracing::debug!(error, "repair re-prompt");
        let messages = vec![
            Message::system(self.system_prompt.as_str()),
            Message::user(prompts::REFINE_PROMPT),
            Message::user(prompts::refine_user_message(question, &proposal.sql, error)),
        ];
        let text = self.chat.chat(&messages, self.config.temperature)?;

        match parse_proposal(&text) {
            Ok(refined) => merge_refined(proposal, refined),
            Err(ProposalError::MissingSql) => {}
            Err(ProposalError::Malformed(e)) => return Err(TurnError::MalformedResponse(e)),
        }

        proposal.sql = ensure_limit(&proposal.sql, self.config.max_rows);
        if let Some(reason) = unsafe_reason(&proposal.sql) {
            return Err(TurnError::UnsafeStatement(reason));
        }
        Ok(())
    }
}

/// Fold a repair proposal into the current one; fields the repair omitted
/// keep their previous values.
fn merge_refined(current: &mut QueryProposal, refined: QueryProposal) {
    if !refined.sql.trim().is_empty() {
        current.sql = refined.sql;
    }
    if !refined.plan.is_empty() {
        current.plan = refined.plan;
    }
    if !refined.interpretation.is_empty() {
        current.interpretation = refined.interpretation;
    }
    if !refined.assumptions.is_empty() {
        current.assumptions = refined.assumptions;
    }
    if !refined.followups.is_empty() {
        current.followups = refined.followups;
    }
}

//! Integration tests for the complete tabletalk pipeline
//!
//! These tests verify end-to-end turn behavior across crates:
//! - Schema file → allow-list → Agent
//! - Question + state → prompt → proposal → guards → engine → answer + state
//! - Repair cycle bounds and failure/state invariants
//!
//! Run with: cargo test --test integration_tests

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde_json::json;
use tabletalk_agent::{
    Agent, AgentConfig, ConversationState, EngineError, IdentifierCheck, QueryEngine, Table,
    TurnError, TurnReply,
};
use tabletalk_llm::{ChatClient, LlmError, Message, Role};
use tabletalk_schema::{parse_schema, ColumnInfo, TableSchema};

// ============================================================================
// Test doubles that record what the agent actually sent
// ============================================================================

#[derive(Clone)]
struct RecordingChat {
    responses: Arc<Mutex<VecDeque<String>>>,
    calls: Arc<Mutex<Vec<Vec<Message>>>>,
}

impl RecordingChat {
    fn new(responses: Vec<String>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into_iter().collect())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().unwrap().clone()
    }
}

impl ChatClient for RecordingChat {
    fn chat(&self, messages: &[Message], _temperature: f32) -> Result<String, LlmError> {
        self.calls.lock().unwrap().push(messages.to_vec());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::Api("no scripted responses left".to_string()))
    }
}

#[derive(Clone)]
struct RecordingEngine {
    outcomes: Arc<Mutex<VecDeque<Result<Table, EngineError>>>>,
    executed: Arc<Mutex<Vec<String>>>,
}

impl RecordingEngine {
    fn new(outcomes: Vec<Result<Table, EngineError>>) -> Self {
        Self {
            outcomes: Arc::new(Mutex::new(outcomes.into_iter().collect())),
            executed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

impl QueryEngine for RecordingEngine {
    fn execute(&self, sql: &str) -> Result<Table, EngineError> {
        self.executed.lock().unwrap().push(sql.to_string());
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(EngineError("no scripted outcomes left".to_string())))
    }
}

// ============================================================================
// Fixtures
// ============================================================================

fn schema() -> TableSchema {
    TableSchema {
        table_name: "daily_summary".to_string(),
        columns: vec![
            ColumnInfo::new("date_parsed", "date"),
            ColumnInfo::new("city", "varchar"),
            ColumnInfo::new("platform", "varchar"),
            ColumnInfo::new("d0_orders", "bigint"),
            ColumnInfo::new("d0_form_filled", "bigint"),
        ],
    }
}

fn proposal(sql: &str) -> String {
    json!({
        "analysis_plan": ["filter the window", "rank cities"],
        "sql": sql,
        "result_interpretation": "the leader",
        "assumptions": ["dates parse cleanly"],
        "followups": ["compare platforms?"],
    })
    .to_string()
}

fn city_row(city: &str) -> Table {
    Table {
        columns: vec!["city".to_string(), "orders".to_string()],
        rows: vec![vec![json!(city), json!(321)]],
    }
}

fn multi_city() -> Table {
    Table {
        columns: vec!["city".to_string()],
        rows: vec![vec![json!("Mumbai")], vec![json!("Pune")]],
    }
}

fn user_content(call: &[Message]) -> String {
    call.iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.content.clone())
        .collect::<Vec<_>>()
        .join("\n")
}

fn agent_with(chat: &RecordingChat, engine: &RecordingEngine, config: AgentConfig) -> Agent {
    Agent::new(Box::new(chat.clone()), Box::new(engine.clone()), &schema(), config)
}

// ============================================================================
// Turn flow
// ============================================================================

#[test]
fn full_turn_success_updates_state_and_memory() {
    let chat = RecordingChat::new(vec![proposal(
        "SELECT city FROM daily_summary_v ORDER BY d0_orders DESC LIMIT 1",
    )]);
    let engine = RecordingEngine::new(vec![Ok(city_row("Mumbai"))]);
    let agent = agent_with(&chat, &engine, AgentConfig::new("daily_summary"));

    let state = ConversationState::default();
    let (reply, new_state) = agent.answer("Which city has the highest d0 orders?", &state);

    let TurnReply::Answer(payload) = reply else {
        panic!("expected an answer");
    };
    assert_eq!(payload.plan, vec!["filter the window", "rank cities"]);
    assert_eq!(payload.interpretation, "the leader");
    assert_eq!(payload.table.row_count(), 1);

    assert_eq!(new_state.top_entity.as_deref(), Some("Mumbai"));
    assert_eq!(
        new_state.last_question.as_deref(),
        Some("Which city has the highest d0 orders?")
    );
    assert!(new_state.last_sql.as_deref().unwrap().contains("ORDER BY"));
}

#[test]
fn limit_is_enforced_on_the_executed_sql() {
    let chat = RecordingChat::new(vec![proposal("SELECT city FROM daily_summary_v")]);
    let engine = RecordingEngine::new(vec![Ok(multi_city())]);
    let agent = agent_with(&chat, &engine, AgentConfig::new("daily_summary"));

    let (reply, _) = agent.answer("all cities", &ConversationState::default());
    assert!(matches!(reply, TurnReply::Answer(_)));
    let executed = engine.executed();
    assert_eq!(executed.len(), 1);
    assert!(executed[0].ends_with("LIMIT 200"));
}

#[test]
fn anaphora_resolution_rewrites_the_prompted_question() {
    let chat = RecordingChat::new(vec![proposal(
        "SELECT platform, SUM(d0_orders) FROM daily_summary_v WHERE city = 'Mumbai' GROUP BY platform LIMIT 10",
    )]);
    let engine = RecordingEngine::new(vec![Ok(multi_city())]);
    let agent = agent_with(&chat, &engine, AgentConfig::new("daily_summary"));

    let state = ConversationState {
        top_entity: Some("Mumbai".to_string()),
        ..Default::default()
    };
    let (reply, new_state) = agent.answer("how about that top city on web?", &state);
    assert!(matches!(reply, TurnReply::Answer(_)));

    let calls = chat.calls();
    assert_eq!(calls.len(), 1);
    let prompt = user_content(&calls[0]);
    assert!(prompt.contains("how about Mumbai on web?"));
    assert!(!prompt.contains("top city"));

    // The platform mention becomes an accumulated filter.
    assert_eq!(
        new_state.last_filters.get("platform").map(String::as_str),
        Some("web")
    );
    // The original (unsubstituted) question is what memory records.
    assert_eq!(
        new_state.last_question.as_deref(),
        Some("how about that top city on web?")
    );
}

#[test]
fn repair_prompt_carries_previous_sql_and_raw_error() {
    let chat = RecordingChat::new(vec![
        proposal("SELECT city FROM daily_summary_v LIMIT 3"),
        proposal("SELECT city FROM daily_summary_v LIMIT 4"),
    ]);
    let engine = RecordingEngine::new(vec![
        Err(EngineError(
            "Catalog Error: table with name x does not exist".to_string(),
        )),
        Ok(multi_city()),
    ]);
    let agent = agent_with(&chat, &engine, AgentConfig::new("daily_summary"));

    let (reply, _) = agent.answer("cities?", &ConversationState::default());
    assert!(matches!(reply, TurnReply::Answer(_)));

    let calls = chat.calls();
    assert_eq!(calls.len(), 2);
    let repair = user_content(&calls[1]);
    assert!(repair.contains("SELECT city FROM daily_summary_v LIMIT 3"));
    assert!(repair.contains("Catalog Error: table with name x does not exist"));
}

#[test]
fn persistent_failure_stops_at_three_executions() {
    let fail = || Err(EngineError("Parser Error: unexpected token".to_string()));
    let chat = RecordingChat::new(vec![
        proposal("SELECT city FROM daily_summary_v LIMIT 1"),
        proposal("SELECT city FROM daily_summary_v LIMIT 2"),
        proposal("SELECT city FROM daily_summary_v LIMIT 3"),
    ]);
    let engine = RecordingEngine::new(vec![fail(), fail(), fail()]);
    let agent = agent_with(&chat, &engine, AgentConfig::new("daily_summary"));

    let before = ConversationState {
        last_question: Some("earlier".to_string()),
        top_entity: Some("Pune".to_string()),
        ..Default::default()
    };
    let (reply, after) = agent.answer("cities?", &before);

    let TurnReply::Failure(err) = reply else {
        panic!("expected failure");
    };
    // The user-visible message carries the last raised error verbatim.
    assert!(err.user_message().contains("Parser Error: unexpected token"));
    assert!(matches!(err, TurnError::Execution { attempts: 3, .. }));
    assert_eq!(engine.executed().len(), 3);
    // Exactly two repairs happened around the three executions.
    assert_eq!(chat.calls().len(), 3);
    // A failed turn never corrupts memory.
    assert_eq!(after, before);
}

#[test]
fn unsafe_and_malformed_turns_leave_state_equal_to_input() {
    let before = ConversationState {
        last_question: Some("q0".to_string()),
        top_entity: Some("Delhi".to_string()),
        ..Default::default()
    };

    let chat = RecordingChat::new(vec![proposal("DELETE FROM daily_summary")]);
    let engine = RecordingEngine::new(vec![]);
    let agent = agent_with(&chat, &engine, AgentConfig::new("daily_summary"));
    let (reply, after) = agent.answer("wipe it", &before);
    assert!(matches!(reply, TurnReply::Failure(TurnError::UnsafeStatement(_))));
    assert_eq!(after, before);
    // The unsafe query never reached the engine.
    assert!(engine.executed().is_empty());

    let chat = RecordingChat::new(vec!["```\nnot json\n".to_string()]);
    let engine = RecordingEngine::new(vec![]);
    let agent = agent_with(&chat, &engine, AgentConfig::new("daily_summary"));
    let (reply, after) = agent.answer("anything", &before);
    assert!(matches!(reply, TurnReply::Failure(TurnError::MalformedResponse(_))));
    assert_eq!(after, before);
}

#[test]
fn hallucinated_identifier_repairs_once_then_fails() {
    // First proposal references a made-up column; the repair still does.
    let chat = RecordingChat::new(vec![
        proposal("SELECT conversion_pct FROM daily_summary_v"),
        proposal("SELECT conversion_ratio FROM daily_summary_v"),
    ]);
    let engine = RecordingEngine::new(vec![Ok(multi_city())]);
    let agent = agent_with(&chat, &engine, AgentConfig::new("daily_summary"));

    let (reply, _) = agent.answer("conversion?", &ConversationState::default());
    let TurnReply::Failure(TurnError::UnknownIdentifiers(names)) = reply else {
        panic!("expected unknown-identifier failure");
    };
    assert!(names.contains("conversion_ratio"));
    // The repair prompt named the offending identifier.
    let calls = chat.calls();
    assert_eq!(calls.len(), 2);
    assert!(user_content(&calls[1]).contains("conversion_pct"));
    // Nothing was ever executed.
    assert!(engine.executed().is_empty());
}

#[test]
fn identifier_check_off_lets_engine_decide() {
    let chat = RecordingChat::new(vec![proposal(
        "SELECT conversion_pct FROM daily_summary_v LIMIT 5",
    )]);
    let engine = RecordingEngine::new(vec![Ok(multi_city())]);
    let agent = agent_with(
        &chat,
        &engine,
        AgentConfig::new("daily_summary").with_identifier_check(IdentifierCheck::Off),
    );
    let (reply, _) = agent.answer("conversion?", &ConversationState::default());
    assert!(matches!(reply, TurnReply::Answer(_)));
}

// ============================================================================
// Multi-turn conversation
// ============================================================================

#[test]
fn two_turn_conversation_accumulates_filters_and_memory() {
    let chat = RecordingChat::new(vec![
        proposal("SELECT city FROM daily_summary_v ORDER BY d0_orders DESC LIMIT 1"),
        proposal("SELECT platform FROM daily_summary_v WHERE city = 'Mumbai' LIMIT 10"),
    ]);
    let engine = RecordingEngine::new(vec![Ok(city_row("Mumbai")), Ok(multi_city())]);
    let agent = agent_with(&chat, &engine, AgentConfig::new("daily_summary"));

    let s0 = ConversationState::default();
    let (r1, s1) = agent.answer("Which city has the highest d0 orders in Mumbai?", &s0);
    assert!(matches!(r1, TurnReply::Answer(_)));
    assert_eq!(s1.top_entity.as_deref(), Some("Mumbai"));
    assert_eq!(s1.last_filters.get("city").map(String::as_str), Some("Mumbai"));

    let (r2, s2) = agent.answer("split that by platform on app", &s1);
    assert!(matches!(r2, TurnReply::Answer(_)));
    // Filters are monotonically additive: the city survives, platform joins.
    assert_eq!(s2.last_filters.get("city").map(String::as_str), Some("Mumbai"));
    assert_eq!(s2.last_filters.get("platform").map(String::as_str), Some("app"));
    // Multi-row turn leaves the remembered entity alone.
    assert_eq!(s2.top_entity.as_deref(), Some("Mumbai"));
}

// ============================================================================
// Schema file → agent pipeline
// ============================================================================

#[test]
fn schema_file_drives_the_identifier_allow_list() {
    let raw = r#"{"fields": [
        {"name": "city", "type": "varchar"},
        {"name": "revenue", "type": "double"}
    ]}"#;
    let table_schema = parse_schema(raw, "sales").unwrap();

    let chat = RecordingChat::new(vec![proposal(
        "SELECT city, SUM(revenue) AS total FROM sales_v GROUP BY city LIMIT 20",
    )]);
    let engine = RecordingEngine::new(vec![Ok(multi_city())]);
    let agent = Agent::new(
        Box::new(chat.clone()),
        Box::new(engine.clone()),
        &table_schema,
        AgentConfig::new("sales"),
    );
    let (reply, _) = agent.answer("revenue by city", &ConversationState::default());
    assert!(matches!(reply, TurnReply::Answer(_)));
}

//! Tabletalk CLI
//!
//! Conversational analytics over one fixed table:
//! - `chat` — interactive shell with conversational memory
//! - `ask` — one-shot question
//! - `schema` — print the parsed schema the way the model will see it
//! - `check` — run the read-only/identifier guards over a SQL statement
//!
//! The query engine is attached as an external command speaking
//! `tabletalk_engine_v1` JSON on stdin/stdout (see `engine_cmd`), so the
//! binary itself never links a database.

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::collections::BTreeSet;
use std::io::Read;
use std::path::PathBuf;

mod chat;
mod engine_cmd;
mod format;

use engine_cmd::CommandEngine;
use tabletalk_agent::{
    validate, Agent, AgentConfig, ConversationState, IdentifierCheck, TurnReply, ValidationOutcome,
};
use tabletalk_llm::backends;
use tabletalk_llm::{ChatClient, LlmError, Message};
use tabletalk_schema::read_schema;

#[derive(Parser)]
#[command(name = "tabletalk")]
#[command(author, version, about = "Ask natural-language analytics questions over a fixed table")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat with conversational memory (`reset` clears it).
    Chat {
        #[command(flatten)]
        session: SessionArgs,
    },

    /// Ask one question and print the answer.
    Ask {
        /// The question, e.g. "Which city has the highest D0 conversion rate last 15 days?"
        question: String,
        #[command(flatten)]
        session: SessionArgs,
    },

    /// Parse a schema file and print the prompt text built from it.
    Schema {
        /// Schema file (JSON `fields`/`columns` or `name: type` lines).
        #[arg(long)]
        schema: PathBuf,
        /// Base table name.
        #[arg(long, default_value = "daily_summary")]
        table: String,
    },

    /// Run the read-only and identifier guards over a statement.
    ///
    /// Reads the statement from the argument, or from stdin when omitted.
    /// Exits non-zero when the statement is rejected.
    Check {
        sql: Option<String>,
        /// Schema file used to build the identifier allow-list.
        #[arg(long)]
        schema: PathBuf,
        /// Base table name.
        #[arg(long, default_value = "daily_summary")]
        table: String,
        /// Identifier strictness.
        #[arg(long, value_enum, default_value = "repair-once")]
        identifier_check: IdentifierCheckArg,
    },
}

#[derive(Args)]
struct SessionArgs {
    /// Schema file (JSON `fields`/`columns` or `name: type` lines).
    #[arg(long)]
    schema: PathBuf,

    /// Base table name; the queryable view is `<table>_v`.
    #[arg(long, default_value = "daily_summary")]
    table: String,

    /// Row cap appended to statements that carry no LIMIT.
    #[arg(long, default_value_t = 200)]
    max_rows: usize,

    /// Chat backend.
    #[cfg_attr(feature = "llm-ollama", arg(long, value_enum, default_value = "ollama"))]
    #[cfg_attr(not(feature = "llm-ollama"), arg(long, value_enum, default_value = "mock"))]
    llm: LlmKind,

    /// Model name (falls back to the backend's env var / default).
    #[arg(long)]
    model: Option<String>,

    /// External query-engine command (speaks tabletalk_engine_v1 JSON).
    #[arg(long)]
    engine_cmd: PathBuf,

    /// Extra argument passed to the engine command (repeatable).
    #[arg(long = "engine-arg")]
    engine_args: Vec<String>,

    /// Identifier strictness.
    #[arg(long, value_enum, default_value = "repair-once")]
    identifier_check: IdentifierCheckArg,

    /// Restrict the prompt schema text to these columns (repeatable).
    #[arg(long = "prompt-column")]
    prompt_columns: Vec<String>,

    /// Replace the built-in funnel metric notes in the system prompt
    /// (repeatable; pass a single empty string to disable them).
    #[arg(long = "metric-note")]
    metric_notes: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LlmKind {
    /// Deterministic offline template backend (no model server needed).
    Mock,
    #[cfg(feature = "llm-ollama")]
    Ollama,
    #[cfg(feature = "llm-openai")]
    Openai,
    #[cfg(feature = "llm-anthropic")]
    Anthropic,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum IdentifierCheckArg {
    Off,
    FailFast,
    RepairOnce,
}

impl From<IdentifierCheckArg> for IdentifierCheck {
    fn from(arg: IdentifierCheckArg) -> Self {
        match arg {
            IdentifierCheckArg::Off => IdentifierCheck::Off,
            IdentifierCheckArg::FailFast => IdentifierCheck::FailFast,
            IdentifierCheckArg::RepairOnce => IdentifierCheck::RepairOnce,
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = run() {
        eprintln!("{} {e:#}", "error:".red().bold());
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Chat { session } => {
            let agent = build_agent(&session)?;
            chat::cmd_chat(agent)
        }
        Commands::Ask { question, session } => {
            let agent = build_agent(&session)?;
            let (reply, _state) = agent.answer(&question, &ConversationState::default());
            match reply {
                TurnReply::Answer(payload) => println!("{}", format::render_answer(&question, &payload)),
                TurnReply::Failure(err) => println!("{}", err.user_message()),
            }
            Ok(())
        }
        Commands::Schema { schema, table } => {
            let schema = read_schema(&schema, &table)?;
            println!("{}", schema.to_prompt_text());
            Ok(())
        }
        Commands::Check {
            sql,
            schema,
            table,
            identifier_check,
        } => cmd_check(sql, &schema, &table, identifier_check.into()),
    }
}

fn cmd_check(
    sql: Option<String>,
    schema_path: &PathBuf,
    table: &str,
    check: IdentifierCheck,
) -> Result<()> {
    let sql = match sql {
        Some(sql) => sql,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    let sql = sql.trim();
    if sql.is_empty() {
        return Err(anyhow!("no SQL given (pass it as an argument or on stdin)"));
    }

    let schema = read_schema(schema_path, table)?;
    let mut known: BTreeSet<String> = schema
        .column_names()
        .into_iter()
        .map(|c| c.to_lowercase())
        .collect();
    known.insert(table.to_lowercase());
    known.insert(format!("{}_v", table.to_lowercase()));

    match validate(sql, &known, check) {
        ValidationOutcome::Safe => {
            println!("{} single read-only statement, identifiers known", "ok:".green().bold());
            Ok(())
        }
        ValidationOutcome::UnsafeStatement(reason) => {
            println!("{} {reason}", "unsafe:".red().bold());
            Err(anyhow!("statement rejected"))
        }
        ValidationOutcome::UnknownIdentifiers(names) => {
            let names = names.into_iter().collect::<Vec<_>>().join(", ");
            println!("{} {names}", "unknown identifiers:".red().bold());
            Err(anyhow!("statement rejected"))
        }
    }
}

fn build_agent(session: &SessionArgs) -> Result<Agent> {
    let schema = read_schema(&session.schema, &session.table)?;

    let metric_notes = if session.metric_notes.is_empty() {
        default_metric_notes()
    } else {
        session
            .metric_notes
            .iter()
            .filter(|n| !n.trim().is_empty())
            .cloned()
            .collect()
    };

    let mut config = AgentConfig::new(session.table.as_str())
        .with_max_rows(session.max_rows)
        .with_identifier_check(session.identifier_check.into())
        .with_domain_notes(metric_notes);
    config.prompt_columns = session.prompt_columns.clone();

    let chat_client = build_chat_client(session, &config)?;
    let engine = CommandEngine::new(session.engine_cmd.clone(), session.engine_args.clone());

    Ok(Agent::new(chat_client, Box::new(engine), &schema, config))
}

fn build_chat_client(session: &SessionArgs, config: &AgentConfig) -> Result<Box<dyn ChatClient>> {
    match session.llm {
        LlmKind::Mock => Ok(Box::new(TemplateProposer {
            view: config.view_name.clone(),
            max_rows: config.max_rows,
        })),
        #[cfg(feature = "llm-ollama")]
        LlmKind::Ollama => {
            let model = session
                .model
                .clone()
                .unwrap_or_else(backends::default_ollama_model);
            Ok(Box::new(backends::OllamaChat::new(
                backends::default_ollama_host(),
                model,
                backends::llm_timeout()?,
            )))
        }
        #[cfg(feature = "llm-openai")]
        LlmKind::Openai => Ok(Box::new(backends::OpenAiChat::from_env(
            session.model.as_deref(),
        )?)),
        #[cfg(feature = "llm-anthropic")]
        LlmKind::Anthropic => Ok(Box::new(backends::AnthropicChat::from_env(
            session.model.as_deref(),
        )?)),
    }
}

/// Deterministic offline backend: proposes a bare sample query over the view
/// regardless of the question. Lets the plumbing (engine command, guards,
/// formatting) be exercised without a model server.
struct TemplateProposer {
    view: String,
    max_rows: usize,
}

impl ChatClient for TemplateProposer {
    fn chat(&self, _messages: &[Message], _temperature: f32) -> Result<String, LlmError> {
        Ok(serde_json::json!({
            "analysis_plan": ["select a sample of rows from the view"],
            "sql": format!("SELECT * FROM {} LIMIT {}", self.view, self.max_rows.min(20)),
            "result_interpretation": "A raw sample of the table.",
            "assumptions": ["offline template backend; the question text is not interpreted"],
            "followups": ["switch to a real backend with --llm ollama"],
        })
        .to_string())
    }
}

/// Funnel metric definitions shipped as defaults for the demo dataset;
/// swap with `--metric-note`.
fn default_metric_notes() -> Vec<String> {
    [
        "D0 Conversion Rate = SUM(d0_orders) / NULLIF(SUM(d0_form_filled), 0)",
        "Dplus Conversion Rate = SUM(dplus_orders) / NULLIF(SUM(dplus_form_filled), 0)",
        "Form Completion Rate = SUM(total_form_filled) / NULLIF(SUM(total_form_start), 0)",
    ]
    .into_iter()
    .map(|s| s.to_string())
    .collect()
}

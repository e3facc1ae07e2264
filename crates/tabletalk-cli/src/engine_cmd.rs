//! External query-engine command plugin.
//!
//! The core never links a database; instead any engine (DuckDB, SQLite, a
//! warehouse proxy) can be attached by a small wrapper program that speaks
//! `tabletalk_engine_v1` over stdin/stdout:
//!
//! - request (stdin):  `{"protocol": "tabletalk_engine_v1", "sql": "..."}`
//! - response (stdout): `{"columns": [..], "rows": [[..], ..]}` on success,
//!   `{"error": "human-readable message"}` on failure.
//!
//! One process is spawned per query, so nothing is shared between turns or
//! sessions. Every call is bounded by `TABLETALK_ENGINE_TIMEOUT_SECS`
//! (default 60).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

use tabletalk_agent::{EngineError, QueryEngine, Table};

pub const ENGINE_PROTOCOL_V1: &str = "tabletalk_engine_v1";
pub const TABLETALK_ENGINE_TIMEOUT_SECS_ENV: &str = "TABLETALK_ENGINE_TIMEOUT_SECS";
const DEFAULT_ENGINE_TIMEOUT_SECS: u64 = 60;

#[derive(Serialize)]
struct EngineRequestV1<'a> {
    protocol: &'static str,
    sql: &'a str,
}

#[derive(Deserialize)]
struct EngineResponseV1 {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    columns: Option<Vec<String>>,
    #[serde(default)]
    rows: Option<Vec<Vec<serde_json::Value>>>,
}

fn engine_timeout() -> Duration {
    let secs = std::env::var(TABLETALK_ENGINE_TIMEOUT_SECS_ENV)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_ENGINE_TIMEOUT_SECS);
    Duration::from_secs(secs.clamp(1, 3600))
}

/// Engine backed by an external command.
pub struct CommandEngine {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandEngine {
    pub fn new(program: PathBuf, args: Vec<String>) -> Self {
        Self { program, args }
    }

    fn run(&self, sql: &str) -> Result<EngineResponseV1, EngineError> {
        let payload = serde_json::to_vec(&EngineRequestV1 {
            protocol: ENGINE_PROTOCOL_V1,
            sql,
        })
        .map_err(|e| EngineError(format!("failed to encode engine request: {e}")))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                EngineError(format!(
                    "failed to start engine command `{}`: {e}",
                    self.program.display()
                ))
            })?;

        {
            let Some(mut stdin) = child.stdin.take() else {
                return Err(EngineError("failed to open stdin for engine command".to_string()));
            };
            use std::io::Write;
            stdin
                .write_all(&payload)
                .map_err(|e| EngineError(format!("failed to write engine request: {e}")))?;
        }

        let out = wait_with_output_timeout(child, engine_timeout(), &self.program)?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(EngineError(format!(
                "engine command `{}` failed (exit={:?}): {}",
                self.program.display(),
                out.status.code(),
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8(out.stdout).map_err(|e| {
            EngineError(format!(
                "engine command `{}` returned non-utf8 stdout: {e}",
                self.program.display()
            ))
        })?;
        let stdout = stdout.trim();
        serde_json::from_str(stdout).map_err(|e| {
            let preview = stdout.chars().take(300).collect::<String>();
            EngineError(format!(
                "engine command `{}` returned invalid JSON: {e}; stdout starts with: {preview:?}",
                self.program.display()
            ))
        })
    }
}

impl QueryEngine for CommandEngine {
    fn execute(&self, sql: &str) -> Result<Table, EngineError> {
        let response = self.run(sql)?;
        if let Some(error) = response.error {
            return Err(EngineError(error));
        }
        let columns = response
            .columns
            .ok_or_else(|| EngineError("engine response carries neither `columns` nor `error`".to_string()))?;
        let rows = response.rows.unwrap_or_default();
        Ok(Table { columns, rows })
    }
}

fn wait_with_output_timeout(
    mut child: std::process::Child,
    timeout: Duration,
    program: &PathBuf,
) -> Result<Output, EngineError> {
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(_)) => break,
            Ok(None) => {}
            Err(e) => {
                return Err(EngineError(format!(
                    "engine command `{}`: failed to poll child status: {e}",
                    program.display()
                )))
            }
        }

        if start.elapsed() > timeout {
            let _ = child.kill();
            let output = child.wait_with_output().map_err(|e| {
                EngineError(format!(
                    "engine command `{}`: failed to collect output after kill: {e}",
                    program.display()
                ))
            })?;
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError(format!(
                "engine command `{}` timed out after {}s. stderr: {}",
                program.display(),
                timeout.as_secs(),
                stderr.trim()
            )));
        }

        std::thread::sleep(Duration::from_millis(50));
    }

    child.wait_with_output().map_err(|e| {
        EngineError(format!(
            "engine command `{}`: {e}",
            program.display()
        ))
    })
}

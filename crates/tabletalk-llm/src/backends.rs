//! HTTP chat backends.
//!
//! Configuration is read from env vars (recommended path):
//! - Ollama: `OLLAMA_HOST` (default `http://127.0.0.1:11434`), `OLLAMA_MODEL`
//! - OpenAI: `OPENAI_API_KEY` (required), `OPENAI_BASE_URL`, `OPENAI_MODEL`
//! - Anthropic: `ANTHROPIC_API_KEY` (required), `ANTHROPIC_BASE_URL`,
//!   `ANTHROPIC_MODEL`, `ANTHROPIC_VERSION`
//!
//! Every request uses a bounded wall-clock timeout, resolved from
//! `TABLETALK_LLM_TIMEOUT_SECS` (default 120).

use crate::{ChatClient, LlmError, Message, Role};
use anyhow::{anyhow, Result};
use std::time::Duration;

pub const TABLETALK_LLM_TIMEOUT_SECS_ENV: &str = "TABLETALK_LLM_TIMEOUT_SECS";

pub const OLLAMA_HOST_ENV: &str = "OLLAMA_HOST";
pub const OLLAMA_MODEL_ENV: &str = "OLLAMA_MODEL";
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const OPENAI_BASE_URL_ENV: &str = "OPENAI_BASE_URL";
pub const OPENAI_MODEL_ENV: &str = "OPENAI_MODEL";
pub const ANTHROPIC_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";
pub const ANTHROPIC_BASE_URL_ENV: &str = "ANTHROPIC_BASE_URL";
pub const ANTHROPIC_MODEL_ENV: &str = "ANTHROPIC_MODEL";
pub const ANTHROPIC_VERSION_ENV: &str = "ANTHROPIC_VERSION";

const DEFAULT_LLM_TIMEOUT_SECS: u64 = 120;
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_OLLAMA_MODEL: &str = "llama3.1:8b";

/// Default Ollama host.
///
/// We prefer IPv4 loopback to avoid `localhost` resolving to ::1 (IPv6) on
/// platforms where Ollama only listens on IPv4. Override via `OLLAMA_HOST`.
pub fn default_ollama_host() -> String {
    match std::env::var(OLLAMA_HOST_ENV) {
        Ok(v) if !v.trim().is_empty() => normalize_host(v.trim()),
        _ => "http://127.0.0.1:11434".to_string(),
    }
}

pub fn default_ollama_model() -> String {
    match std::env::var(OLLAMA_MODEL_ENV) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => DEFAULT_OLLAMA_MODEL.to_string(),
    }
}

pub fn default_openai_base_url() -> String {
    match std::env::var(OPENAI_BASE_URL_ENV) {
        Ok(v) if !v.trim().is_empty() => normalize_host(v.trim()),
        _ => DEFAULT_OPENAI_BASE_URL.to_string(),
    }
}

pub fn default_anthropic_base_url() -> String {
    match std::env::var(ANTHROPIC_BASE_URL_ENV) {
        Ok(v) if !v.trim().is_empty() => normalize_host(v.trim()),
        _ => DEFAULT_ANTHROPIC_BASE_URL.to_string(),
    }
}

pub fn default_anthropic_version() -> String {
    match std::env::var(ANTHROPIC_VERSION_ENV) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => DEFAULT_ANTHROPIC_VERSION.to_string(),
    }
}

fn normalize_host(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{host}")
    }
}

/// Resolve the per-call wall-clock timeout.
///
/// Precedence: env var `TABLETALK_LLM_TIMEOUT_SECS`, then the default. The
/// value is clamped to [1, 3600]; there is no way to disable the bound.
pub fn llm_timeout() -> Result<Duration> {
    match std::env::var(TABLETALK_LLM_TIMEOUT_SECS_ENV) {
        Ok(v) => {
            let v = v.trim();
            if v.is_empty() {
                return Ok(Duration::from_secs(DEFAULT_LLM_TIMEOUT_SECS));
            }
            let n = v.parse::<u64>().map_err(|_| {
                anyhow!(
                    "invalid {TABLETALK_LLM_TIMEOUT_SECS_ENV}={v:?} (expected timeout in seconds)"
                )
            })?;
            Ok(Duration::from_secs(n.clamp(1, 3600)))
        }
        Err(std::env::VarError::NotPresent) => Ok(Duration::from_secs(DEFAULT_LLM_TIMEOUT_SECS)),
        Err(e) => Err(anyhow!("failed to read {TABLETALK_LLM_TIMEOUT_SECS_ENV}: {e}")),
    }
}

#[cfg(any(feature = "llm-ollama", feature = "llm-openai", feature = "llm-anthropic"))]
fn http_client(timeout: Duration) -> Result<reqwest::blocking::Client, LlmError> {
    reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| LlmError::Network(format!("failed to build http client: {e}")))
}

#[cfg(any(feature = "llm-ollama", feature = "llm-openai", feature = "llm-anthropic"))]
fn messages_json(messages: &[Message]) -> Vec<serde_json::Value> {
    messages
        .iter()
        .map(|m| serde_json::json!({ "role": m.role.as_str(), "content": m.content }))
        .collect()
}

// =============================================================================
// Ollama backend (native /api/chat)
// =============================================================================

/// Local Ollama server, via its native `/api/chat` endpoint.
#[cfg(feature = "llm-ollama")]
pub struct OllamaChat {
    host: String,
    model: String,
    timeout: Duration,
}

#[cfg(feature = "llm-ollama")]
impl OllamaChat {
    pub fn new(host: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            host: normalize_host(&host.into()),
            model: model.into(),
            timeout,
        }
    }

    /// Host/model from env (or their defaults), timeout from
    /// `TABLETALK_LLM_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(
            default_ollama_host(),
            default_ollama_model(),
            llm_timeout()?,
        ))
    }
}

#[cfg(feature = "llm-ollama")]
impl ChatClient for OllamaChat {
    fn chat(&self, messages: &[Message], temperature: f32) -> Result<String, LlmError> {
        let url = format!("{}/api/chat", self.host);
        tracing::debug!(model = %self.model, messages = messages.len(), "ollama chat request");
        let body = serde_json::json!({
            "model": self.model,
            "stream": false,
            "messages": messages_json(messages),
            "options": { "temperature": temperature },
        });

        let client = http_client(self.timeout)?;
        let resp = client.post(&url).json(&body).send().map_err(|e| {
            LlmError::Network(format!(
                "failed to reach ollama at {url} (is it running?) ({e}). Try: `ollama serve` or set {OLLAMA_HOST_ENV}"
            ))
        })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().unwrap_or_default();
            return Err(LlmError::Api(format!("ollama http error {status}: {text}")));
        }

        #[derive(serde::Deserialize)]
        struct OllamaChatResponse {
            message: OllamaChatMessage,
        }

        #[derive(serde::Deserialize)]
        struct OllamaChatMessage {
            content: String,
        }

        let out: OllamaChatResponse = resp
            .json()
            .map_err(|e| LlmError::InvalidResponse(format!("ollama returned invalid JSON: {e}")))?;
        Ok(out.message.content)
    }
}

// =============================================================================
// OpenAI backend (chat completions)
// =============================================================================

#[cfg(feature = "llm-openai")]
pub struct OpenAiChat {
    base_url: String,
    model: String,
    api_key: String,
    timeout: Duration,
}

#[cfg(feature = "llm-openai")]
impl OpenAiChat {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            base_url: normalize_host(&base_url.into()),
            model: model.into(),
            api_key: api_key.into(),
            timeout,
        }
    }

    pub fn from_env(model: Option<&str>) -> Result<Self> {
        let key = std::env::var(OPENAI_API_KEY_ENV).unwrap_or_default();
        let key = key.trim().to_string();
        if key.is_empty() {
            return Err(anyhow!("{OPENAI_API_KEY_ENV} is not set"));
        }
        let model = match model {
            Some(m) => m.to_string(),
            None => std::env::var(OPENAI_MODEL_ENV)
                .map_err(|_| anyhow!("no model selected (pass --model or set {OPENAI_MODEL_ENV})"))?,
        };
        Ok(Self::new(default_openai_base_url(), model, key, llm_timeout()?))
    }
}

#[cfg(feature = "llm-openai")]
impl ChatClient for OpenAiChat {
    fn chat(&self, messages: &[Message], temperature: f32) -> Result<String, LlmError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        tracing::debug!(model = %self.model, messages = messages.len(), "openai chat request");
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages_json(messages),
            "temperature": temperature,
        });

        let client = http_client(self.timeout)?;
        let resp = client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .map_err(|e| LlmError::Network(format!("openai request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().unwrap_or_default();
            return Err(LlmError::Api(format!("openai http error {status}: {text}")));
        }

        let data: serde_json::Value = resp
            .json()
            .map_err(|e| LlmError::InvalidResponse(format!("openai returned invalid JSON: {e}")))?;

        data["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                LlmError::InvalidResponse("openai response missing choices[0].message.content".to_string())
            })
    }
}

// =============================================================================
// Anthropic backend (messages API)
// =============================================================================

#[cfg(feature = "llm-anthropic")]
pub struct AnthropicChat {
    base_url: String,
    model: String,
    api_key: String,
    version: String,
    timeout: Duration,
}

#[cfg(feature = "llm-anthropic")]
impl AnthropicChat {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        version: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            base_url: normalize_host(&base_url.into()),
            model: model.into(),
            api_key: api_key.into(),
            version: version.into(),
            timeout,
        }
    }

    pub fn from_env(model: Option<&str>) -> Result<Self> {
        let key = std::env::var(ANTHROPIC_API_KEY_ENV).unwrap_or_default();
        let key = key.trim().to_string();
        if key.is_empty() {
            return Err(anyhow!("{ANTHROPIC_API_KEY_ENV} is not set"));
        }
        let model = match model {
            Some(m) => m.to_string(),
            None => std::env::var(ANTHROPIC_MODEL_ENV).map_err(|_| {
                anyhow!("no model selected (pass --model or set {ANTHROPIC_MODEL_ENV})")
            })?,
        };
        Ok(Self::new(
            default_anthropic_base_url(),
            model,
            key,
            default_anthropic_version(),
            llm_timeout()?,
        ))
    }
}

#[cfg(feature = "llm-anthropic")]
impl ChatClient for AnthropicChat {
    fn chat(&self, messages: &[Message], temperature: f32) -> Result<String, LlmError> {
        let url = format!("{}/v1/messages", self.base_url);
        tracing::debug!(model = %self.model, messages = messages.len(), "anthropic chat request");

        // The messages API takes `system` as a top-level field.
        let system = messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.clone());
        let turns: Vec<serde_json::Value> = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| serde_json::json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": turns,
            "max_tokens": 1200,
            "temperature": temperature,
        });
        if let Some(system) = system {
            body["system"] = serde_json::json!(system);
        }

        let client = http_client(self.timeout)?;
        let resp = client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.version)
            .json(&body)
            .send()
            .map_err(|e| LlmError::Network(format!("anthropic request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().unwrap_or_default();
            return Err(LlmError::Api(format!("anthropic http error {status}: {text}")));
        }

        let data: serde_json::Value = resp.json().map_err(|e| {
            LlmError::InvalidResponse(format!("anthropic returned invalid JSON: {e}"))
        })?;

        data["content"][0]["text"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| {
                LlmError::InvalidResponse("anthropic response missing content[0].text".to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_bare_hosts() {
        assert_eq!(normalize_host("127.0.0.1:11434"), "http://127.0.0.1:11434");
        assert_eq!(
            normalize_host("http://localhost:11434/"),
            "http://localhost:11434"
        );
        assert_eq!(normalize_host("https://api.example.com"), "https://api.example.com");
    }

    #[test]
    fn timeout_has_bounded_default() {
        // No env override in the test environment: the default applies.
        if std::env::var(TABLETALK_LLM_TIMEOUT_SECS_ENV).is_err() {
            let t = llm_timeout().unwrap();
            assert_eq!(t, Duration::from_secs(120));
        }
    }
}

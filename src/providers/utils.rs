use std::collections::HashSet;
use std::io::{BufRead, BufReader, Lines};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::anyhow;
use regex::Regex;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SimplemindError};
use crate::tools::Tool;

/// Upper bound on tool-call rounds within one turn.
pub const MAX_TOOL_ROUNDS: usize = 8;

pub fn build_client(timeout: Duration) -> reqwest::Result<Client> {
    Client::builder().timeout(timeout).build()
}

/// Send a request and turn any non-success status into an error carrying the
/// vendor's body.
pub fn send_request(request: RequestBuilder) -> anyhow::Result<Response> {
    let response = request.send()?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().unwrap_or_default();
    match status {
        StatusCode::TOO_MANY_REQUESTS => Err(anyhow!("Rate limited: {} - {}", status, body)),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(anyhow!("Authentication failed: {} - {}", status, body))
        }
        status if status.is_server_error() => Err(anyhow!("Server error: {} - {}", status, body)),
        _ => Err(anyhow!("Request failed: {} - {}", status, body)),
    }
}

pub fn send_json(request: RequestBuilder) -> anyhow::Result<Value> {
    let response: Value = send_request(request)?.json()?;
    if let Some(error) = response.get("error") {
        return Err(anyhow!("API error: {}", error));
    }
    Ok(response)
}

/// Collect `field` out of every element of `array` in a model-listing body.
pub fn model_names(response: &Value, array: &str, field: &str) -> Vec<String> {
    response
        .get(array)
        .and_then(Value::as_array)
        .map(|models| {
            models
                .iter()
                .filter_map(|m| m.get(field).and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Parse JSON out of a text completion, tolerating a markdown code fence.
pub fn extract_json(text: &str) -> Result<Value> {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    let fence = FENCE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json)?\s*(.*?)\s*```").expect("fence pattern is valid")
    });

    let body = fence
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(text)
        .trim();

    serde_json::from_str(body)
        .map_err(|e| SimplemindError::Validation(format!("Response is not valid JSON: {}", e)))
}

/// System prompt used by vendors that can be told to emit JSON but not which
/// shape.
pub fn schema_instruction(schema: &Value) -> String {
    format!(
        "Respond only with a JSON object that validates against this JSON schema, without any other text:\n{}",
        schema
    )
}

pub fn is_valid_function_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Vendors reject duplicate or oddly named functions, so catch that before
/// anything is sent.
pub fn check_tools(tools: &[Tool]) -> Result<()> {
    let mut tool_names = HashSet::new();
    for tool in tools {
        if !is_valid_function_name(&tool.name) {
            return Err(SimplemindError::Validation(format!(
                "Tool name '{}' must match [a-zA-Z0-9_-]+",
                tool.name
            )));
        }
        if !tool_names.insert(tool.name.as_str()) {
            return Err(SimplemindError::Validation(format!(
                "Duplicate tool name: {}",
                tool.name
            )));
        }
    }
    Ok(())
}

pub enum StreamFormat {
    /// Server-sent events: `data: {...}` lines.
    Sse,
    /// One JSON object per line.
    Ndjson,
}

pub enum StreamEvent {
    Text(String),
    Skip,
    Done,
}

/// Blocking reader over a streamed HTTP body, yielding text fragments.
pub struct LineStream {
    lines: Lines<BufReader<Response>>,
    format: StreamFormat,
    extract: fn(&Value) -> StreamEvent,
    provider: String,
    model: String,
    finished: bool,
}

impl LineStream {
    pub fn new(
        response: Response,
        format: StreamFormat,
        extract: fn(&Value) -> StreamEvent,
        provider: &str,
        model: &str,
    ) -> Self {
        Self {
            lines: BufReader::new(response).lines(),
            format,
            extract,
            provider: provider.to_string(),
            model: model.to_string(),
            finished: false,
        }
    }

    fn fail(&mut self, source: anyhow::Error) -> Option<Result<String>> {
        self.finished = true;
        Some(Err(SimplemindError::provider(
            self.provider.as_str(),
            self.model.as_str(),
            source,
        )))
    }
}

impl Iterator for LineStream {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            let line = match self.lines.next() {
                Some(Ok(line)) => line,
                Some(Err(e)) => return self.fail(e.into()),
                None => {
                    self.finished = true;
                    return None;
                }
            };

            let payload = match self.format {
                StreamFormat::Sse => match line.strip_prefix("data:") {
                    Some(data) => data.trim(),
                    None => continue,
                },
                StreamFormat::Ndjson => line.trim(),
            };
            if payload.is_empty() {
                continue;
            }
            if payload == "[DONE]" {
                self.finished = true;
                return None;
            }

            let value: Value = match serde_json::from_str(payload) {
                Ok(value) => value,
                Err(e) => return self.fail(anyhow!("Malformed stream chunk: {}", e)),
            };
            if let Some(error) = value.get("error") {
                return self.fail(anyhow!("API error: {}", error));
            }

            match (self.extract)(&value) {
                StreamEvent::Text(text) if !text.is_empty() => return Some(Ok(text)),
                StreamEvent::Text(_) | StreamEvent::Skip => continue,
                StreamEvent::Done => {
                    debug!(provider = %self.provider, "stream finished");
                    self.finished = true;
                }
            }
        }
        None
    }
}

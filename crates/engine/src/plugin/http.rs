//! Built-in HTTP capability.
//!
//! Drives one HTTP request per step. Output shape:
//! `{ status_code, headers, body, duration_ms }` with `body` parsed as JSON
//! when the response allows it. Request and response evidence is captured
//! separately for persistence.

use async_trait::async_trait;
use reqwest::Method;
use rocketship_types::{EngineError, ErrorKind};
use rocketship_util::parse_duration;
use serde_json::{Value as JsonValue, json};
use std::str::FromStr;
use std::time::{Duration, Instant};
use url::Url;

use super::{ActivityContext, Plugin, PluginOutcome, PluginParams};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpPlugin {
    client: reqwest::Client,
}

impl HttpPlugin {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for HttpPlugin {
    fn name(&self) -> &str {
        "http"
    }

    async fn execute(
        &self,
        ctx: &ActivityContext,
        params: &PluginParams,
    ) -> Result<PluginOutcome, EngineError> {
        let config = params
            .config
            .as_object()
            .ok_or_else(|| EngineError::plugin("http config must be a mapping"))?;

        let method_name = config
            .get("method")
            .and_then(JsonValue::as_str)
            .unwrap_or("GET");
        let method = Method::from_str(&method_name.to_uppercase())
            .map_err(|_| EngineError::plugin(format!("unsupported http method: {method_name}")))?;

        let raw_url = config
            .get("url")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| EngineError::plugin("http config requires a 'url' string"))?;
        let url = Url::parse(raw_url)
            .map_err(|error| EngineError::plugin(format!("invalid url '{raw_url}': {error}")))?;

        let timeout = config
            .get("timeout")
            .and_then(JsonValue::as_str)
            .and_then(parse_duration)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        let mut request = self.client.request(method.clone(), url.clone()).timeout(timeout);
        if let Some(headers) = config.get("headers").and_then(JsonValue::as_object) {
            for (name, value) in headers {
                let value = match value {
                    JsonValue::String(text) => text.clone(),
                    other => other.to_string(),
                };
                request = request.header(name, value);
            }
        }
        let body = config.get("body").cloned();
        if let Some(body) = &body {
            request = request.json(body);
        }

        let request_data = json!({
            "method": method.as_str(),
            "url": raw_url,
            "body": body,
        });

        let started = Instant::now();
        let response = tokio::select! {
            response = request.send() => response
                .map_err(|error| EngineError::plugin(format!("http request failed: {error}")))?,
            _ = ctx.cancelled() => {
                return Err(EngineError::new(ErrorKind::Cancelled, "http request cancelled"));
            }
        };

        let status_code = response.status().as_u16();
        let mut headers = serde_json::Map::new();
        for (name, value) in response.headers() {
            if let Ok(text) = value.to_str() {
                headers.insert(name.as_str().to_string(), JsonValue::String(text.to_string()));
            }
        }

        let raw_body = tokio::select! {
            body = response.text() => body
                .map_err(|error| EngineError::plugin(format!("http body read failed: {error}")))?,
            _ = ctx.cancelled() => {
                return Err(EngineError::new(ErrorKind::Cancelled, "http request cancelled"));
            }
        };
        let parsed_body: JsonValue =
            serde_json::from_str(&raw_body).unwrap_or(JsonValue::String(raw_body));
        let duration_ms = started.elapsed().as_millis() as u64;

        let response_data = json!({
            "status_code": status_code,
            "headers": JsonValue::Object(headers.clone()),
            "body": parsed_body,
        });

        Ok(PluginOutcome {
            output: json!({
                "status_code": status_code,
                "headers": JsonValue::Object(headers),
                "body": parsed_body,
                "duration_ms": duration_ms,
            }),
            request_data: Some(request_data),
            response_data: Some(response_data),
            logs: vec![format!("{} {} -> {}", method, raw_url, status_code)],
        })
    }
}

//! Gemini adapter for the classifier (`generateContent` REST endpoint).

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;
use tsb_core::{config::Config, errors::Error, ports::GenerativeModel, Result};

const API_KEY_HEADER: &str = "x-goog-api-key";

#[derive(Clone, Debug)]
pub struct GeminiClient {
    api_key: Option<String>,
    model: String,
    base_url: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl GeminiClient {
    pub fn new(
        api_key: Option<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::External(format!("gemini http client error: {e}")))?;
        Ok(Self {
            api_key,
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            http,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Self::new(
            cfg.gemini_api_key.clone(),
            cfg.gemini_model.clone(),
            cfg.gemini_base_url.clone(),
            cfg.classifier_timeout,
        )
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| Error::Config("GEMINI_API_KEY is not set".to_string()))
    }

    fn model_url(&self) -> String {
        format!("{}/models/{}", self.base_url, self.model)
    }

    fn request_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Timeout {
                operation: "gemini request".to_string(),
                after: self.timeout,
            }
        } else {
            Error::Connectivity(format!("gemini request error: {e}"))
        }
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        let excerpt = body.chars().take(200).collect::<String>();
        Err(match status.as_u16() {
            401 | 403 => Error::Authorization(format!("gemini rejected the api key: {status}")),
            429 => Error::Classification(format!("gemini rate limited: {status} {excerpt}")),
            _ => Error::Classification(format!("gemini request failed: {status} {excerpt}")),
        })
    }
}

#[async_trait]
impl GenerativeModel for GeminiClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let key = self.api_key()?;
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "generationConfig": {
                "temperature": 0,
                "responseMimeType": "application/json"
            }
        });

        let resp = self
            .http
            .post(format!("{}:generateContent", self.model_url()))
            .header(API_KEY_HEADER, key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;
        let resp = Self::check_status(resp).await?;

        let v: Value = resp
            .json()
            .await
            .map_err(|e| Error::Classification(format!("gemini json error: {e}")))?;
        let text = candidate_text(&v)?;
        debug!(model = %self.model, chars = text.len(), "gemini response");
        Ok(text)
    }

    async fn ping(&self) -> Result<()> {
        let key = self.api_key()?;
        let resp = self
            .http
            .get(self.model_url())
            .header(API_KEY_HEADER, key)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;
        Self::check_status(resp).await.map(|_| ())
    }
}

/// Concatenated text parts of the first candidate.
fn candidate_text(v: &Value) -> Result<String> {
    let Some(candidate) = v
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
    else {
        let reason = v
            .pointer("/promptFeedback/blockReason")
            .and_then(|r| r.as_str())
            .unwrap_or("no candidates");
        return Err(Error::Classification(format!(
            "gemini returned no answer: {reason}"
        )));
    };

    let text = candidate
        .pointer("/content/parts")
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<String>()
        })
        .unwrap_or_default();
    Ok(text)
}

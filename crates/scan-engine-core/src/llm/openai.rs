use super::{AiJudge, AiSettings, JudgeRequest, Judgment};
use crate::consensus::Verdict;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// OpenAI-compatible chat completion client. The model name comes from each
/// catalog [`AiModel`](crate::catalog::AiModel), so one judge serves every
/// model behind the same gateway.
#[derive(Debug, Clone)]
pub struct ChatCompletionJudge {
    http: Client,
    base_url: String,
    api_key: String,
    max_retries: u32,
}

impl ChatCompletionJudge {
    pub fn new(settings: &AiSettings) -> Result<Self> {
        if settings.api_key.trim().is_empty() {
            bail!("AI API key must be provided via {}", AiSettings::API_KEY_ENV);
        }
        let base_url = settings
            .endpoint
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let http = Client::builder()
            .user_agent("scan-engine/0.3")
            .timeout(Duration::from_secs(settings.timeout_secs.unwrap_or(30)))
            .build()
            .context("failed to build chat completion HTTP client")?;
        Ok(Self {
            http,
            base_url,
            api_key: settings.api_key.clone(),
            max_retries: settings.max_retries,
        })
    }

    fn url_for(&self, request: &JudgeRequest<'_>) -> String {
        let base = request
            .model
            .endpoint
            .as_deref()
            .unwrap_or(&self.base_url)
            .trim_end_matches('/');
        format!("{base}/v1/chat/completions")
    }
}

#[async_trait]
impl AiJudge for ChatCompletionJudge {
    async fn judge(&self, request: &JudgeRequest<'_>) -> Result<Judgment> {
        let findings: Vec<&str> = request.findings.iter().map(|f| f.check_id.as_str()).collect();
        let payload = ChatCompletionRequest {
            model: request.model.model_id.clone(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: format!(
                        "Target ({kind}):\n{value}\n\nRule score: {score}\nTriggered checks: {findings}\n",
                        kind = request.target.kind.as_str(),
                        value = truncate(&request.target.value, 2000),
                        score = request.base_score,
                        findings = if findings.is_empty() {
                            "none".to_string()
                        } else {
                            findings.join(", ")
                        },
                    ),
                },
            ],
            temperature: 0.0,
            max_tokens: 120,
        };
        let url = self.url_for(request);

        let mut attempt = 0u32;
        let mut backoff = Duration::from_millis(200);
        loop {
            let response = self
                .http
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&payload)
                .send()
                .await;

            let response = match response {
                Ok(resp) => resp,
                Err(err) => {
                    if attempt >= self.max_retries {
                        return Err(err).context("failed to call chat completions API");
                    }
                    warn!(model = %request.model.id, attempt, error = %err, "chat completion request failed; retrying");
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(5));
                    attempt += 1;
                    continue;
                }
            };

            if !response.status().is_success() {
                let status = response.status();
                // Client errors other than rate limiting will not improve on retry.
                let retryable = status.is_server_error() || status.as_u16() == 429;
                if !retryable || attempt >= self.max_retries {
                    let body = response.text().await.unwrap_or_default();
                    bail!("chat completions API error ({}): {}", status, truncate(&body, 300));
                }
                sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(5));
                attempt += 1;
                continue;
            }

            let chat: ChatCompletionResponse = response
                .json()
                .await
                .context("failed to parse chat completions response")?;
            let content = chat
                .choices
                .into_iter()
                .find_map(|choice| choice.message.content)
                .ok_or_else(|| anyhow!("chat completions response missing message content"))?;

            let judgment = parse_judgment(&content)
                .with_context(|| format!("model {} returned an unusable verdict", request.model.id))?;
            debug!(model = %request.model.id, verdict = ?judgment.verdict, confidence = judgment.confidence, "model judged target");
            return Ok(judgment);
        }
    }
}

const SYSTEM_PROMPT: &str = "You are a phishing and malware triage assistant. Decide whether the target is malicious. Respond with strict JSON only: {\"verdict\": \"malicious|benign\", \"confidence\": 0.0-1.0}.";

#[derive(Deserialize)]
struct ModelVerdict {
    verdict: String,
    confidence: f64,
}

/// Parse a model reply, tolerating code fences and relaxed JSON.
fn parse_judgment(content: &str) -> Result<Judgment> {
    let payload = extract_json_payload(content);
    let raw: ModelVerdict = match serde_json::from_str(&payload) {
        Ok(raw) => raw,
        Err(strict_err) => json5::from_str(&payload).map_err(|_| {
            anyhow!(strict_err).context(format!("expected JSON verdict, got {:?}", truncate(&payload, 120)))
        })?,
    };

    let verdict = match raw.verdict.trim().to_ascii_lowercase().as_str() {
        "malicious" | "phishing" | "suspicious" | "malware" => Verdict::Malicious,
        "benign" | "safe" | "legitimate" | "clean" => Verdict::Benign,
        other => bail!("unknown verdict label `{other}`"),
    };
    if !raw.confidence.is_finite() || raw.confidence < 0.0 {
        bail!("confidence must be a non-negative number, got {}", raw.confidence);
    }
    // Some models answer in percent.
    let confidence = if raw.confidence > 1.0 {
        raw.confidence / 100.0
    } else {
        raw.confidence
    };
    Ok(Judgment {
        verdict,
        confidence: confidence.clamp(0.0, 1.0),
    })
}

fn extract_json_payload(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(stripped) = strip_code_fence(trimmed) {
        return stripped;
    }
    trimmed.to_string()
}

fn strip_code_fence(input: &str) -> Option<String> {
    let mut trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return None;
    }
    trimmed = trimmed.trim_start_matches("```");
    if let Some(rest) = trimmed.strip_prefix("json") {
        trimmed = rest;
    }
    let end = trimmed.rfind("```").unwrap_or(trimmed.len());
    Some(trimmed[..end].trim().to_string())
}

fn truncate(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    input.chars().take(max_chars).collect::<String>() + "…"
}

#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{catalog::defaults::default_models, pipeline::ScanTarget};
    use httpmock::prelude::*;

    fn settings(url: String, max_retries: u32) -> AiSettings {
        AiSettings {
            api_key: "test-key".into(),
            endpoint: Some(url),
            timeout_secs: Some(5),
            max_retries,
        }
    }

    fn completion(content: &str) -> String {
        serde_json::json!({ "choices": [ { "message": { "content": content } } ] }).to_string()
    }

    #[tokio::test]
    async fn judge_parses_successful_response() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1/chat/completions")
                    .header("authorization", "Bearer test-key")
                    .body_contains("gpt-4o-mini");
                then.status(200)
                    .header("content-type", "application/json")
                    .body(completion(r#"{"verdict":"malicious","confidence":0.82}"#));
            })
            .await;

        let judge = ChatCompletionJudge::new(&settings(server.base_url(), 0)).unwrap();
        let models = default_models();
        let model = &models[0];
        let target = ScanTarget::url("http://192.0.2.1/login");
        let judgment = judge
            .judge(&JudgeRequest {
                model,
                target: &target,
                base_score: 45,
                findings: &[],
            })
            .await
            .unwrap();
        mock.assert_async().await;
        assert_eq!(judgment.verdict, Verdict::Malicious);
        assert!((judgment.confidence - 0.82).abs() < 1e-9);
    }

    #[tokio::test]
    async fn retries_server_errors_then_gives_up() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/v1/chat/completions");
                then.status(500);
            })
            .await;

        let judge = ChatCompletionJudge::new(&settings(server.base_url(), 1)).unwrap();
        let models = default_models();
        let model = &models[0];
        let target = ScanTarget::url("https://example.com");
        let err = judge
            .judge(&JudgeRequest {
                model,
                target: &target,
                base_score: 0,
                findings: &[],
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("chat completions API error"));
        mock.assert_hits_async(2).await;
    }

    #[test]
    fn requires_api_key() {
        let mut blank = settings("http://localhost".into(), 0);
        blank.api_key = " ".into();
        assert!(ChatCompletionJudge::new(&blank).is_err());
    }

    #[test]
    fn parses_fenced_and_relaxed_replies() {
        let fenced = "```json\n{\"verdict\": \"benign\", \"confidence\": 0.9}\n```";
        let judgment = parse_judgment(fenced).unwrap();
        assert_eq!(judgment.verdict, Verdict::Benign);

        let relaxed = "{verdict: 'phishing', confidence: 87,}";
        let judgment = parse_judgment(relaxed).unwrap();
        assert_eq!(judgment.verdict, Verdict::Malicious);
        assert!((judgment.confidence - 0.87).abs() < 1e-9);
    }

    #[test]
    fn rejects_unknown_labels_and_garbage() {
        assert!(parse_judgment(r#"{"verdict":"maybe","confidence":0.5}"#).is_err());
        assert!(parse_judgment("I think it is fine").is_err());
        assert!(parse_judgment(r#"{"verdict":"benign","confidence":-1}"#).is_err());
    }

    #[test]
    fn truncate_adds_ellipsis() {
        assert_eq!(truncate("abc", 10), "abc");
        assert_eq!(truncate("abcdefghij", 4), "abcd…");
    }
}

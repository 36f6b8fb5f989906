use anyhow::{Context, Result};
use std::collections::HashMap;

/// Environment-driven credentials and transport knobs for the AI judge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AiSettings {
    pub api_key: String,
    pub endpoint: Option<String>,
    pub timeout_secs: Option<u64>,
    pub max_retries: u32,
}

impl AiSettings {
    pub const API_KEY_ENV: &'static str = "SCAN_ENGINE_AI_API_KEY";
    pub const ENDPOINT_ENV: &'static str = "SCAN_ENGINE_AI_ENDPOINT";
    pub const TIMEOUT_ENV: &'static str = "SCAN_ENGINE_AI_TIMEOUT_SECS";
    pub const RETRIES_ENV: &'static str = "SCAN_ENGINE_AI_MAX_RETRIES";

    /// Load settings from environment variables.
    ///
    /// * `SCAN_ENGINE_AI_API_KEY`: bearer token (required).
    /// * `SCAN_ENGINE_AI_ENDPOINT`: optional OpenAI-compatible base URL.
    pub fn from_env() -> Result<Self> {
        Self::from_map(std::env::vars().collect())
    }

    pub fn from_map(vars: HashMap<String, String>) -> Result<Self> {
        let api_key = vars
            .get(Self::API_KEY_ENV)
            .cloned()
            .filter(|v| !v.trim().is_empty())
            .with_context(|| {
                format!(
                    "environment variable {} must be set to enable AI consensus",
                    Self::API_KEY_ENV
                )
            })?;
        let endpoint = vars
            .get(Self::ENDPOINT_ENV)
            .cloned()
            .filter(|v| !v.trim().is_empty());
        let timeout_secs = vars
            .get(Self::TIMEOUT_ENV)
            .and_then(|v| v.trim().parse::<u64>().ok());
        let max_retries = vars
            .get(Self::RETRIES_ENV)
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(2);

        Ok(Self {
            api_key,
            endpoint,
            timeout_secs,
            max_retries,
        })
    }
}

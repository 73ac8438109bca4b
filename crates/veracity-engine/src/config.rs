use std::env;
use std::time::Duration;

use anyhow::{anyhow, Result};
use veracity_contracts::models::{ModelSelector, CHAT, EDIT, VISION};

use crate::MISSING_API_KEY_MESSAGE;

const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Remote-service settings. Read once from the environment; CLI flags may
/// override the requested models afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub analysis_model: Option<String>,
    pub highlight_model: Option<String>,
    pub chat_model: Option<String>,
    pub request_timeout_s: f64,
    pub transport_retries: usize,
    pub retry_backoff_s: f64,
    pub upload_max_dim: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModels {
    pub analysis: String,
    pub highlight: String,
    pub chat: String,
    pub notes: Vec<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: DEFAULT_API_BASE.to_string(),
            analysis_model: None,
            highlight_model: None,
            chat_model: None,
            request_timeout_s: 90.0,
            transport_retries: 2,
            retry_backoff_s: 1.2,
            upload_max_dim: 1536,
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            api_key: first_non_empty_env(&["GEMINI_API_KEY", "GOOGLE_API_KEY", "API_KEY"]),
            api_base: non_empty_env("GEMINI_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or(defaults.api_base),
            analysis_model: non_empty_env("VERACITY_ANALYSIS_MODEL"),
            highlight_model: non_empty_env("VERACITY_HIGHLIGHT_MODEL"),
            chat_model: non_empty_env("VERACITY_CHAT_MODEL"),
            request_timeout_s: env_f64(
                "VERACITY_REQUEST_TIMEOUT",
                defaults.request_timeout_s,
                15.0,
                300.0,
            ),
            transport_retries: env_f64(
                "VERACITY_TRANSPORT_RETRIES",
                defaults.transport_retries as f64,
                0.0,
                4.0,
            )
            .round() as usize,
            retry_backoff_s: env_f64(
                "VERACITY_RETRY_BACKOFF",
                defaults.retry_backoff_s,
                0.1,
                10.0,
            ),
            upload_max_dim: env_f64(
                "VERACITY_UPLOAD_MAX_DIM",
                defaults.upload_max_dim as f64,
                128.0,
                8192.0,
            )
            .round() as u32,
        }
    }

    pub fn require_api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| anyhow!(MISSING_API_KEY_MESSAGE))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_s)
    }

    /// Resolves the three requested models against the registry for `service`.
    /// A requested model the service cannot serve falls back to its default,
    /// with a note saying so.
    pub fn resolve_models(&self, service: &str) -> Result<ResolvedModels> {
        let selector = ModelSelector::new(None);
        let mut notes = Vec::new();
        let mut pick = |requested: Option<&str>, capability: &str| -> Result<String> {
            let selection = selector
                .select(requested, service, capability)
                .map_err(|err| anyhow!(err))?;
            if selection.requested.is_some() {
                if let Some(reason) = selection.fallback_reason {
                    notes.push(reason);
                }
            }
            Ok(selection.model.name)
        };
        let analysis = pick(self.analysis_model.as_deref(), VISION)?;
        let highlight = pick(self.highlight_model.as_deref(), EDIT)?;
        let chat = pick(self.chat_model.as_deref(), CHAT)?;
        Ok(ResolvedModels {
            analysis,
            highlight,
            chat,
            notes,
        })
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn first_non_empty_env(keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| non_empty_env(key))
}

fn env_f64(key: &str, default: f64, min: f64, max: f64) -> f64 {
    non_empty_env(key)
        .and_then(|raw| raw.parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(default)
        .clamp(min, max)
}

mod config;
mod conversation;
mod dryrun;
mod gemini;
mod history;
mod service;
mod store;
mod upload;
mod workbench;

#[cfg(test)]
mod test_support;

use serde_json::{Map, Value};

pub use config::{ResolvedModels, ServiceConfig};
pub use conversation::{priming_turns, ConversationManager, SharedChatSession};
pub use dryrun::DryrunService;
pub use gemini::GeminiService;
pub use history::HistoryStore;
pub use service::{default_service_registry, AnalysisService, AnalysisServiceRegistry, ChatSession};
pub use store::ImageRecordStore;
pub use workbench::{BatchReport, Workbench, WorkbenchSnapshot};

pub const CHAT_FALLBACK_MESSAGE: &str = "Sorry, I encountered an error. Please try again.";
pub const MISSING_API_KEY_MESSAGE: &str = "API key not configured";

/// Flattens an error chain into one line, outermost cause first.
pub fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(err.to_string().trim(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

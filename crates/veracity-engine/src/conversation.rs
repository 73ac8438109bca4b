use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use veracity_contracts::records::{AnalysisResult, ChatMessage, ImageRecord};

use crate::service::{AnalysisService, ChatSession};

pub type SharedChatSession = Arc<Mutex<Box<dyn ChatSession>>>;

const PRIMING_INSTRUCTION: &str = "You are a helpful AI assistant specializing in image analysis. A user has just received an analysis of an image. Your job is to answer their follow-up questions about it. Here is the initial analysis summary you should base the conversation on.";
const PRIMING_ACK: &str = "Understood. I will answer questions based on the provided analysis.";
const PRIMING_READY: &str = "Okay, I have the context. I'm ready for the user's questions.";

/// Fixed opening exchange that grounds a chat in one analysis without
/// resending the image.
pub fn priming_turns(result: &AnalysisResult) -> Vec<ChatMessage> {
    vec![
        ChatMessage::user(PRIMING_INSTRUCTION),
        ChatMessage::model(PRIMING_ACK),
        ChatMessage::user(format!(
            "Analysis Classification: {}. Reasoning: {}",
            result.classification, result.reasoning
        )),
        ChatMessage::model(PRIMING_READY),
    ]
}

struct LiveSession {
    record_id: String,
    session: SharedChatSession,
}

/// Holds at most one chat session, scoped to one record.
#[derive(Default)]
pub struct ConversationManager {
    live: Option<LiveSession>,
    sessions_created: u64,
}

impl ConversationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sessions_created(&self) -> u64 {
        self.sessions_created
    }

    /// Drops the live session, if any. Sends already holding it finish normally.
    pub fn invalidate(&mut self) -> bool {
        self.live.take().is_some()
    }

    /// Returns the session for `record`, creating and priming one when the
    /// live session belongs to another record or none exists. The flag is
    /// true when a session was created.
    pub fn session_for(
        &mut self,
        record: &ImageRecord,
        service: &dyn AnalysisService,
    ) -> Result<(SharedChatSession, bool)> {
        if let Some(live) = self.live.as_ref() {
            if live.record_id == record.id {
                return Ok((live.session.clone(), false));
            }
        }
        self.live = None;
        let result = record
            .result
            .as_ref()
            .with_context(|| format!("{} has no analysis to discuss", record.id))?;
        let session: SharedChatSession =
            Arc::new(Mutex::new(service.create_chat(priming_turns(result))?));
        self.sessions_created += 1;
        self.live = Some(LiveSession {
            record_id: record.id.clone(),
            session: session.clone(),
        });
        Ok((session, true))
    }
}

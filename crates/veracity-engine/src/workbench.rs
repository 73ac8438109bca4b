use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;
use veracity_contracts::events::EventWriter;
use veracity_contracts::records::{
    AnalysisResult, ChatMessage, HistoryEntry, ImageFile, ImageRecord, RecordStatus,
};

use crate::conversation::{ConversationManager, SharedChatSession};
use crate::history::HistoryStore;
use crate::service::AnalysisService;
use crate::store::ImageRecordStore;
use crate::{error_chain_text, map_object, CHAT_FALLBACK_MESSAGE};

const ERROR_TEXT_LIMIT: usize = 512;
const UNKNOWN_ANALYSIS_ERROR: &str = "An unknown error occurred during analysis.";
const UNKNOWN_HIGHLIGHT_ERROR: &str = "An unknown error occurred during highlighting.";

/// Per-record outcome counts for one `analyze_batch` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub launched: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Results whose record was removed before they landed.
    pub dropped: usize,
}

/// Everything a presentation layer needs to render one frame.
#[derive(Debug, Clone)]
pub struct WorkbenchSnapshot {
    pub records: Vec<ImageRecord>,
    pub selected_id: Option<String>,
    pub selected: Option<ImageRecord>,
    pub pending_count: usize,
    pub is_analyzing: bool,
    pub is_chatting: bool,
    pub history: Vec<HistoryEntry>,
}

struct StagedEntry {
    batch_id: String,
    order: usize,
    entry: HistoryEntry,
}

#[derive(Default)]
struct BatchState {
    store: ImageRecordStore,
    history: HistoryStore,
    staged: Vec<StagedEntry>,
    batches_in_flight: usize,
    chats_in_flight: usize,
    /// Bumped whenever the batch is replaced or cleared; chat turns started
    /// under an older generation are dropped.
    generation: u64,
    released_previews: Vec<u64>,
    subscribers: Vec<Sender<WorkbenchSnapshot>>,
}

impl BatchState {
    fn snapshot(&self) -> WorkbenchSnapshot {
        WorkbenchSnapshot {
            records: self.store.records().to_vec(),
            selected_id: self.store.selected_id().map(str::to_string),
            selected: self.store.selected().cloned(),
            pending_count: self.store.pending_count(),
            is_analyzing: self.batches_in_flight > 0,
            is_chatting: self.chats_in_flight > 0,
            history: self.history.entries().to_vec(),
        }
    }

    fn publish(&mut self) {
        if self.subscribers.is_empty() {
            return;
        }
        let snapshot = self.snapshot();
        self.subscribers
            .retain(|subscriber| subscriber.send(snapshot.clone()).is_ok());
    }

    /// Previews still owed to History (including entries staged by a batch
    /// that has not reached its barrier yet) stay alive.
    fn sweep_previews(&mut self) -> Vec<u64> {
        let mut retained: Vec<u64> = self.history.preview_ids().collect();
        retained.extend(self.staged.iter().map(|staged| staged.entry.preview.id()));
        let released = self.store.sweep_previews(retained);
        self.released_previews.extend(released.iter().copied());
        released
    }

    fn take_staged(&mut self, batch_id: &str) -> Vec<HistoryEntry> {
        let (mut mine, rest): (Vec<StagedEntry>, Vec<StagedEntry>) =
            std::mem::take(&mut self.staged)
                .into_iter()
                .partition(|staged| staged.batch_id == batch_id);
        self.staged = rest;
        mine.sort_by_key(|staged| staged.order);
        mine.into_iter().map(|staged| staged.entry).collect()
    }
}

enum Merge {
    Succeeded,
    Failed,
    Dropped,
}

struct LaunchedBatch {
    batch_id: String,
    records: Vec<ImageRecord>,
}

struct WorkbenchInner {
    service: Arc<dyn AnalysisService>,
    events: EventWriter,
    state: Mutex<BatchState>,
    conversation: Mutex<ConversationManager>,
}

/// The image-analysis workbench: record store, batch orchestrator, highlight
/// requestor and conversation manager behind one cloneable handle.
///
/// `state` and `conversation` are never held at the same time. A chat
/// session lock may be held while taking `state`, never the reverse.
#[derive(Clone)]
pub struct Workbench {
    inner: Arc<WorkbenchInner>,
}

impl Workbench {
    pub fn new(service: Arc<dyn AnalysisService>, events: EventWriter) -> Result<Self> {
        events
            .emit(
                "session_started",
                map_object(json!({ "service": service.name() })),
            )
            .with_context(|| format!("failed writing {}", events.path().display()))?;
        Ok(Self {
            inner: Arc::new(WorkbenchInner {
                service,
                events,
                state: Mutex::new(BatchState::default()),
                conversation: Mutex::new(ConversationManager::new()),
            }),
        })
    }

    pub fn service_name(&self) -> &str {
        self.inner.service.name()
    }

    pub fn events(&self) -> &EventWriter {
        &self.inner.events
    }

    pub fn snapshot(&self) -> WorkbenchSnapshot {
        self.state().snapshot()
    }

    /// Receives a fresh snapshot after every state transition.
    pub fn subscribe(&self) -> Receiver<WorkbenchSnapshot> {
        let (sender, receiver) = mpsc::channel();
        self.state().subscribers.push(sender);
        receiver
    }

    /// Preview ids that nothing references anymore, each reported once.
    pub fn drain_released_previews(&self) -> Vec<u64> {
        std::mem::take(&mut self.state().released_previews)
    }

    pub fn sessions_created(&self) -> u64 {
        self.conversation().sessions_created()
    }

    pub fn add_images(&self, files: Vec<ImageFile>) -> Vec<String> {
        if files.is_empty() {
            return Vec::new();
        }
        let stamp = Utc::now().timestamp_millis();
        let (ids, selected_id) = {
            let mut state = self.state();
            let ids = state.store.add(files, stamp);
            state.publish();
            (ids, state.store.selected_id().map(str::to_string))
        };
        self.emit(
            "images_added",
            json!({ "record_ids": ids, "selected_id": selected_id }),
        );
        ids
    }

    /// Analyzes every pending record concurrently and returns once all of
    /// them have settled. A no-op when nothing is pending.
    pub fn analyze_batch(&self) -> BatchReport {
        match self.begin_batch() {
            Some(batch) => self.run_batch(batch),
            None => BatchReport::default(),
        }
    }

    /// Like `analyze_batch`, but returns as soon as the pending records are
    /// marked loading.
    pub fn spawn_analyze_batch(&self) -> JoinHandle<BatchReport> {
        let batch = self.begin_batch();
        let workbench = self.clone();
        thread::spawn(move || match batch {
            Some(batch) => workbench.run_batch(batch),
            None => BatchReport::default(),
        })
    }

    fn begin_batch(&self) -> Option<LaunchedBatch> {
        let records = {
            let mut state = self.state();
            let records = state.store.begin_analysis();
            if records.is_empty() {
                return None;
            }
            state.batches_in_flight += 1;
            state.publish();
            records
        };
        let batch_id = Uuid::new_v4().to_string();
        let record_ids: Vec<&str> = records.iter().map(|record| record.id.as_str()).collect();
        self.emit(
            "batch_started",
            json!({ "batch_id": batch_id, "record_ids": record_ids }),
        );
        Some(LaunchedBatch { batch_id, records })
    }

    fn run_batch(&self, batch: LaunchedBatch) -> BatchReport {
        let mut report = BatchReport {
            launched: batch.records.len(),
            ..BatchReport::default()
        };
        let batch_id = batch.batch_id.as_str();
        let (sender, receiver) = mpsc::channel::<Merge>();
        thread::scope(|scope| {
            for (order, record) in batch.records.iter().enumerate() {
                let sender = sender.clone();
                scope.spawn(move || {
                    let outcome = self.inner.service.analyze(&record.file);
                    let merged = self.merge_analysis(batch_id, order, &record.id, outcome);
                    let _ = sender.send(merged);
                });
            }
            drop(sender);
            for merged in receiver {
                match merged {
                    Merge::Succeeded => report.succeeded += 1,
                    Merge::Failed => report.failed += 1,
                    Merge::Dropped => report.dropped += 1,
                }
            }
        });

        let prepended: Vec<String> = {
            let mut state = self.state();
            let entries = state.take_staged(batch_id);
            let ids = entries.iter().map(|entry| entry.id.clone()).collect();
            state.history.prepend_batch(entries);
            state.batches_in_flight = state.batches_in_flight.saturating_sub(1);
            state.publish();
            ids
        };
        if !prepended.is_empty() {
            self.emit(
                "history_prepended",
                json!({ "batch_id": batch_id, "record_ids": prepended }),
            );
        }
        self.emit(
            "batch_finished",
            json!({
                "batch_id": batch_id,
                "launched": report.launched,
                "succeeded": report.succeeded,
                "failed": report.failed,
                "dropped": report.dropped,
            }),
        );
        report
    }

    /// Lands one resolution on its own record. Records that left `loading`
    /// in the meantime (cleared, replaced by a History load) drop it.
    fn merge_analysis(
        &self,
        batch_id: &str,
        order: usize,
        record_id: &str,
        outcome: Result<AnalysisResult>,
    ) -> Merge {
        let failure = outcome.as_ref().err().map(|err| {
            failure_message(err, "Analysis failed: ", "", UNKNOWN_ANALYSIS_ERROR)
        });
        let merged = {
            let mut state = self.state();
            let merged = state.store.update(record_id, |current| {
                if current.status != RecordStatus::Loading {
                    return None;
                }
                Some(match (&outcome, &failure) {
                    (Ok(result), _) => current.succeeded(result.clone()),
                    (Err(_), Some(message)) => current.failed(message.clone()),
                    (Err(_), None) => current.failed(UNKNOWN_ANALYSIS_ERROR),
                })
            });
            if let Some(entry) = merged.as_ref().and_then(ImageRecord::history_entry) {
                state.staged.push(StagedEntry {
                    batch_id: batch_id.to_string(),
                    order,
                    entry,
                });
            }
            if merged.is_some() {
                state.publish();
            }
            merged
        };

        match (merged, outcome) {
            (None, _) => {
                self.emit(
                    "analysis_dropped",
                    json!({ "batch_id": batch_id, "record_id": record_id }),
                );
                Merge::Dropped
            }
            (Some(_), Ok(result)) => {
                self.emit(
                    "analysis_succeeded",
                    json!({
                        "batch_id": batch_id,
                        "record_id": record_id,
                        "classification": result.classification.as_str(),
                        "reasoning": result.reasoning,
                    }),
                );
                Merge::Succeeded
            }
            (Some(record), Err(_)) => {
                self.emit(
                    "analysis_failed",
                    json!({
                        "batch_id": batch_id,
                        "record_id": record_id,
                        "error": record.error,
                    }),
                );
                Merge::Failed
            }
        }
    }

    /// Asks for a highlighted rendition of a successfully analyzed record.
    /// Returns false without touching anything when the record is missing,
    /// not in `success`, or has no result.
    pub fn request_highlight(&self, id: &str) -> bool {
        let started = {
            let mut state = self.state();
            let started = state.store.update(id, |current| {
                (current.status == RecordStatus::Success && current.result.is_some())
                    .then(|| current.with_status(RecordStatus::Highlighting))
            });
            if started.is_some() {
                state.publish();
            }
            started
        };
        let Some(record) = started else {
            return false;
        };
        self.emit("highlight_started", json!({ "record_id": id }));

        let reasoning = record
            .result
            .as_ref()
            .map(|result| result.reasoning.as_str())
            .unwrap_or_default();
        let outcome = self.inner.service.highlight(&record.file, reasoning);
        let failure = outcome.as_ref().err().map(|err| {
            failure_message(err, "Highlighting failed: ", ".", UNKNOWN_HIGHLIGHT_ERROR)
        });

        let landed = {
            let mut state = self.state();
            let landed = state.store.update(id, |current| {
                if current.status != RecordStatus::Highlighting {
                    return None;
                }
                Some(match (outcome, failure.as_ref()) {
                    (Ok(image), _) => current.highlighted(image),
                    (Err(_), Some(message)) => current.failed(message.clone()),
                    (Err(_), None) => current.failed(UNKNOWN_HIGHLIGHT_ERROR),
                })
            });
            if landed.is_some() {
                state.publish();
            }
            landed
        };

        match (landed, failure) {
            (None, _) => {}
            (Some(record), None) => self.emit(
                "highlight_succeeded",
                json!({
                    "record_id": id,
                    "mime_type": record.highlight.as_ref().map(|image| image.mime_type.clone()),
                }),
            ),
            (Some(_), Some(message)) => self.emit(
                "highlight_failed",
                json!({ "record_id": id, "error": message }),
            ),
        }
        true
    }

    pub fn highlight_selected(&self) -> bool {
        let selected_id = self.state().store.selected_id().map(str::to_string);
        match selected_id {
            Some(id) => self.request_highlight(&id),
            None => false,
        }
    }

    /// Moves the selection and ends any live conversation. Unknown ids and
    /// the already-selected id change nothing.
    pub fn select_image(&self, id: &str) -> bool {
        let changed = {
            let mut state = self.state();
            let changed = state.store.select(id);
            if changed {
                state.publish();
            }
            changed
        };
        if !changed {
            return false;
        }
        self.emit("selection_changed", json!({ "selected_id": id }));
        self.end_conversation("selection_changed");
        true
    }

    /// Sends a follow-up question about the selected record. The user
    /// message lands immediately; the reply (or the fallback apology) lands
    /// on the same record once the service answers. Blank text, no
    /// selection, or a selection without an analysis is a no-op.
    pub fn send_message(&self, text: &str) -> Option<ChatMessage> {
        if text.trim().is_empty() {
            return None;
        }
        let (record, generation) = {
            let mut state = self.state();
            let record = state.store.selected()?.clone();
            record.result.as_ref()?;
            state.chats_in_flight += 1;
            state.publish();
            (record, state.generation)
        };
        let _in_flight = ChatInFlight { workbench: self };

        match self.session_for(&record) {
            Ok(session) => {
                // Held across the whole turn so the transcript order matches
                // the order the session sees.
                let mut session = session.lock().unwrap_or_else(PoisonError::into_inner);
                self.exchange(&record.id, generation, text, |text| session.send(text))
            }
            Err(err) => self.exchange(&record.id, generation, text, |_| Err(err)),
        }
    }

    fn session_for(&self, record: &ImageRecord) -> Result<SharedChatSession> {
        let mut conversation = self.conversation();
        let (session, created) = conversation.session_for(record, self.inner.service.as_ref())?;
        if created {
            self.emit("chat_session_created", json!({ "record_id": record.id }));
        }
        Ok(session)
    }

    fn exchange<F>(
        &self,
        record_id: &str,
        generation: u64,
        text: &str,
        send: F,
    ) -> Option<ChatMessage>
    where
        F: FnOnce(&str) -> Result<String>,
    {
        if !self.append_message(record_id, generation, ChatMessage::user(text)) {
            self.emit(
                "chat_dropped",
                json!({ "record_id": record_id, "stage": "question" }),
            );
            return None;
        }

        let reply = match send(text) {
            Ok(reply) => {
                self.emit(
                    "chat_reply",
                    json!({ "record_id": record_id, "chars": reply.chars().count() }),
                );
                ChatMessage::model(reply)
            }
            Err(err) => {
                self.emit(
                    "chat_failed",
                    json!({
                        "record_id": record_id,
                        "error": error_chain_text(&err, ERROR_TEXT_LIMIT),
                    }),
                );
                ChatMessage::model(CHAT_FALLBACK_MESSAGE)
            }
        };

        if !self.append_message(record_id, generation, reply.clone()) {
            self.emit(
                "chat_dropped",
                json!({ "record_id": record_id, "stage": "reply" }),
            );
            return None;
        }
        Some(reply)
    }

    fn append_message(&self, record_id: &str, generation: u64, message: ChatMessage) -> bool {
        let mut state = self.state();
        if state.generation != generation {
            return false;
        }
        let appended = state
            .store
            .update(record_id, |current| Some(current.with_message(message)))
            .is_some();
        if appended {
            state.publish();
        }
        appended
    }

    /// Replaces the batch with the single record rebuilt from a History entry.
    pub fn select_history(&self, id: &str) -> bool {
        let released = {
            let mut state = self.state();
            let Some(entry) = state.history.get(id).cloned() else {
                return false;
            };
            state.store.replace_with(ImageRecord::from_history(&entry));
            state.generation += 1;
            let released = state.sweep_previews();
            state.publish();
            released
        };
        self.emit("history_loaded", json!({ "record_id": id }));
        self.end_conversation("history_loaded");
        self.report_released(released);
        true
    }

    /// Discards every record and the selection. History is kept.
    pub fn clear_all(&self) {
        let (removed, released) = {
            let mut state = self.state();
            let removed = state.store.len();
            state.store.clear();
            state.generation += 1;
            let released = state.sweep_previews();
            state.publish();
            (removed, released)
        };
        self.emit("batch_cleared", json!({ "removed": removed }));
        self.end_conversation("batch_cleared");
        self.report_released(released);
    }

    fn end_conversation(&self, reason: &str) {
        if self.conversation().invalidate() {
            self.emit("chat_session_destroyed", json!({ "reason": reason }));
        }
    }

    fn report_released(&self, released: Vec<u64>) {
        if !released.is_empty() {
            self.emit("previews_released", json!({ "preview_ids": released }));
        }
    }

    fn state(&self) -> MutexGuard<'_, BatchState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn conversation(&self) -> MutexGuard<'_, ConversationManager> {
        self.inner
            .conversation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event_type: &str, payload: Value) {
        let _ = self.inner.events.emit(event_type, map_object(payload));
    }
}

struct ChatInFlight<'a> {
    workbench: &'a Workbench,
}

impl Drop for ChatInFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.workbench.state();
        state.chats_in_flight = state.chats_in_flight.saturating_sub(1);
        state.publish();
    }
}

fn failure_message(err: &anyhow::Error, prefix: &str, suffix: &str, unknown: &str) -> String {
    let text = error_chain_text(err, ERROR_TEXT_LIMIT);
    if text.is_empty() {
        return unknown.to_string();
    }
    format!("{prefix}{text}{suffix}")
}

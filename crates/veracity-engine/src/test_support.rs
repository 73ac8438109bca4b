use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use veracity_contracts::records::{
    AnalysisResult, ChatMessage, Classification, HighlightImage, ImageFile,
};

use crate::service::{AnalysisService, ChatSession};

/// Blocks callers until opened; counts how many reached it.
#[derive(Default)]
pub(crate) struct Gate {
    state: Mutex<(bool, usize)>,
    changed: Condvar,
}

impl Gate {
    pub fn open(&self) {
        let mut state = self.state.lock().unwrap();
        state.0 = true;
        self.changed.notify_all();
    }

    pub fn pass(&self) {
        let mut state = self.state.lock().unwrap();
        state.1 += 1;
        self.changed.notify_all();
        while !state.0 {
            state = self.changed.wait(state).unwrap();
        }
    }

    pub fn entered(&self) -> usize {
        self.state.lock().unwrap().1
    }

    pub fn wait_entered(&self, count: usize) {
        let mut state = self.state.lock().unwrap();
        while state.1 < count {
            state = self.changed.wait(state).unwrap();
        }
    }
}

struct ScriptedAnalysis {
    outcome: Result<AnalysisResult, String>,
    delay: Duration,
}

/// In-memory service whose outcomes are scripted per file name.
pub(crate) struct ScriptedService {
    analyses: Mutex<HashMap<String, ScriptedAnalysis>>,
    analyze_calls: AtomicUsize,
    analyze_gate: Mutex<Option<Arc<Gate>>>,
    highlight: Mutex<Result<HighlightImage, String>>,
    highlight_gate: Mutex<Option<Arc<Gate>>>,
    highlight_calls: Mutex<Vec<(String, String)>>,
    chat_creation_error: Mutex<Option<String>>,
    chats_created: AtomicUsize,
    priming: Mutex<Vec<ChatMessage>>,
    replies: Arc<Mutex<VecDeque<Result<String, String>>>>,
    sent: Arc<Mutex<Vec<String>>>,
    chat_gate: Mutex<Option<Arc<Gate>>>,
}

impl ScriptedService {
    pub fn new() -> Self {
        Self {
            analyses: Mutex::new(HashMap::new()),
            analyze_calls: AtomicUsize::new(0),
            analyze_gate: Mutex::new(None),
            highlight: Mutex::new(Ok(HighlightImage::new("image/png", vec![7, 7, 7]))),
            highlight_gate: Mutex::new(None),
            highlight_calls: Mutex::new(Vec::new()),
            chat_creation_error: Mutex::new(None),
            chats_created: AtomicUsize::new(0),
            priming: Mutex::new(Vec::new()),
            replies: Arc::new(Mutex::new(VecDeque::new())),
            sent: Arc::new(Mutex::new(Vec::new())),
            chat_gate: Mutex::new(None),
        }
    }

    pub fn succeed(&self, name: &str, classification: Classification, reasoning: &str) {
        self.script(name, Ok(AnalysisResult::new(classification, reasoning)));
    }

    pub fn fail(&self, name: &str, message: &str) {
        self.script(name, Err(message.to_string()));
    }

    pub fn delay(&self, name: &str, delay: Duration) {
        let mut analyses = self.analyses.lock().unwrap();
        let entry = analyses
            .entry(name.to_string())
            .or_insert_with(|| ScriptedAnalysis {
                outcome: Ok(default_result()),
                delay: Duration::ZERO,
            });
        entry.delay = delay;
    }

    fn script(&self, name: &str, outcome: Result<AnalysisResult, String>) {
        let mut analyses = self.analyses.lock().unwrap();
        let delay = analyses
            .get(name)
            .map(|existing| existing.delay)
            .unwrap_or(Duration::ZERO);
        analyses.insert(name.to_string(), ScriptedAnalysis { outcome, delay });
    }

    pub fn analyze_calls(&self) -> usize {
        self.analyze_calls.load(Ordering::SeqCst)
    }

    pub fn hold_analyses(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.analyze_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn highlight_fails(&self, message: &str) {
        *self.highlight.lock().unwrap() = Err(message.to_string());
    }

    pub fn highlight_returns(&self, image: HighlightImage) {
        *self.highlight.lock().unwrap() = Ok(image);
    }

    pub fn hold_highlights(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.highlight_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn highlight_calls(&self) -> Vec<(String, String)> {
        self.highlight_calls.lock().unwrap().clone()
    }

    pub fn fail_chat_creation(&self, message: &str) {
        *self.chat_creation_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn chats_created(&self) -> usize {
        self.chats_created.load(Ordering::SeqCst)
    }

    pub fn last_priming(&self) -> Vec<ChatMessage> {
        self.priming.lock().unwrap().clone()
    }

    pub fn reply(&self, text: &str) {
        self.replies.lock().unwrap().push_back(Ok(text.to_string()));
    }

    pub fn reply_fails(&self, message: &str) {
        self.replies
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
    }

    pub fn sent_messages(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn hold_chats(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.chat_gate.lock().unwrap() = Some(gate.clone());
        gate
    }
}

fn default_result() -> AnalysisResult {
    AnalysisResult::new(Classification::Uncertain, "unscripted")
}

impl AnalysisService for ScriptedService {
    fn name(&self) -> &str {
        "scripted"
    }

    fn analyze(&self, image: &ImageFile) -> Result<AnalysisResult> {
        self.analyze_calls.fetch_add(1, Ordering::SeqCst);
        let (outcome, delay) = {
            let analyses = self.analyses.lock().unwrap();
            analyses
                .get(&image.name)
                .map(|scripted| (scripted.outcome.clone(), scripted.delay))
                .unwrap_or((Ok(default_result()), Duration::ZERO))
        };
        let gate = self.analyze_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.pass();
        }
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        outcome.map_err(|message| anyhow!(message))
    }

    fn highlight(&self, image: &ImageFile, reasoning: &str) -> Result<HighlightImage> {
        self.highlight_calls
            .lock()
            .unwrap()
            .push((image.name.clone(), reasoning.to_string()));
        let gate = self.highlight_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.pass();
        }
        self.highlight
            .lock()
            .unwrap()
            .clone()
            .map_err(|message| anyhow!(message))
    }

    fn create_chat(&self, priming: Vec<ChatMessage>) -> Result<Box<dyn ChatSession>> {
        if let Some(message) = self.chat_creation_error.lock().unwrap().clone() {
            return Err(anyhow!(message));
        }
        self.chats_created.fetch_add(1, Ordering::SeqCst);
        *self.priming.lock().unwrap() = priming;
        Ok(Box::new(ScriptedChat {
            replies: self.replies.clone(),
            sent: self.sent.clone(),
            gate: self.chat_gate.lock().unwrap().clone(),
        }))
    }
}

struct ScriptedChat {
    replies: Arc<Mutex<VecDeque<Result<String, String>>>>,
    sent: Arc<Mutex<Vec<String>>>,
    gate: Option<Arc<Gate>>,
}

impl ChatSession for ScriptedChat {
    fn send(&mut self, text: &str) -> Result<String> {
        if let Some(gate) = self.gate.as_ref() {
            gate.pass();
        }
        self.sent.lock().unwrap().push(text.to_string());
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(format!("echo: {text}")),
        }
    }
}

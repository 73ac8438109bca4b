use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use veracity_contracts::records::{AnalysisResult, ChatMessage, HighlightImage, ImageFile};

use crate::config::ServiceConfig;
use crate::dryrun::DryrunService;
use crate::gemini::GeminiService;

/// The remote vision/chat model, seen from the workbench.
///
/// Calls block the calling thread; the workbench fans them out across
/// worker threads itself.
pub trait AnalysisService: Send + Sync {
    fn name(&self) -> &str;
    fn analyze(&self, image: &ImageFile) -> Result<AnalysisResult>;
    fn highlight(&self, image: &ImageFile, reasoning: &str) -> Result<HighlightImage>;
    fn create_chat(&self, priming: Vec<ChatMessage>) -> Result<Box<dyn ChatSession>>;
}

/// One ordered conversation with server-side context.
pub trait ChatSession: Send {
    fn send(&mut self, text: &str) -> Result<String>;
}

#[derive(Default)]
pub struct AnalysisServiceRegistry {
    services: BTreeMap<String, Arc<dyn AnalysisService>>,
}

impl AnalysisServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S: AnalysisService + 'static>(&mut self, service: S) {
        self.services
            .insert(service.name().to_string(), Arc::new(service));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AnalysisService>> {
        self.services.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }
}

pub fn default_service_registry(config: &ServiceConfig) -> Result<AnalysisServiceRegistry> {
    let mut services = AnalysisServiceRegistry::new();
    services.register(DryrunService::new(config).context("dryrun service setup failed")?);
    services.register(GeminiService::new(config.clone()).context("gemini service setup failed")?);
    Ok(services)
}

use indexmap::IndexMap;

pub const VISION: &str = "vision";
pub const EDIT: &str = "edit";
pub const CHAT: &str = "chat";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub service: String,
    pub capabilities: Vec<String>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    /// Models for one service and capability, in registration order.
    pub fn by_capability(&self, service: &str, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.service == service && model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, service: &str, capability: &str) -> Option<ModelSpec> {
        let model = self.get(name)?;
        if model.service == service && model.supports(capability) {
            return Some(model.clone());
        }
        None
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str, service: &str, capabilities: &[&str]| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                service: service.to_string(),
                capabilities: capabilities
                    .iter()
                    .map(|item| (*item).to_string())
                    .collect(),
            },
        );
    };

    insert("gemini-2.5-flash", "gemini", &[VISION, CHAT]);
    insert("gemini-2.5-pro", "gemini", &[VISION, CHAT]);
    insert("gemini-2.5-flash-lite", "gemini", &[VISION, CHAT]);
    insert("gemini-2.5-flash-image-preview", "gemini", &[EDIT]);
    insert("gemini-2.5-flash-image", "gemini", &[EDIT]);
    insert("dryrun-vision-1", "dryrun", &[VISION, CHAT]);
    insert("dryrun-edit-1", "dryrun", &[EDIT]);

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_covers_every_capability_per_service() {
        let registry = ModelRegistry::new(None);
        for service in ["gemini", "dryrun"] {
            for capability in [VISION, EDIT, CHAT] {
                assert!(
                    !registry.by_capability(service, capability).is_empty(),
                    "{service} lacks {capability}"
                );
            }
        }
    }

    #[test]
    fn ensure_rejects_wrong_service_or_capability() {
        let registry = ModelRegistry::new(None);
        assert!(registry.ensure("gemini-2.5-flash", "gemini", VISION).is_some());
        assert!(registry.ensure("gemini-2.5-flash", "gemini", EDIT).is_none());
        assert!(registry.ensure("gemini-2.5-flash", "dryrun", VISION).is_none());
        assert!(registry.ensure("missing", "gemini", VISION).is_none());
    }
}

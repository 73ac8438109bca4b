use super::registry::{ModelRegistry, ModelSpec};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| ModelRegistry::new(None)),
        }
    }

    pub fn select(
        &self,
        requested: Option<&str>,
        service: &str,
        capability: &str,
    ) -> Result<ModelSelection, String> {
        let (fallback_reason, requested_text) = if let Some(requested_value) = requested {
            if let Some(model) = self.registry.ensure(requested_value, service, capability) {
                return Ok(ModelSelection {
                    model,
                    requested: Some(requested_value.to_string()),
                    fallback_reason: None,
                });
            }
            (
                Some(format!(
                    "Requested model '{requested_value}' unavailable for {service} capability '{capability}'."
                )),
                Some(requested_value.to_string()),
            )
        } else {
            (Some("No model specified; using default.".to_string()), None)
        };

        let candidates = self.registry.by_capability(service, capability);
        let Some(model) = candidates.first().cloned() else {
            return Err(format!(
                "No {service} models available for capability '{capability}'."
            ));
        };
        Ok(ModelSelection {
            model,
            requested: requested_text,
            fallback_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use indexmap::IndexMap;

    use crate::models::{ModelRegistry, ModelSelector, ModelSpec, CHAT, VISION};

    fn vision_model(name: &str) -> ModelSpec {
        ModelSpec {
            name: name.to_string(),
            service: "gemini".to_string(),
            capabilities: vec![VISION.to_string()],
        }
    }

    #[test]
    fn model_selector_falls_back_when_requested_model_unavailable() {
        let mut models = IndexMap::new();
        models.insert("vision-fallback".to_string(), vision_model("vision-fallback"));
        let selection = ModelSelector::new(Some(ModelRegistry::new(Some(models))))
            .select(Some("missing"), "gemini", VISION)
            .unwrap();
        assert_eq!(selection.model.name, "vision-fallback");
        assert_eq!(selection.requested.as_deref(), Some("missing"));
        assert_eq!(
            selection.fallback_reason.as_deref(),
            Some("Requested model 'missing' unavailable for gemini capability 'vision'.")
        );
    }

    #[test]
    fn model_selector_no_request_uses_default_with_explanation() {
        let mut models = IndexMap::new();
        models.insert("vision-default".to_string(), vision_model("vision-default"));
        let selection = ModelSelector::new(Some(ModelRegistry::new(Some(models))))
            .select(None, "gemini", VISION)
            .unwrap();
        assert_eq!(selection.model.name, "vision-default");
        assert_eq!(
            selection.fallback_reason.as_deref(),
            Some("No model specified; using default.")
        );
    }

    #[test]
    fn model_selector_raises_when_no_models_for_capability() {
        let mut models = IndexMap::new();
        models.insert("vision-only".to_string(), vision_model("vision-only"));
        let err = ModelSelector::new(Some(ModelRegistry::new(Some(models))))
            .select(Some("vision-only"), "gemini", CHAT)
            .err()
            .unwrap_or_default();
        assert_eq!(err, "No gemini models available for capability 'chat'.");
    }
}

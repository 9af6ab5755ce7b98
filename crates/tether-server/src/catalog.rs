use tether_core::completion::{now_unix, ModelCard, ModelList};

/// Models the upstream serves, with the provider each one is routed to.
const DEFAULT_MODELS: &[(&str, &str)] = &[
    ("o4-mini", "openai"),
    ("gpt-4.1", "openai"),
    ("gpt-4.1-mini", "openai"),
    ("o3-mini", "openai"),
    ("gpt-4o", "openai"),
    ("gpt-4o-mini", "openai"),
    ("gemini-2.5-pro-preview-03-25", "gemini"),
    ("gemini-2.0-flash", "gemini"),
    ("claude-3-7-sonnet-latest", "claude"),
    ("claude-3-5-haiku-latest", "claude"),
];

/// Model → provider table. Listing order is insertion order.
#[derive(Clone, Debug)]
pub struct ModelCatalog {
    entries: Vec<(String, String)>,
    created: i64,
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::new(DEFAULT_MODELS.iter().map(|(m, p)| (m.to_string(), p.to_string())))
    }
}

impl ModelCatalog {
    pub fn new(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
            created: now_unix(),
        }
    }

    pub fn provider_for(&self, model: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(m, _)| m == model)
            .map(|(_, p)| p.as_str())
    }

    pub fn models(&self) -> ModelList {
        ModelList::new(
            self.entries
                .iter()
                .map(|(model, provider)| ModelCard {
                    id: model.clone(),
                    object: "model".into(),
                    created: self.created,
                    owned_by: provider.clone(),
                })
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

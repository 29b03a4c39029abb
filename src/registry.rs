use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::Arc;

use crate::providers::base::Completer;

/// Immutable model-id lookup, constructed once at startup and passed by
/// reference to every component that resolves a model id.
pub struct Registry {
    completers: HashMap<String, Arc<dyn Completer>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            completers: HashMap::new(),
        }
    }

    /// The completer registered for a model id. Unknown ids are a client
    /// error.
    pub fn completer(&self, model: &str) -> Result<Arc<dyn Completer>> {
        self.completers
            .get(model)
            .cloned()
            .ok_or_else(|| anyhow!("unknown model: {}", model))
    }

    pub fn models(&self) -> Vec<&str> {
        self.completers.keys().map(String::as_str).collect()
    }
}

pub struct RegistryBuilder {
    completers: HashMap<String, Arc<dyn Completer>>,
}

impl RegistryBuilder {
    pub fn completer<S: Into<String>>(mut self, model: S, completer: Arc<dyn Completer>) -> Self {
        self.completers.insert(model.into(), completer);
        self
    }

    pub fn build(self) -> Registry {
        Registry {
            completers: self.completers,
        }
    }
}

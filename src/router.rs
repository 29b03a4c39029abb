//! Dispatch across multiple completers, exposed as completers themselves so
//! routing composes with the tool loop and the outbound emitters.

pub mod auto;
pub mod random;

use std::sync::Arc;

use crate::providers::base::{Completer, Effort, Verbosity};

/// A named dispatch target with its own backend and default options.
#[derive(Clone)]
pub struct Route {
    pub name: String,
    pub description: String,

    pub completer: Arc<dyn Completer>,
    pub effort: Option<Effort>,
    pub verbosity: Option<Verbosity>,
}

impl Route {
    pub fn new<N, D>(name: N, description: D, completer: Arc<dyn Completer>) -> Self
    where
        N: Into<String>,
        D: Into<String>,
    {
        Self {
            name: name.into(),
            description: description.into(),
            completer,
            effort: None,
            verbosity: None,
        }
    }

    pub fn with_effort(mut self, effort: Effort) -> Self {
        self.effort = Some(effort);
        self
    }

    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = Some(verbosity);
        self
    }
}

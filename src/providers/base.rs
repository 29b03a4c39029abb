use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::completion::Completion;
use crate::models::message::Message;
use crate::models::tool::{Schema, Tool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effort {
    Minimal,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionFormat {
    Json,
}

/// Shared request options, translated by each adapter into its backend's
/// field names and nesting. Options a backend cannot express are dropped,
/// never miscoded.
#[derive(Debug, Clone, Default)]
pub struct CompletionOptions {
    pub effort: Option<Effort>,
    pub verbosity: Option<Verbosity>,

    pub stop: Vec<String>,
    pub tools: Vec<Tool>,

    pub max_tokens: Option<i32>,
    pub temperature: Option<f32>,

    pub format: Option<CompletionFormat>,
    pub schema: Option<Schema>,
}

/// Invoked synchronously, in order, once per delta, before `complete`
/// returns. An error aborts the underlying backend call and propagates
/// from `complete`.
pub type StreamFn<'a> = dyn FnMut(Completion) -> Result<()> + Send + 'a;

/// The one capability every backend adapter, router and the tool loop expose.
///
/// The returned value is always the fully accumulated completion, whether or
/// not a stream handler was supplied. Cancellation is by dropping the future:
/// the only suspension points are backend reads, and no handler call happens
/// after a drop.
#[async_trait]
pub trait Completer: Send + Sync {
    async fn complete(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
        handler: Option<&mut StreamFn<'_>>,
    ) -> Result<Completion>;
}

impl std::fmt::Debug for dyn Completer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Completer")
    }
}

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::Mutex;

use crate::models::completion::{Completion, CompletionAccumulator, CompletionReason};
use crate::models::message::Message;
use crate::providers::base::{Completer, CompletionOptions, StreamFn};

/// A mock completer that replays pre-configured turns for testing.
///
/// Each turn is a sequence of deltas. With a stream handler attached the
/// deltas are replayed one by one; either way the accumulated completion
/// is returned.
pub struct MockCompleter {
    turns: Arc<Mutex<Vec<Vec<Completion>>>>,
    pub calls: Arc<Mutex<Vec<Vec<Message>>>>,
    pub options: Arc<Mutex<Vec<CompletionOptions>>>,
}

impl MockCompleter {
    /// A mock whose turns each stream a single whole completion.
    pub fn new(completions: Vec<Completion>) -> Self {
        Self::with_turns(completions.into_iter().map(|c| vec![c]).collect())
    }

    pub fn with_turns(turns: Vec<Vec<Completion>>) -> Self {
        Self {
            turns: Arc::new(Mutex::new(turns)),
            calls: Arc::new(Mutex::new(Vec::new())),
            options: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A turn consisting of a single plain text reply.
    pub fn text_turn(text: &str) -> Completion {
        Completion {
            id: "mock".to_string(),
            model: "mock".to_string(),
            reason: Some(CompletionReason::Stop),
            message: Some(Message::assistant().with_text(text)),
            ..Default::default()
        }
    }
}

#[async_trait]
impl Completer for MockCompleter {
    async fn complete(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
        handler: Option<&mut StreamFn<'_>>,
    ) -> Result<Completion> {
        self.calls.lock().unwrap().push(messages.to_vec());
        self.options.lock().unwrap().push(options.clone());

        let deltas = {
            let mut turns = self.turns.lock().unwrap();
            if turns.is_empty() {
                vec![Self::text_turn("")]
            } else {
                turns.remove(0)
            }
        };

        let mut acc = CompletionAccumulator::new();

        match handler {
            Some(handler) => {
                for delta in deltas {
                    acc.add(&delta);
                    handler(delta)?;
                }
            }
            None => {
                for delta in &deltas {
                    acc.add(delta);
                }
            }
        }

        Ok(acc.result())
    }
}

use anyhow::{bail, Result};
use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;

use super::Route;
use crate::models::completion::Completion;
use crate::models::message::Message;
use crate::providers::base::{Completer, CompletionOptions, StreamFn};

/// Picks uniformly at random among the configured routes' completers on
/// every call. No rotation, no weighting, no affinity.
pub struct RandomCompleter {
    completers: Vec<Arc<dyn Completer>>,
}

impl RandomCompleter {
    pub fn new(routes: Vec<Route>) -> Result<Self> {
        if routes.is_empty() {
            bail!("no routes configured");
        }

        Ok(Self {
            completers: routes.into_iter().map(|r| r.completer).collect(),
        })
    }
}

#[async_trait]
impl Completer for RandomCompleter {
    async fn complete(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
        handler: Option<&mut StreamFn<'_>>,
    ) -> Result<Completion> {
        let index = rand::thread_rng().gen_range(0..self.completers.len());

        self.completers[index]
            .complete(messages, options, handler)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::MockCompleter;

    #[tokio::test]
    async fn test_every_call_lands_on_a_configured_route() -> Result<()> {
        let a = Arc::new(MockCompleter::with_turns(vec![]));
        let b = Arc::new(MockCompleter::with_turns(vec![]));

        let router = RandomCompleter::new(vec![
            Route::new("a", "first", a.clone()),
            Route::new("b", "second", b.clone()),
        ])?;

        let messages = vec![Message::user().with_text("hi")];

        for _ in 0..20 {
            router
                .complete(&messages, &CompletionOptions::default(), None)
                .await?;
        }

        let total = a.calls.lock().unwrap().len() + b.calls.lock().unwrap().len();
        assert_eq!(total, 20);

        Ok(())
    }

    #[test]
    fn test_no_routes_is_an_error() {
        assert!(RandomCompleter::new(vec![]).is_err());
    }
}

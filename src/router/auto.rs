use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use indoc::formatdoc;
use serde::Deserialize;
use serde_json::json;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::info;

use super::Route;
use crate::models::completion::Completion;
use crate::models::message::{Message, Role};
use crate::models::tool::Schema;
use crate::providers::base::{Completer, CompletionOptions, StreamFn};

/// Picks a route by asking a router model, then delegates.
///
/// The pick is one extra non-streamed, schema-constrained completion; the
/// answer is matched against route names case-insensitively. The literal
/// `other` falls back to the first configured route; any other unrecognized
/// name is a hard error.
pub struct AutoCompleter {
    completer: Arc<dyn Completer>,
    routes: Vec<Route>,
}

#[derive(Deserialize)]
struct RouterResponse {
    route: String,
}

impl AutoCompleter {
    pub fn new(completer: Arc<dyn Completer>, routes: Vec<Route>) -> Result<Self> {
        if routes.is_empty() {
            bail!("no routes configured");
        }

        Ok(Self { completer, routes })
    }

    async fn determine_route(&self, candidates: &[Message]) -> Result<&Route> {
        let instructions = formatdoc! {"
            You are a request router. Read the conversation and select the route
            that best matches the user's intent.

            {routes}

            Answer with the name of exactly one route. If no route fits, answer
            with the literal value \"other\".",
            routes = routes_xml(&self.routes),
        };

        let mut messages = vec![Message::system().with_text(instructions)];

        for message in candidates {
            if message.role == Role::System {
                continue;
            }

            messages.push(message.clone());
        }

        let options = CompletionOptions {
            schema: Some(Schema {
                name: "router_response".to_string(),
                description: None,
                schema: json!({
                    "type": "object",
                    "properties": {
                        "route": {
                            "type": "string",
                            "description": "The name of the selected route",
                        },
                    },
                    "required": ["route"],
                    "additionalProperties": false,
                }),
                strict: None,
            }),
            ..Default::default()
        };

        let completion = self.completer.complete(&messages, &options, None).await?;

        let text = completion
            .message
            .as_ref()
            .map(Message::text)
            .unwrap_or_default();

        let result: RouterResponse =
            serde_json::from_str(&text).context("failed to parse router response")?;

        if let Some(route) = self
            .routes
            .iter()
            .find(|r| r.name.eq_ignore_ascii_case(&result.route))
        {
            return Ok(route);
        }

        if result.route.eq_ignore_ascii_case("other") {
            return Ok(&self.routes[0]);
        }

        Err(anyhow!("route {:?} not found", result.route))
    }
}

#[async_trait]
impl Completer for AutoCompleter {
    async fn complete(
        &self,
        messages: &[Message],
        options: &CompletionOptions,
        handler: Option<&mut StreamFn<'_>>,
    ) -> Result<Completion> {
        let route = self.determine_route(messages).await?;

        info!(route = %route.name, "selected route");

        let mut options = options.clone();

        if let Some(effort) = route.effort {
            options.effort = Some(effort);
        }

        if let Some(verbosity) = route.verbosity {
            options.verbosity = Some(verbosity);
        }

        route.completer.complete(messages, &options, handler).await
    }
}

fn routes_xml(routes: &[Route]) -> String {
    let mut result = String::from("<routes>\n");

    for route in routes {
        let _ = writeln!(
            result,
            "  <route name=\"{}\">{}</route>",
            route.name, route.description
        );
    }

    result.push_str("</routes>");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::completion::CompletionReason;
    use crate::providers::base::Effort;
    use crate::providers::mock::MockCompleter;

    fn router_answer(route: &str) -> Completion {
        Completion {
            id: "router".to_string(),
            model: "router".to_string(),
            reason: Some(CompletionReason::Stop),
            message: Some(Message::assistant().with_text(format!("{{\"route\":\"{route}\"}}"))),
            ..Default::default()
        }
    }

    fn routes(support: Arc<MockCompleter>, billing: Arc<MockCompleter>) -> Vec<Route> {
        vec![
            Route::new("billing", "Invoices and payments", billing),
            Route::new("support", "Product help and troubleshooting", support)
                .with_effort(Effort::Low),
        ]
    }

    #[tokio::test]
    async fn test_route_match_is_case_insensitive() -> Result<()> {
        let support = Arc::new(MockCompleter::new(vec![MockCompleter::text_turn(
            "support here",
        )]));
        let billing = Arc::new(MockCompleter::new(vec![]));

        let router = Arc::new(MockCompleter::new(vec![router_answer("Support")]));

        let auto = AutoCompleter::new(router, routes(support.clone(), billing.clone()))?;

        let messages = vec![Message::user().with_text("my app crashes")];
        let completion = auto
            .complete(&messages, &CompletionOptions::default(), None)
            .await?;

        assert_eq!(completion.message.unwrap().text(), "support here");
        assert_eq!(support.calls.lock().unwrap().len(), 1);
        assert_eq!(billing.calls.lock().unwrap().len(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_other_falls_back_to_first_route() -> Result<()> {
        let support = Arc::new(MockCompleter::new(vec![]));
        let billing = Arc::new(MockCompleter::new(vec![MockCompleter::text_turn(
            "billing here",
        )]));

        let router = Arc::new(MockCompleter::new(vec![router_answer("other")]));

        let auto = AutoCompleter::new(router, routes(support, billing.clone()))?;

        let messages = vec![Message::user().with_text("tell me a joke")];
        let completion = auto
            .complete(&messages, &CompletionOptions::default(), None)
            .await?;

        assert_eq!(completion.message.unwrap().text(), "billing here");

        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_route_is_a_hard_error() -> Result<()> {
        let support = Arc::new(MockCompleter::new(vec![]));
        let billing = Arc::new(MockCompleter::new(vec![]));

        let router = Arc::new(MockCompleter::new(vec![router_answer("unknown")]));

        let auto = AutoCompleter::new(router, routes(support, billing))?;

        let messages = vec![Message::user().with_text("hello")];
        let result = auto
            .complete(&messages, &CompletionOptions::default(), None)
            .await;

        assert!(result.unwrap_err().to_string().contains("not found"));

        Ok(())
    }

    #[tokio::test]
    async fn test_route_overrides_merge_into_options() -> Result<()> {
        let support = Arc::new(MockCompleter::new(vec![MockCompleter::text_turn("ok")]));
        let billing = Arc::new(MockCompleter::new(vec![]));

        let router = Arc::new(MockCompleter::new(vec![router_answer("support")]));

        let auto = AutoCompleter::new(router, routes(support.clone(), billing))?;

        let messages = vec![Message::user().with_text("help")];
        auto.complete(&messages, &CompletionOptions::default(), None)
            .await?;

        let forwarded = support.options.lock().unwrap();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].effort, Some(Effort::Low));

        Ok(())
    }
}

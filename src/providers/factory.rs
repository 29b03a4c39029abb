use super::{
    anthropic::AnthropicProvider, base::Completer, configs::ProviderConfig, ollama::OllamaProvider,
    openai::OpenAiProvider,
};
use anyhow::Result;
use strum_macros::EnumIter;

#[derive(EnumIter, Debug)]
pub enum ProviderType {
    OpenAi,
    Anthropic,
    Ollama,
}

pub fn get_provider(config: ProviderConfig) -> Result<Box<dyn Completer>> {
    match config {
        ProviderConfig::OpenAi(openai_config) => Ok(Box::new(OpenAiProvider::new(openai_config)?)),
        ProviderConfig::Anthropic(anthropic_config) => {
            Ok(Box::new(AnthropicProvider::new(anthropic_config)?))
        }
        ProviderConfig::Ollama(ollama_config) => Ok(Box::new(OllamaProvider::new(ollama_config)?)),
    }
}

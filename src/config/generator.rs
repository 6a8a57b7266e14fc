// src/config/generator.rs
use serde::{Deserialize, Serialize};
use std::env;

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_provider() -> String {
    "openai".to_string()
}
fn default_max_chars() -> usize {
    280
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    #[serde(default)]
    pub enabled: bool,
    /// "openai" (case-insensitive)
    #[serde(default = "default_provider")]
    pub provider: String,
    /// "ENV" means: read from OPENAI_API_KEY
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Upper bound for a generated reply.
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    /// Optional persona prepended to the system prompt.
    #[serde(default)]
    pub persona: Option<String>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: default_provider(),
            api_key: String::new(),
            model: default_model(),
            max_chars: default_max_chars(),
            persona: None,
        }
    }
}

impl GeneratorConfig {
    /// Normalize provider and resolve an `"ENV"` key.
    pub fn resolved(mut self) -> anyhow::Result<Self> {
        self.provider = self.provider.to_lowercase();

        if self.api_key.trim().eq_ignore_ascii_case("env") {
            self.api_key = match self.provider.as_str() {
                "openai" => env::var("OPENAI_API_KEY")
                    .map_err(|_| anyhow::anyhow!("Missing OPENAI_API_KEY env var"))?,
                other => anyhow::bail!("Unsupported provider in config: {other}"),
            };
        }

        if self.max_chars == 0 {
            self.max_chars = default_max_chars();
        }
        Ok(self)
    }
}

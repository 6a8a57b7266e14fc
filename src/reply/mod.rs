//! Reply generation: generator abstraction plus the simple generators used
//! when no model is configured.

pub mod openai;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::GeneratorConfig;
use crate::entities::{parse_hashtags, parse_mentions};
use crate::types::ItemDetails;

pub use openai::OpenAiReplyGenerator;

/// Metadata handed to the generator alongside the post text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyContext {
    pub author: String,
    pub hashtags: Vec<String>,
    pub mentions: Vec<String>,
}

/// Outcome of one generation call. `success == false` carries `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedReply {
    pub success: bool,
    pub text: String,
    pub error: Option<String>,
}

impl GeneratedReply {
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            success: true,
            text: text.into(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            text: String::new(),
            error: Some(error.into()),
        }
    }
}

pub trait ReplyGenerator: Send + Sync {
    fn generate<'a>(
        &'a self,
        text: &'a str,
        context: &'a ReplyContext,
    ) -> Pin<Box<dyn Future<Output = GeneratedReply> + Send + 'a>>;

    /// Provider name for diagnostics.
    fn provider_name(&self) -> &'static str;
}

pub type DynReplyGenerator = Arc<dyn ReplyGenerator>;

/// Always fails; used when generation is switched off.
pub struct DisabledGenerator;

impl ReplyGenerator for DisabledGenerator {
    fn generate<'a>(
        &'a self,
        _text: &'a str,
        _context: &'a ReplyContext,
    ) -> Pin<Box<dyn Future<Output = GeneratedReply> + Send + 'a>> {
        Box::pin(async { GeneratedReply::failed("reply generation disabled") })
    }

    fn provider_name(&self) -> &'static str {
        "disabled"
    }
}

/// Returns the same reply every time; `{author}` is substituted.
#[derive(Debug, Clone)]
pub struct FixedGenerator {
    pub template: String,
}

impl FixedGenerator {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }
}

impl ReplyGenerator for FixedGenerator {
    fn generate<'a>(
        &'a self,
        _text: &'a str,
        context: &'a ReplyContext,
    ) -> Pin<Box<dyn Future<Output = GeneratedReply> + Send + 'a>> {
        let out = self.template.replace("{author}", &context.author);
        Box::pin(async move { GeneratedReply::ok(out) })
    }

    fn provider_name(&self) -> &'static str {
        "fixed"
    }
}

/// Pick a generator from config and environment:
///
/// * `AI_TEST_MODE=mock` gives a [`FixedGenerator`].
/// * A disabled config gives a [`DisabledGenerator`].
/// * Otherwise the configured provider (only `openai` for now).
pub fn build_generator(cfg: &GeneratorConfig) -> anyhow::Result<DynReplyGenerator> {
    if std::env::var("AI_TEST_MODE")
        .map(|v| v == "mock")
        .unwrap_or(false)
    {
        tracing::info!(target: "dispatch", "AI_TEST_MODE=mock, using fixed replies");
        return Ok(Arc::new(FixedGenerator::new("Thanks for sharing, @{author}!")));
    }
    if !cfg.enabled {
        return Ok(Arc::new(DisabledGenerator));
    }
    let cfg = cfg.clone().resolved()?;
    match cfg.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAiReplyGenerator::new(&cfg)?)),
        other => anyhow::bail!("unsupported reply provider: {other}"),
    }
}

/// Context for a post. Entities missing on the platform side are parsed
/// from the text.
pub fn reply_context(details: &ItemDetails) -> ReplyContext {
    let hashtags = if details.entities.hashtags.is_empty() {
        parse_hashtags(&details.text)
    } else {
        details.entities.hashtags.clone()
    };
    let mentions = if details.entities.mentions.is_empty() {
        parse_mentions(&details.text)
    } else {
        details.entities.mentions.clone()
    };
    ReplyContext {
        author: details
            .author_handle
            .clone()
            .unwrap_or_else(|| details.author_id.clone()),
        hashtags,
        mentions,
    }
}

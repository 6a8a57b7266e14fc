//! OpenAI-backed reply generator (Chat Completions API).

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::{GeneratedReply, ReplyContext, ReplyGenerator};
use crate::config::GeneratorConfig;

const COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";

pub struct OpenAiReplyGenerator {
    http: reqwest::Client,
    api_key: String,
    model: String,
    max_chars: usize,
    persona: Option<String>,
}

impl OpenAiReplyGenerator {
    /// Expects a config already passed through [`GeneratorConfig::resolved`].
    pub fn new(cfg: &GeneratorConfig) -> anyhow::Result<Self> {
        if cfg.api_key.trim().is_empty() {
            anyhow::bail!("generator enabled but no api_key configured");
        }
        let http = reqwest::Client::builder()
            .user_agent(concat!("group-reply-relay/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(20))
            .build()
            .context("building OpenAI http client")?;
        Ok(Self {
            http,
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            max_chars: cfg.max_chars,
            persona: cfg.persona.clone(),
        })
    }

    fn system_prompt(&self) -> String {
        let mut sys = format!(
            "You write short, friendly replies to social posts. Return ONE reply of at most {} characters, no hashtags spam, no quotes. Output only the reply.",
            self.max_chars
        );
        if let Some(p) = self.persona.as_deref().filter(|p| !p.trim().is_empty()) {
            sys.push_str(" Persona: ");
            sys.push_str(p.trim());
        }
        sys
    }

    async fn generate_impl(&self, text: &str, context: &ReplyContext) -> GeneratedReply {
        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
            max_tokens: u32,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: String,
        }

        let sys = self.system_prompt();
        let user = user_prompt(text, context);
        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: &sys,
                },
                Msg {
                    role: "user",
                    content: &user,
                },
            ],
            temperature: 0.7,
            max_tokens: 120,
        };

        let resp = match self
            .http
            .post(COMPLETIONS_URL)
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return GeneratedReply::failed(format!("openai request: {e}")),
        };
        let status = resp.status();
        if !status.is_success() {
            return GeneratedReply::failed(format!("openai returned {status}"));
        }
        let body: Resp = match resp.json().await {
            Ok(b) => b,
            Err(e) => return GeneratedReply::failed(format!("openai body: {e}")),
        };
        let content = body
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or("");
        let cleaned = sanitize_reply(content, self.max_chars);
        if cleaned.is_empty() {
            GeneratedReply::failed("openai returned an empty reply")
        } else {
            GeneratedReply::ok(cleaned)
        }
    }
}

impl ReplyGenerator for OpenAiReplyGenerator {
    fn generate<'a>(
        &'a self,
        text: &'a str,
        context: &'a ReplyContext,
    ) -> Pin<Box<dyn Future<Output = GeneratedReply> + Send + 'a>> {
        Box::pin(self.generate_impl(text, context))
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }
}

fn user_prompt(text: &str, context: &ReplyContext) -> String {
    let mut out = format!("Post by @{}:\n{}", context.author, text.trim());
    if !context.hashtags.is_empty() {
        out.push_str("\nHashtags: ");
        out.push_str(&context.hashtags.join(", "));
    }
    if !context.mentions.is_empty() {
        out.push_str("\nMentions: ");
        out.push_str(&context.mentions.join(", "));
    }
    out
}

/// Single line, collapsed whitespace, surrounding quotes stripped, at most
/// `max_chars` characters.
pub fn sanitize_reply(input: &str, max_chars: usize) -> String {
    let mut out = String::with_capacity(max_chars.min(input.len()));
    let mut count = 0usize;
    let mut prev_space = false;
    let trimmed = input.trim().trim_matches(|c| c == '"' || c == '\u{201C}' || c == '\u{201D}');
    for ch in trimmed.chars() {
        let c = if ch.is_whitespace() { ' ' } else { ch };
        if c == ' ' {
            if prev_space || out.is_empty() {
                continue;
            }
            prev_space = true;
        } else {
            prev_space = false;
        }
        if count >= max_chars {
            break;
        }
        out.push(c);
        count += 1;
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_collapses_and_bounds() {
        assert_eq!(sanitize_reply("  \"Nice\n\n  take!\"  ", 280), "Nice take!");
        let long = "ab ".repeat(200);
        let s = sanitize_reply(&long, 280);
        assert!(s.chars().count() <= 280);
        assert!(!s.contains('\n'));
    }

    #[test]
    fn sanitize_counts_chars_not_bytes() {
        let s = sanitize_reply("ééééé", 3);
        assert_eq!(s, "ééé");
    }

    #[test]
    fn empty_key_is_rejected() {
        let cfg = GeneratorConfig {
            enabled: true,
            ..GeneratorConfig::default()
        };
        assert!(OpenAiReplyGenerator::new(&cfg).is_err());
    }

    #[test]
    fn prompt_carries_context() {
        let ctx = ReplyContext {
            author: "alice".into(),
            hashtags: vec!["rust".into()],
            mentions: vec![],
        };
        let p = user_prompt("hello", &ctx);
        assert!(p.starts_with("Post by @alice:"));
        assert!(p.contains("Hashtags: rust"));
        assert!(!p.contains("Mentions"));
    }
}

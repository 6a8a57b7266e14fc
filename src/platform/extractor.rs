// src/platform/extractor.rs
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use super::LinkExtractor;
use crate::entities::complete_link;
use crate::error::ClientError;
use crate::types::ExtractedLink;

/// Talks to the page-scraping sidecar: `POST {base}/extract {"target": ..}`.
pub struct HttpLinkExtractor {
    http: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ExtractResp {
    #[serde(default)]
    items: Vec<ExtractedLink>,
    #[serde(default)]
    error: Option<String>,
    /// Set by the sidecar when the page bounced to a login wall.
    #[serde(default)]
    auth_required: bool,
}

impl HttpLinkExtractor {
    pub fn new(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

/// Split a sidecar response into links or a classified error.
fn interpret(body: ExtractResp) -> Result<Vec<ExtractedLink>, ClientError> {
    if body.auth_required {
        return Err(ClientError::Auth(
            body.error.unwrap_or_else(|| "login required".to_string()),
        ));
    }
    if let Some(err) = body.error {
        return Err(ClientError::Transient(err));
    }
    Ok(body.items.into_iter().filter_map(complete_link).collect())
}

#[async_trait]
impl LinkExtractor for HttpLinkExtractor {
    async fn extract(&self, target_locator: &str) -> Result<Vec<ExtractedLink>, ClientError> {
        let resp = self
            .http
            .post(format!("{}/extract", self.base_url))
            .json(&serde_json::json!({ "target": target_locator }))
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ClientError::Auth(format!("extractor returned {status}")));
        }
        if !status.is_success() {
            return Err(ClientError::Transient(format!("extractor returned {status}")));
        }
        let body: ExtractResp = resp
            .json()
            .await
            .map_err(|e| ClientError::Transient(format!("decode extractor body: {e}")))?;
        interpret(body)
    }
}

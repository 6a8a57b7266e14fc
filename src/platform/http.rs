// src/platform/http.rs
//! reqwest-backed platform session. Bearer token per account, resolved
//! from `<CREDENTIALS_REF>_TOKEN` when the session connects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;

use super::{DynPlatformClient, PlatformClient, SessionFactory};
use crate::error::ClientError;
use crate::types::{ItemDetails, PostedReply};

/// `group-a.main` -> `GROUP_A_MAIN_TOKEN`
pub fn token_env_var(credentials_ref: &str) -> String {
    let mut out: String = credentials_ref
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    out.push_str("_TOKEN");
    out
}

pub struct HttpPlatformClient {
    http: Client,
    base_url: String,
    credentials_ref: String,
    token: RwLock<Option<String>>,
    user_id: RwLock<Option<String>>,
    authenticated: AtomicBool,
}

#[derive(Deserialize)]
struct MeResp {
    id: String,
}

impl HttpPlatformClient {
    pub fn new(http: Client, base_url: impl Into<String>, credentials_ref: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials_ref: credentials_ref.into(),
            token: RwLock::new(None),
            user_id: RwLock::new(None),
            authenticated: AtomicBool::new(false),
        }
    }

    fn bearer(&self) -> Result<String, ClientError> {
        self.token
            .read()
            .expect("token lock poisoned")
            .clone()
            .ok_or_else(|| ClientError::Auth("session not connected".into()))
    }

    /// Maps non-2xx statuses; 401/403 also drop the authenticated flag.
    fn check(&self, resp: Response) -> Result<Response, ClientError> {
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            self.authenticated.store(false, Ordering::SeqCst);
            return Err(ClientError::Auth(format!("platform returned {status}")));
        }
        if !status.is_success() {
            return Err(ClientError::Transient(format!("platform returned {status}")));
        }
        Ok(resp)
    }
}

#[async_trait]
impl PlatformClient for HttpPlatformClient {
    async fn connect(&self) -> Result<(), ClientError> {
        let var = token_env_var(&self.credentials_ref);
        let token = std::env::var(&var)
            .map_err(|_| ClientError::Auth(format!("missing {var} env var")))?;

        let resp = self
            .http
            .get(format!("{}/me", self.base_url))
            .bearer_auth(&token)
            .send()
            .await?;
        let me: MeResp = self
            .check(resp)?
            .json()
            .await
            .map_err(|e| ClientError::Transient(format!("decode /me: {e}")))?;

        *self.token.write().expect("token lock poisoned") = Some(token);
        *self.user_id.write().expect("user lock poisoned") = Some(me.id);
        self.authenticated.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn reconnect(&self) -> bool {
        self.authenticated.store(false, Ordering::SeqCst);
        match self.connect().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(credentials = %self.credentials_ref, error = %e, "reconnect failed");
                false
            }
        }
    }

    async fn disconnect(&self) {
        self.authenticated.store(false, Ordering::SeqCst);
        *self.token.write().expect("token lock poisoned") = None;
    }

    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    fn user_id(&self) -> Option<String> {
        self.user_id.read().expect("user lock poisoned").clone()
    }

    async fn get_item_details(&self, id: &str) -> Result<ItemDetails, ClientError> {
        let resp = self
            .http
            .get(format!("{}/items/{id}", self.base_url))
            .bearer_auth(self.bearer()?)
            .send()
            .await?;
        self.check(resp)?
            .json()
            .await
            .map_err(|e| ClientError::Transient(format!("decode item {id}: {e}")))
    }

    async fn post_reply(&self, text: &str, target_id: &str) -> Result<PostedReply, ClientError> {
        let body = serde_json::json!({ "text": text });
        let resp = self
            .http
            .post(format!("{}/items/{target_id}/replies", self.base_url))
            .bearer_auth(self.bearer()?)
            .json(&body)
            .send()
            .await?;
        self.check(resp)?
            .json()
            .await
            .map_err(|e| ClientError::Transient(format!("decode reply: {e}")))
    }
}

/// Opens one [`HttpPlatformClient`] per credentials reference, sharing the
/// connection pool.
#[derive(Clone)]
pub struct HttpSessionFactory {
    http: Client,
    base_url: String,
}

impl HttpSessionFactory {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent("group-reply-relay/0.1")
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    pub fn client(&self) -> Client {
        self.http.clone()
    }
}

impl SessionFactory for HttpSessionFactory {
    fn open(&self, credentials_ref: &str) -> DynPlatformClient {
        Arc::new(HttpPlatformClient::new(
            self.http.clone(),
            self.base_url.clone(),
            credentials_ref,
        ))
    }
}

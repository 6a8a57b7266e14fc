// src/platform/mod.rs
//! Collaborator seams: link extraction and the platform API session.

pub mod extractor;
pub mod http;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ClientError;
use crate::types::{ExtractedLink, ItemDetails, PostedReply};

/// Scrapes a group/notification page and returns the post links found on it.
/// Must be safe to call repeatedly.
#[async_trait]
pub trait LinkExtractor: Send + Sync {
    async fn extract(&self, target_locator: &str) -> Result<Vec<ExtractedLink>, ClientError>;
}

/// One authenticated account session on the platform.
#[async_trait]
pub trait PlatformClient: Send + Sync {
    /// Establish the session.
    async fn connect(&self) -> Result<(), ClientError>;

    /// Single re-authentication attempt after the platform rejected the session.
    async fn reconnect(&self) -> bool;

    async fn disconnect(&self);

    fn is_authenticated(&self) -> bool;

    /// Platform user id of the account, known once connected.
    fn user_id(&self) -> Option<String>;

    async fn get_item_details(&self, id: &str) -> Result<ItemDetails, ClientError>;

    async fn post_reply(&self, text: &str, target_id: &str) -> Result<PostedReply, ClientError>;
}

pub type DynPlatformClient = Arc<dyn PlatformClient>;

/// Builds sessions from a credentials reference (listener and worker accounts).
pub trait SessionFactory: Send + Sync {
    fn open(&self, credentials_ref: &str) -> DynPlatformClient;
}

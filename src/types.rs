// src/types.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default priority for sources that do not set one (lower = more important).
pub const DEFAULT_PRIORITY: u32 = 999;

/// Origin of a discovered item, attached by the aggregator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTag {
    pub source_id: String,
    pub source_name: String,
    pub priority: u32,
}

/// Candidate link as returned by the extraction service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedLink {
    pub id: String,
    pub locator: String,
    #[serde(default)]
    pub origin_handle: String,
}

/// A post that passed the dedup filter of one listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredItem {
    pub id: String,
    pub locator: String,
    pub origin_handle: String,
    pub discovered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_tag: Option<SourceTag>,
}

impl DiscoveredItem {
    pub fn from_link(link: ExtractedLink, discovered_at: DateTime<Utc>) -> Self {
        Self {
            id: link.id,
            locator: link.locator,
            origin_handle: link.origin_handle,
            discovered_at,
            source_tag: None,
        }
    }

    pub fn tagged(mut self, tag: SourceTag) -> Self {
        self.source_tag = Some(tag);
        self
    }
}

/// Entities attached to a post by the platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemEntities {
    #[serde(default)]
    pub hashtags: Vec<String>,
    #[serde(default)]
    pub mentions: Vec<String>,
}

/// Full post details fetched right before a reply is generated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDetails {
    pub text: String,
    pub author_id: String,
    #[serde(default)]
    pub author_handle: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub entities: ItemEntities,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostedReply {
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    Error,
}

/// A worker identity in the dispatch pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerAccount {
    pub id: String,
    pub status: WorkerStatus,
    pub last_used_at: Option<DateTime<Utc>>,
    pub tasks_assigned: u64,
    pub replies_sent: u64,
    pub error_count: u32,
    /// Tasks assigned to this worker that have not terminated yet.
    pub outstanding_load: u32,
}

impl WorkerAccount {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: WorkerStatus::Active,
            last_used_at: None,
            tasks_assigned: 0,
            replies_sent: 0,
            error_count: 0,
            outstanding_load: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == WorkerStatus::Active
    }
}

/// One unit of dispatch work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub item: DiscoveredItem,
    pub worker_id: String,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerPhase {
    Stopped,
    Starting,
    Listening,
    Reconnecting,
    /// Reconnect failed; needs an external restart.
    Failed,
}

/// Runtime record of one source listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceListenerState {
    pub phase: ListenerPhase,
    pub is_listening: bool,
    pub polling_interval_ms: u64,
    pub checks: u64,
    pub items_found: u64,
    pub errors: u64,
    pub last_check_at: Option<DateTime<Utc>>,
    pub dedup_size: usize,
}

// src/events.rs
//! Typed events emitted by each component. Every component owns one
//! outbound channel; nothing reaches into another component's state.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::{DiscoveredItem, SourceTag};

/// Capacity of the listener -> aggregator relay channel.
pub const LISTENER_CHANNEL_CAPACITY: usize = 256;
/// Capacity of the aggregator and dispatcher outbound channels.
pub const COMPONENT_CHANNEL_CAPACITY: usize = 256;
/// Capacity of the facade broadcast stream.
pub const SYSTEM_BROADCAST_CAPACITY: usize = 1024;

/// Emitted by a single [`crate::listener::SourceListener`]. Each event
/// carries the source's tag so it can be relayed after the source is gone.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ListenerEvent {
    /// Never emitted with an empty batch.
    ItemsFound {
        source: SourceTag,
        items: Vec<DiscoveredItem>,
    },
    CheckCompleted {
        source: SourceTag,
        found: usize,
        at: DateTime<Utc>,
    },
    CheckError {
        source: SourceTag,
        error: String,
    },
    AuthRecovered {
        source: SourceTag,
    },
    AuthFailed {
        source: SourceTag,
        error: String,
    },
}

impl ListenerEvent {
    pub fn source(&self) -> &SourceTag {
        match self {
            Self::ItemsFound { source, .. }
            | Self::CheckCompleted { source, .. }
            | Self::CheckError { source, .. }
            | Self::AuthRecovered { source }
            | Self::AuthFailed { source, .. } => source,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source().source_id
    }
}

/// Per-source start failure reported in [`AggregatorEvent::Started`].
#[derive(Debug, Clone, Serialize)]
pub struct StartFailure {
    pub source_id: String,
    pub error: String,
}

/// Emitted by [`crate::aggregator::ListenerAggregator`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AggregatorEvent {
    Started {
        total: usize,
        active: usize,
        failed: Vec<StartFailure>,
    },
    /// Items carry `source_tag`.
    ItemsFound {
        source: SourceTag,
        items: Vec<DiscoveredItem>,
    },
    GroupCheckCompleted {
        source_id: String,
        source_name: String,
        found: usize,
        at: DateTime<Utc>,
    },
    GroupCheckError {
        source_id: String,
        source_name: String,
        error: String,
    },
    GroupAuthRecovered {
        source_id: String,
        source_name: String,
    },
    GroupAuthFailed {
        source_id: String,
        source_name: String,
        error: String,
    },
    SourceAdded {
        source_id: String,
    },
    SourceRemoved {
        source_id: String,
    },
    SourceRestarted {
        source_id: String,
        active: bool,
    },
    Stopped,
}

/// Emitted by [`crate::assigner::AccountAssigner`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssignerEvent {
    Initialized {
        active: Vec<String>,
        failed: Vec<String>,
    },
    TaskAssigned {
        worker_id: String,
        item_id: String,
    },
    ItemDropped {
        item_id: String,
        reason: String,
    },
    TaskCompleted {
        worker_id: String,
        item_id: String,
        reply_text: String,
        reply_id: String,
    },
    TaskSkipped {
        worker_id: String,
        item_id: String,
        reason: String,
    },
    TaskRetried {
        from_worker: String,
        to_worker: String,
        item_id: String,
        retry_count: u32,
    },
    TaskFailed {
        worker_id: String,
        item: DiscoveredItem,
        error: String,
        retry_count: u32,
    },
    AccountError {
        worker_id: String,
        error_count: u32,
    },
}

/// Everything the facade republishes to observers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "origin", content = "event", rename_all = "snake_case")]
pub enum SystemEvent {
    Listener(AggregatorEvent),
    Dispatch(AssignerEvent),
    HealthChanged {
        level: crate::system::HealthLevel,
        score: u32,
    },
}

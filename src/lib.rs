// src/lib.rs
//! Group reply relay: polls messaging-group pages for shared post links,
//! deduplicates them per source, and dispatches each new post to a pool of
//! worker accounts that generate and post a reply.

pub mod aggregator;
pub mod api;
pub mod assigner;
pub mod config;
pub mod dedup;
pub mod entities;
pub mod error;
pub mod events;
pub mod listener;
pub mod metrics;
pub mod notify;
pub mod platform;
pub mod reply;
pub mod system;
pub mod types;

// ---- Re-exports for stable public API ----
pub use crate::aggregator::ListenerAggregator;
pub use crate::api::router;
pub use crate::assigner::AccountAssigner;
pub use crate::config::AppConfig;
pub use crate::error::{ClientError, RelayError, Result};
pub use crate::events::SystemEvent;
pub use crate::listener::{ListenerOptions, PollOutcome, SourceListener};
pub use crate::notify::NotifierMux;
pub use crate::system::{compute_health, HealthLevel, ReplySystem};

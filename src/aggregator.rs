//! # Listener Aggregator
//! Runs one [`SourceListener`] per configured group and fans their events
//! into a single tagged stream. Sources can be added, removed or restarted
//! without touching the others; a source that fails never blocks its
//! siblings.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use crate::config::SourceConfig;
use crate::error::{RelayError, Result};
use crate::events::{
    AggregatorEvent, ListenerEvent, StartFailure, COMPONENT_CHANNEL_CAPACITY,
    LISTENER_CHANNEL_CAPACITY,
};
use crate::listener::{ListenerOptions, PollOutcome, SourceListener};
use crate::platform::{LinkExtractor, SessionFactory};
use crate::types::{ListenerPhase, SourceListenerState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Active,
    /// Start failed, or the session could not be recovered.
    Failed,
    Stopped,
    Disabled,
}

/// Per-source view returned by [`ListenerAggregator::sources_by_priority`].
#[derive(Debug, Clone, Serialize)]
pub struct SourceView {
    pub id: String,
    pub name: String,
    pub priority: u32,
    pub status: SourceStatus,
    pub last_error: Option<String>,
    pub state: SourceListenerState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggregateTotals {
    pub checks: u64,
    pub items_found: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregatorStatus {
    pub total_sources: usize,
    pub active_sources: usize,
    pub totals: AggregateTotals,
    pub sources: Vec<SourceView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartSummary {
    pub total: usize,
    pub active: usize,
    pub failed: Vec<StartFailure>,
}

struct SourceEntry {
    listener: SourceListener,
    last_error: Option<String>,
}

impl SourceEntry {
    fn status(&self) -> SourceStatus {
        if !self.listener.config().enabled {
            return SourceStatus::Disabled;
        }
        if self.listener.is_listening() {
            return SourceStatus::Active;
        }
        if self.last_error.is_some() || self.listener.state().phase == ListenerPhase::Failed {
            return SourceStatus::Failed;
        }
        SourceStatus::Stopped
    }

    fn view(&self) -> SourceView {
        let cfg = self.listener.config();
        SourceView {
            id: cfg.id.clone(),
            name: cfg.display_name().to_string(),
            priority: cfg.priority,
            status: self.status(),
            last_error: self.last_error.clone(),
            state: self.listener.state(),
        }
    }
}

pub struct ListenerAggregator {
    extractor: Arc<dyn LinkExtractor>,
    sessions: Arc<dyn SessionFactory>,
    options: ListenerOptions,
    relay_tx: mpsc::Sender<ListenerEvent>,
    out: mpsc::Sender<AggregatorEvent>,
    registry: tokio::sync::Mutex<BTreeMap<String, SourceEntry>>,
    totals: Arc<Mutex<AggregateTotals>>,
    relay: JoinHandle<()>,
}

impl ListenerAggregator {
    /// Must be called inside a Tokio runtime (spawns the relay task).
    pub fn new(
        extractor: Arc<dyn LinkExtractor>,
        sessions: Arc<dyn SessionFactory>,
        options: ListenerOptions,
    ) -> (Self, mpsc::Receiver<AggregatorEvent>) {
        let (relay_tx, relay_rx) = mpsc::channel(LISTENER_CHANNEL_CAPACITY);
        let (out, out_rx) = mpsc::channel(COMPONENT_CHANNEL_CAPACITY);
        let totals = Arc::new(Mutex::new(AggregateTotals::default()));

        let relay = tokio::spawn(relay_loop(relay_rx, out.clone(), totals.clone()));

        let me = Self {
            extractor,
            sessions,
            options,
            relay_tx,
            out,
            registry: tokio::sync::Mutex::new(BTreeMap::new()),
            totals,
            relay,
        };
        (me, out_rx)
    }

    fn build_listener(&self, cfg: SourceConfig) -> SourceListener {
        let session = self.sessions.open(cfg.credentials());
        SourceListener::new(
            cfg,
            self.extractor.clone(),
            session,
            self.options.clone(),
            self.relay_tx.clone(),
        )
    }

    async fn emit(&self, ev: AggregatorEvent) {
        if self.out.send(ev).await.is_err() {
            tracing::debug!(target: "aggregator", "event receiver gone");
        }
    }

    /// Start every enabled source concurrently. Failures are recorded per
    /// source; zero active sources is allowed.
    pub async fn start(&self, configs: Vec<SourceConfig>) -> StartSummary {
        let mut registry = self.registry.lock().await;
        let mut failed = Vec::new();
        let mut set = JoinSet::new();

        for cfg in configs.into_iter().filter(|c| c.enabled) {
            if let Err(e) = cfg.check() {
                failed.push(StartFailure {
                    source_id: cfg.id.clone(),
                    error: e.to_string(),
                });
                continue;
            }
            if registry.contains_key(&cfg.id) {
                failed.push(StartFailure {
                    source_id: cfg.id.clone(),
                    error: RelayError::DuplicateSource(cfg.id.clone()).to_string(),
                });
                continue;
            }
            let mut listener = self.build_listener(cfg);
            set.spawn(async move {
                let res = listener.start().await;
                (listener, res)
            });
        }

        let mut total = failed.len();
        while let Some(joined) = set.join_next().await {
            let (listener, res) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::error!(target: "aggregator", error = %e, "listener start task panicked");
                    total += 1;
                    continue;
                }
            };
            total += 1;
            let id = listener.id().to_string();
            let last_error = match res {
                Ok(()) => None,
                Err(e) => {
                    tracing::warn!(target: "aggregator", source_id = %id, error = %e, "source failed to start");
                    failed.push(StartFailure {
                        source_id: id.clone(),
                        error: e.to_string(),
                    });
                    Some(e.to_string())
                }
            };
            registry.insert(id, SourceEntry { listener, last_error });
        }

        let active = registry.values().filter(|e| e.listener.is_listening()).count();
        drop(registry);

        tracing::info!(target: "aggregator", total, active, failed = failed.len(), "sources started");
        self.emit(AggregatorEvent::Started {
            total,
            active,
            failed: failed.clone(),
        })
        .await;
        StartSummary { total, active, failed }
    }

    /// Stop all listeners concurrently and clear the registry.
    pub async fn stop(&self) {
        let entries = std::mem::take(&mut *self.registry.lock().await);
        let mut set = JoinSet::new();
        for (id, mut entry) in entries {
            set.spawn(async move {
                if let Err(e) = entry.listener.stop().await {
                    tracing::warn!(target: "aggregator", source_id = %id, error = %e, "stop reported an error");
                }
            });
        }
        while set.join_next().await.is_some() {}
        tracing::info!(target: "aggregator", "all sources stopped");
        self.emit(AggregatorEvent::Stopped).await;
    }

    /// Register and start one source. A disabled config is registered but
    /// not started. A start failure leaves the source registered as failed.
    pub async fn add_source(&self, config: SourceConfig) -> Result<()> {
        config.check()?;
        let mut registry = self.registry.lock().await;
        if registry.contains_key(&config.id) {
            return Err(RelayError::DuplicateSource(config.id));
        }
        let id = config.id.clone();
        let enabled = config.enabled;
        let mut listener = self.build_listener(config);

        let res = if enabled { listener.start().await } else { Ok(()) };
        let last_error = res.as_ref().err().map(|e| e.to_string());
        registry.insert(id.clone(), SourceEntry { listener, last_error });
        drop(registry);

        match res {
            Ok(()) => {
                tracing::info!(target: "aggregator", source_id = %id, enabled, "source added");
                self.emit(AggregatorEvent::SourceAdded { source_id: id }).await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn remove_source(&self, id: &str) -> Result<()> {
        let entry = self
            .registry
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| RelayError::NotFound(id.to_string()))?;
        let mut listener = entry.listener;
        if let Err(e) = listener.stop().await {
            tracing::warn!(target: "aggregator", source_id = %id, error = %e, "stop reported an error");
        }
        tracing::info!(target: "aggregator", source_id = %id, "source removed");
        self.emit(AggregatorEvent::SourceRemoved {
            source_id: id.to_string(),
        })
        .await;
        Ok(())
    }

    /// Stop then start one source in place, keeping its dedup record.
    pub async fn restart_source(&self, id: &str) -> Result<()> {
        let mut registry = self.registry.lock().await;
        let entry = registry
            .get_mut(id)
            .ok_or_else(|| RelayError::NotFound(id.to_string()))?;

        if let Err(e) = entry.listener.stop().await {
            tracing::warn!(target: "aggregator", source_id = %id, error = %e, "stop reported an error");
        }
        let res = entry.listener.start().await;
        entry.last_error = res.as_ref().err().map(|e| e.to_string());
        let active = entry.listener.is_listening();
        drop(registry);

        tracing::info!(target: "aggregator", source_id = %id, active, "source restarted");
        self.emit(AggregatorEvent::SourceRestarted {
            source_id: id.to_string(),
            active,
        })
        .await;
        res
    }

    /// Run one cycle of a source right now.
    pub async fn poll_source(&self, id: &str) -> Result<PollOutcome> {
        let registry = self.registry.lock().await;
        let entry = registry
            .get(id)
            .ok_or_else(|| RelayError::NotFound(id.to_string()))?;
        Ok(entry.listener.poll_now().await)
    }

    /// All known sources, ascending priority (lower = more important), then id.
    pub async fn sources_by_priority(&self) -> Vec<SourceView> {
        let registry = self.registry.lock().await;
        let mut views: Vec<SourceView> = registry.values().map(SourceEntry::view).collect();
        views.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        views
    }

    pub async fn status(&self) -> AggregatorStatus {
        let sources = self.sources_by_priority().await;
        let active_sources = sources
            .iter()
            .filter(|s| s.status == SourceStatus::Active)
            .count();
        AggregatorStatus {
            total_sources: sources.len(),
            active_sources,
            totals: self.totals(),
            sources,
        }
    }

    pub fn totals(&self) -> AggregateTotals {
        self.totals.lock().expect("totals mutex poisoned").clone()
    }
}

impl Drop for ListenerAggregator {
    fn drop(&mut self) {
        self.relay.abort();
    }
}

/// Tag, count and forward child events, one at a time. Events queued by a
/// source that has since been stopped or removed are still forwarded: their
/// ids are already in its dedup record.
async fn relay_loop(
    mut rx: mpsc::Receiver<ListenerEvent>,
    out: mpsc::Sender<AggregatorEvent>,
    totals: Arc<Mutex<AggregateTotals>>,
) {
    while let Some(ev) = rx.recv().await {
        let forwarded = {
            let mut t = totals.lock().expect("totals mutex poisoned");
            match ev {
                ListenerEvent::ItemsFound { source, items } => {
                    t.items_found += items.len() as u64;
                    let items = items.into_iter().map(|i| i.tagged(source.clone())).collect();
                    AggregatorEvent::ItemsFound { source, items }
                }
                ListenerEvent::CheckCompleted { source, found, at } => {
                    t.checks += 1;
                    AggregatorEvent::GroupCheckCompleted {
                        source_id: source.source_id,
                        source_name: source.source_name,
                        found,
                        at,
                    }
                }
                ListenerEvent::CheckError { source, error } => {
                    t.checks += 1;
                    t.errors += 1;
                    AggregatorEvent::GroupCheckError {
                        source_id: source.source_id,
                        source_name: source.source_name,
                        error,
                    }
                }
                // Both auth outcomes count as errors, as the listener counts them.
                ListenerEvent::AuthRecovered { source } => {
                    t.errors += 1;
                    AggregatorEvent::GroupAuthRecovered {
                        source_id: source.source_id,
                        source_name: source.source_name,
                    }
                }
                ListenerEvent::AuthFailed { source, error } => {
                    t.errors += 1;
                    AggregatorEvent::GroupAuthFailed {
                        source_id: source.source_id,
                        source_name: source.source_name,
                        error,
                    }
                }
            }
        };

        if out.send(forwarded).await.is_err() {
            tracing::debug!(target: "aggregator", "downstream receiver gone");
        }
    }
}

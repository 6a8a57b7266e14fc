//! # Source Listener
//! Owns one source's polling cycle end to end: session, recurring timer,
//! extraction, dedup filtering and event emission.
//!
//! Lifecycle: `Stopped -> Starting -> Listening -> Stopped`, with a
//! transient `Reconnecting` entered on an auth rejection and a terminal
//! `Failed` when the single reconnect attempt does not succeed.
//!
//! Cycles never overlap: the recurring loop awaits each cycle before the
//! next tick, late ticks are skipped (`MissedTickBehavior::Skip`), and an
//! on-demand [`SourceListener::poll_now`] that races a running cycle is
//! skipped through an in-flight flag.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::config::SourceConfig;
use crate::dedup::{persist_in_background, DedupSettings, DedupStore};
use crate::error::{ClientError, RelayError, Result};
use crate::events::ListenerEvent;
use crate::platform::{DynPlatformClient, LinkExtractor};
use crate::types::{DiscoveredItem, ListenerPhase, SourceListenerState, SourceTag};

/// Where and how listeners keep their dedup records.
#[derive(Debug, Clone, Default)]
pub struct ListenerOptions {
    pub dedup: DedupSettings,
    /// `None` keeps dedup records in memory only.
    pub data_dir: Option<PathBuf>,
}

impl ListenerOptions {
    pub fn dedup_path(&self, source_id: &str) -> Option<PathBuf> {
        let safe: String = source_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.data_dir
            .as_ref()
            .map(|d| d.join(format!("processed_{safe}.json")))
    }
}

/// Result of one poll cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// New items emitted (may be 0).
    Completed { found: usize },
    /// Another cycle was in flight, or the listener is not polling.
    Skipped,
    TransientError(String),
    /// Auth rejected; `recovered` tells whether the reconnect worked.
    AuthError { recovered: bool },
}

#[derive(Debug)]
struct Inner {
    phase: ListenerPhase,
    dedup: DedupStore,
    checks: u64,
    items_found: u64,
    errors: u64,
    last_check_at: Option<DateTime<Utc>>,
}

struct Shared {
    source_id: String,
    tag: SourceTag,
    locator: String,
    interval_ms: u64,
    extractor: Arc<dyn LinkExtractor>,
    session: DynPlatformClient,
    events: mpsc::Sender<ListenerEvent>,
    in_flight: AtomicBool,
    inner: Mutex<Inner>,
}

struct Runner {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct SourceListener {
    config: SourceConfig,
    options: ListenerOptions,
    shared: Arc<Shared>,
    runner: Option<Runner>,
}

impl SourceListener {
    pub fn new(
        config: SourceConfig,
        extractor: Arc<dyn LinkExtractor>,
        session: DynPlatformClient,
        options: ListenerOptions,
        events: mpsc::Sender<ListenerEvent>,
    ) -> Self {
        let shared = Arc::new(Shared {
            source_id: config.id.clone(),
            tag: config.tag(),
            locator: config.locator.clone(),
            interval_ms: config.polling_interval_ms,
            extractor,
            session,
            events,
            in_flight: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                phase: ListenerPhase::Stopped,
                dedup: DedupStore::in_memory(options.dedup),
                checks: 0,
                items_found: 0,
                errors: 0,
                last_check_at: None,
            }),
        });
        Self {
            config,
            options,
            shared,
            runner: None,
        }
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn is_listening(&self) -> bool {
        self.runner.is_some() && self.shared.phase().is_polling()
    }

    /// Load dedup record, connect, run one cycle, then schedule the rest.
    /// No-op while already listening.
    pub async fn start(&mut self) -> Result<()> {
        if self.is_listening() {
            tracing::debug!(target: "listener", source_id = %self.config.id, "start ignored: already listening");
            return Ok(());
        }
        if self.runner.is_some() {
            // Failed listener being restarted in place.
            self.stop().await?;
        }
        self.config.check()?;
        self.shared.set_phase(ListenerPhase::Starting);

        // Memory-only records survive a restart of the same listener.
        if let Some(path) = self.options.dedup_path(&self.config.id) {
            let dedup = DedupStore::load(path, self.options.dedup).await.map_err(|e| {
                self.shared.set_phase(ListenerPhase::Stopped);
                RelayError::init(&self.config.id, format!("dedup record: {e}"))
            })?;
            self.shared.lock().dedup = dedup;
        }
        let loaded = self.shared.lock().dedup.len();

        if let Err(e) = self.shared.session.connect().await {
            self.shared.set_phase(ListenerPhase::Stopped);
            tracing::error!(target: "listener", source_id = %self.config.id, error = %e, "session failed");
            return Err(RelayError::init(&self.config.id, e));
        }

        self.shared.set_phase(ListenerPhase::Listening);
        tracing::info!(
            target: "listener",
            source_id = %self.config.id,
            interval_ms = self.config.polling_interval_ms,
            dedup_loaded = loaded,
            "listener started"
        );

        self.shared.poll_once().await;

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(self.shared.clone(), stop_rx));
        self.runner = Some(Runner { stop_tx, handle });
        Ok(())
    }

    /// Cancel the timer, let an in-flight cycle finish, flush the dedup
    /// record, release the session. No-op when not running.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(runner) = self.runner.take() else {
            return Ok(());
        };
        let _ = runner.stop_tx.send(true);
        if let Err(e) = runner.handle.await {
            tracing::warn!(target: "listener", source_id = %self.config.id, error = %e, "poll loop ended abnormally");
        }

        let flushed = self.shared.lock().dedup.flush();
        self.shared.session.disconnect().await;
        self.shared.set_phase(ListenerPhase::Stopped);
        tracing::info!(target: "listener", source_id = %self.config.id, "listener stopped");
        flushed
    }

    /// Run a cycle now (outside the schedule).
    pub async fn poll_now(&self) -> PollOutcome {
        self.shared.poll_once().await
    }

    pub fn state(&self) -> SourceListenerState {
        let g = self.shared.lock();
        SourceListenerState {
            phase: g.phase,
            is_listening: self.runner.is_some() && g.phase.is_polling(),
            polling_interval_ms: self.shared.interval_ms,
            checks: g.checks,
            items_found: g.items_found,
            errors: g.errors,
            last_check_at: g.last_check_at,
            dedup_size: g.dedup.len(),
        }
    }
}

impl Drop for SourceListener {
    fn drop(&mut self) {
        if let Some(runner) = self.runner.take() {
            runner.handle.abort();
        }
    }
}

impl ListenerPhase {
    fn is_polling(self) -> bool {
        matches!(self, Self::Listening | Self::Reconnecting)
    }
}

async fn run_loop(shared: Arc<Shared>, mut stop_rx: watch::Receiver<bool>) {
    let period = Duration::from_millis(shared.interval_ms);
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                shared.poll_once().await;
            }
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
        }
    }
}

/// Clears the in-flight flag when a cycle ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("listener mutex poisoned")
    }

    fn phase(&self) -> ListenerPhase {
        self.lock().phase
    }

    fn set_phase(&self, phase: ListenerPhase) {
        self.lock().phase = phase;
    }

    async fn emit(&self, ev: ListenerEvent) {
        if self.events.send(ev).await.is_err() {
            tracing::debug!(target: "listener", source_id = %self.source_id, "event receiver gone");
        }
    }

    async fn poll_once(&self) -> PollOutcome {
        if self.phase() != ListenerPhase::Listening {
            return PollOutcome::Skipped;
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(target: "listener", source_id = %self.source_id, "cycle still in flight, skipping");
            return PollOutcome::Skipped;
        }
        let _guard = InFlight(&self.in_flight);

        let now = Utc::now();
        {
            let mut g = self.lock();
            g.checks += 1;
            g.last_check_at = Some(now);
        }
        counter!("listener_checks_total", "source" => self.source_id.clone()).increment(1);

        match self.extractor.extract(&self.locator).await {
            Ok(links) => {
                let (batch, persist) = {
                    let mut g = self.lock();
                    let mut batch = Vec::new();
                    for link in links {
                        if g.dedup.insert(link.id.clone()) {
                            batch.push(DiscoveredItem::from_link(link, now));
                        }
                    }
                    let trimmed = g.dedup.trim_if_oversized();
                    if trimmed > 0 {
                        tracing::debug!(target: "listener", source_id = %self.source_id, trimmed, "dedup record trimmed");
                    }
                    g.items_found += batch.len() as u64;
                    let persist = if batch.is_empty() {
                        None
                    } else {
                        g.dedup.pending_save()
                    };
                    (batch, persist)
                };

                if let Some(save) = persist {
                    persist_in_background(save);
                }

                let found = batch.len();
                if found > 0 {
                    counter!("listener_items_found_total", "source" => self.source_id.clone())
                        .increment(found as u64);
                    tracing::info!(target: "listener", source_id = %self.source_id, found, "new items found");
                    self.emit(ListenerEvent::ItemsFound {
                        source: self.tag.clone(),
                        items: batch,
                    })
                    .await;
                }
                self.emit(ListenerEvent::CheckCompleted {
                    source: self.tag.clone(),
                    found,
                    at: now,
                })
                .await;
                PollOutcome::Completed { found }
            }
            Err(ClientError::Auth(msg)) => {
                self.lock().errors += 1;
                counter!("listener_auth_failures_total", "source" => self.source_id.clone()).increment(1);
                tracing::warn!(target: "listener", source_id = %self.source_id, error = %msg, "session rejected, reconnecting");
                self.set_phase(ListenerPhase::Reconnecting);

                if self.session.reconnect().await {
                    self.set_phase(ListenerPhase::Listening);
                    tracing::info!(target: "listener", source_id = %self.source_id, "session recovered");
                    self.emit(ListenerEvent::AuthRecovered {
                        source: self.tag.clone(),
                    })
                    .await;
                    PollOutcome::AuthError { recovered: true }
                } else {
                    self.set_phase(ListenerPhase::Failed);
                    tracing::error!(target: "listener", source_id = %self.source_id, "reconnect failed, listener disabled until restart");
                    self.emit(ListenerEvent::AuthFailed {
                        source: self.tag.clone(),
                        error: msg,
                    })
                    .await;
                    PollOutcome::AuthError { recovered: false }
                }
            }
            Err(ClientError::Transient(msg)) => {
                self.lock().errors += 1;
                counter!("listener_errors_total", "source" => self.source_id.clone()).increment(1);
                tracing::warn!(target: "listener", source_id = %self.source_id, error = %msg, "check failed");
                self.emit(ListenerEvent::CheckError {
                    source: self.tag.clone(),
                    error: msg.clone(),
                })
                .await;
                PollOutcome::TransientError(msg)
            }
        }
    }
}

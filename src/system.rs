//! # System Facade
//! Wires the aggregator to the dispatcher, republishes every component
//! event on one broadcast stream, and scores overall health.
//!
//! Each component channel has its own reader task, so a full channel only
//! ever waits on a reader that is not itself blocked on it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::gauge;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::aggregator::{AggregatorStatus, ListenerAggregator, StartSummary};
use crate::assigner::{AccountAssigner, AssignerStatus, InitSummary};
use crate::config::{DispatchConfig, SourceConfig, WorkerConfig};
use crate::error::{RelayError, Result};
use crate::events::{AggregatorEvent, AssignerEvent, SystemEvent, SYSTEM_BROADCAST_CAPACITY};
use crate::listener::ListenerOptions;
use crate::platform::{LinkExtractor, SessionFactory};
use crate::reply::DynReplyGenerator;

/// How often the background monitor re-scores health.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

/// Raw numbers the score is computed from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthInputs {
    pub total_sources: usize,
    pub active_sources: usize,
    pub total_workers: usize,
    pub active_workers: usize,
    /// Listener plus dispatch errors.
    pub total_errors: u64,
    pub queue_len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub score: u32,
    pub level: HealthLevel,
    pub issues: Vec<String>,
}

/// Deduction-based score starting at 100.
pub fn compute_health(inputs: &HealthInputs) -> HealthReport {
    let mut score: i32 = 100;
    let mut issues = Vec::new();

    let ratio = |active: usize, total: usize| {
        if total == 0 {
            0.0
        } else {
            active as f64 / total as f64
        }
    };

    if inputs.active_sources == 0 {
        score -= 40;
        issues.push("no active sources".to_string());
    } else if ratio(inputs.active_sources, inputs.total_sources) < 0.5 {
        score -= 20;
        issues.push(format!(
            "only {}/{} sources active",
            inputs.active_sources, inputs.total_sources
        ));
    }

    if inputs.active_workers == 0 {
        score -= 40;
        issues.push("no active workers".to_string());
    } else if ratio(inputs.active_workers, inputs.total_workers) < 0.5 {
        score -= 20;
        issues.push(format!(
            "only {}/{} workers active",
            inputs.active_workers, inputs.total_workers
        ));
    }

    if inputs.total_errors > 50 {
        score -= 20;
        issues.push(format!("{} errors", inputs.total_errors));
    } else if inputs.total_errors > 10 {
        score -= 10;
        issues.push(format!("{} errors", inputs.total_errors));
    }

    if inputs.queue_len > 100 {
        score -= 10;
        issues.push(format!("dispatch queue at {}", inputs.queue_len));
    }

    let score = score.max(0) as u32;
    let level = if score >= 80 {
        HealthLevel::Healthy
    } else if score >= 50 {
        HealthLevel::Warning
    } else {
        HealthLevel::Critical
    };
    HealthReport {
        score,
        level,
        issues,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    pub workers: InitSummary,
    pub sources: StartSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub health: HealthReport,
    pub sources: AggregatorStatus,
    pub dispatch: AssignerStatus,
}

struct Core {
    aggregator: ListenerAggregator,
    assigner: AccountAssigner,
    events: broadcast::Sender<SystemEvent>,
    last_level: Mutex<Option<HealthLevel>>,
}

type Receivers = (mpsc::Receiver<AggregatorEvent>, mpsc::Receiver<AssignerEvent>);

pub struct ReplySystem {
    core: Arc<Core>,
    receivers: Mutex<Option<Receivers>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl ReplySystem {
    /// Must be called inside a Tokio runtime.
    pub fn new(
        extractor: Arc<dyn LinkExtractor>,
        sessions: Arc<dyn SessionFactory>,
        generator: DynReplyGenerator,
        dispatch: DispatchConfig,
        listener: ListenerOptions,
    ) -> Self {
        let (aggregator, agg_rx) = ListenerAggregator::new(extractor, sessions.clone(), listener);
        let (assigner, asg_rx) = AccountAssigner::new(sessions, generator, dispatch);
        let (events, _) = broadcast::channel(SYSTEM_BROADCAST_CAPACITY);
        Self {
            core: Arc::new(Core {
                aggregator,
                assigner,
                events,
                last_level: Mutex::new(None),
            }),
            receivers: Mutex::new(Some((agg_rx, asg_rx))),
            tasks: Mutex::new(Vec::new()),
            started_at: Mutex::new(None),
        }
    }

    pub fn aggregator(&self) -> &ListenerAggregator {
        &self.core.aggregator
    }

    pub fn assigner(&self) -> &AccountAssigner {
        &self.core.assigner
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.core.events.subscribe()
    }

    /// Workers first (no worker is fatal), then the forwarder, then sources.
    pub async fn start(
        &self,
        sources: Vec<SourceConfig>,
        workers: Vec<WorkerConfig>,
    ) -> Result<StartReport> {
        if self.receivers.lock().expect("receivers mutex poisoned").is_none() {
            return Err(RelayError::AlreadyStarted);
        }
        let worker_summary = self.core.assigner.initialize(workers).await?;

        let (agg_rx, asg_rx) = self
            .receivers
            .lock()
            .expect("receivers mutex poisoned")
            .take()
            .ok_or(RelayError::AlreadyStarted)?;
        let forwarder = tokio::spawn(forward_found(self.core.clone(), agg_rx));
        let dispatch = tokio::spawn(forward_dispatch(self.core.clone(), asg_rx));
        let monitor = tokio::spawn(monitor(self.core.clone()));
        self.tasks
            .lock()
            .expect("tasks mutex poisoned")
            .extend([forwarder, dispatch, monitor]);

        let source_summary = self.core.aggregator.start(sources).await;
        *self.started_at.lock().expect("started_at mutex poisoned") = Some(Utc::now());

        let health = self.core.evaluate_health().await;
        tracing::info!(
            target: "system",
            workers = worker_summary.active.len(),
            sources = source_summary.active,
            score = health.score,
            "relay started"
        );
        Ok(StartReport {
            workers: worker_summary,
            sources: source_summary,
        })
    }

    /// Stop listeners, release workers, end background tasks.
    pub async fn stop(&self) {
        self.core.aggregator.stop().await;
        self.core.assigner.cleanup().await;
        let tasks = std::mem::take(&mut *self.tasks.lock().expect("tasks mutex poisoned"));
        for t in tasks {
            t.abort();
        }
        *self.started_at.lock().expect("started_at mutex poisoned") = None;
        tracing::info!(target: "system", "relay stopped");
    }

    pub async fn health(&self) -> HealthReport {
        self.core.evaluate_health().await
    }

    pub async fn status(&self) -> SystemStatus {
        let sources = self.core.aggregator.status().await;
        let dispatch = self.core.assigner.get_status();
        let health = self.core.score(&sources, &dispatch);
        let started_at = *self.started_at.lock().expect("started_at mutex poisoned");
        SystemStatus {
            running: started_at.is_some(),
            started_at,
            health,
            sources,
            dispatch,
        }
    }
}

impl Drop for ReplySystem {
    fn drop(&mut self) {
        if let Ok(tasks) = self.tasks.get_mut() {
            for t in tasks.drain(..) {
                t.abort();
            }
        }
    }
}

impl Core {
    fn publish(&self, ev: SystemEvent) {
        // No subscribers is fine.
        let _ = self.events.send(ev);
    }

    fn score(&self, sources: &AggregatorStatus, dispatch: &AssignerStatus) -> HealthReport {
        compute_health(&HealthInputs {
            total_sources: sources.total_sources,
            active_sources: sources.active_sources,
            total_workers: dispatch.total_workers,
            active_workers: dispatch.active_workers,
            total_errors: sources.totals.errors + dispatch.total_errors,
            queue_len: dispatch.queue_len,
        })
    }

    /// Score now and publish a transition when the level moved.
    async fn evaluate_health(&self) -> HealthReport {
        let sources = self.aggregator.status().await;
        let dispatch = self.assigner.get_status();
        let report = self.score(&sources, &dispatch);
        gauge!("system_health_score").set(report.score as f64);

        let changed = {
            let mut last = self.last_level.lock().expect("health mutex poisoned");
            let changed = *last != Some(report.level);
            *last = Some(report.level);
            changed
        };
        if changed {
            tracing::info!(target: "system", level = ?report.level, score = report.score, issues = ?report.issues, "health changed");
            self.publish(SystemEvent::HealthChanged {
                level: report.level,
                score: report.score,
            });
        }
        report
    }
}

/// Republishes aggregator events and hands found items to the dispatcher.
/// `assign` may wait on the dispatcher's event channel, so that channel is
/// drained by [`forward_dispatch`], never by this task.
async fn forward_found(core: Arc<Core>, mut agg_rx: mpsc::Receiver<AggregatorEvent>) {
    while let Some(ev) = agg_rx.recv().await {
        let found = match &ev {
            AggregatorEvent::ItemsFound { items, source } => Some((source.source_id.clone(), items.clone())),
            _ => None,
        };
        core.publish(SystemEvent::Listener(ev));
        if let Some((source_id, items)) = found {
            let queued = core.assigner.assign(items).await;
            tracing::debug!(target: "system", source_id = %source_id, queued, "items handed to dispatch");
        }
    }
    tracing::debug!(target: "system", "listener forwarder finished");
}

async fn forward_dispatch(core: Arc<Core>, mut asg_rx: mpsc::Receiver<AssignerEvent>) {
    while let Some(ev) = asg_rx.recv().await {
        core.publish(SystemEvent::Dispatch(ev));
    }
    tracing::debug!(target: "system", "dispatch forwarder finished");
}

async fn monitor(core: Arc<Core>) {
    let mut ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        core.evaluate_health().await;
    }
}

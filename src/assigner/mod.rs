//! # Account Assigner / Dispatcher
//! Owns the worker pool and the FIFO task queue. Items are booked on the
//! least-loaded active worker, then drained strictly one at a time with a
//! pacing delay between tasks: fetch details, check eligibility, generate,
//! post. Failed attempts are re-queued on another worker until the retry
//! budget is spent.

pub mod pool;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, gauge};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

use crate::config::{DispatchConfig, WorkerConfig};
use crate::error::{ClientError, RelayError, Result};
use crate::events::{AssignerEvent, COMPONENT_CHANNEL_CAPACITY};
use crate::platform::{DynPlatformClient, SessionFactory};
use crate::reply::{reply_context, DynReplyGenerator};
use crate::types::{DiscoveredItem, Task, WorkerAccount};

use self::pool::WorkerPool;

#[derive(Debug, Clone, Serialize)]
pub struct InitSummary {
    pub active: Vec<String>,
    pub failed: Vec<String>,
}

/// Read-only snapshot returned by [`AccountAssigner::get_status`].
#[derive(Debug, Clone, Serialize)]
pub struct AssignerStatus {
    pub total_workers: usize,
    pub active_workers: usize,
    pub queue_len: usize,
    pub is_processing: bool,
    pub total_errors: u64,
    pub tasks_completed: u64,
    pub tasks_skipped: u64,
    pub tasks_failed: u64,
    pub items_dropped: u64,
    pub workers: Vec<WorkerAccount>,
}

#[derive(Default)]
struct Counters {
    total_errors: u64,
    tasks_completed: u64,
    tasks_skipped: u64,
    tasks_failed: u64,
    items_dropped: u64,
}

#[derive(Default)]
struct State {
    pool: WorkerPool,
    clients: HashMap<String, DynPlatformClient>,
    queue: VecDeque<Task>,
    draining: bool,
    drain: Option<JoinHandle<()>>,
    counters: Counters,
}

struct Inner {
    settings: DispatchConfig,
    sessions: Arc<dyn SessionFactory>,
    generator: DynReplyGenerator,
    events: mpsc::Sender<AssignerEvent>,
    state: Mutex<State>,
}

/// Cheap to clone; all clones share one pool and queue.
#[derive(Clone)]
pub struct AccountAssigner {
    inner: Arc<Inner>,
}

enum Attempt {
    Posted { reply_text: String, reply_id: String },
    Skipped(String),
    Failed { error: String, auth: bool },
}

impl AccountAssigner {
    pub fn new(
        sessions: Arc<dyn SessionFactory>,
        generator: DynReplyGenerator,
        settings: DispatchConfig,
    ) -> (Self, mpsc::Receiver<AssignerEvent>) {
        let (events, rx) = mpsc::channel(COMPONENT_CHANNEL_CAPACITY);
        let inner = Inner {
            settings,
            sessions,
            generator,
            events,
            state: Mutex::new(State::default()),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Open a session for every enabled worker concurrently. Workers that
    /// fail to connect are left out of the pool.
    pub async fn initialize(&self, workers: Vec<WorkerConfig>) -> Result<InitSummary> {
        let mut failed = Vec::new();
        let mut set = JoinSet::new();
        for cfg in workers.into_iter().filter(|w| w.enabled) {
            if let Err(e) = cfg.check() {
                tracing::warn!(target: "dispatch", worker_id = %cfg.id, error = %e, "worker config rejected");
                failed.push(cfg.id);
                continue;
            }
            let client = self.inner.sessions.open(cfg.credentials());
            set.spawn(async move {
                let res = client.connect().await;
                (cfg.id, client, res)
            });
        }

        let mut connected = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((id, client, Ok(()))) => connected.push((id, client)),
                Ok((id, _, Err(e))) => {
                    tracing::warn!(target: "dispatch", worker_id = %id, error = %e, "worker session failed");
                    failed.push(id);
                }
                Err(e) => tracing::error!(target: "dispatch", error = %e, "worker connect task panicked"),
            }
        }
        connected.sort_by(|a, b| a.0.cmp(&b.0));
        failed.sort();

        let active: Vec<String> = connected.iter().map(|(id, _)| id.clone()).collect();
        {
            let mut s = self.inner.lock();
            for (id, client) in connected {
                s.pool.insert(WorkerAccount::new(id.clone()));
                s.clients.insert(id, client);
            }
        }

        tracing::info!(target: "dispatch", active = active.len(), failed = failed.len(), "workers initialized");
        self.inner
            .emit(AssignerEvent::Initialized {
                active: active.clone(),
                failed: failed.clone(),
            })
            .await;

        if active.is_empty() {
            return Err(RelayError::NoActiveWorkers);
        }
        Ok(InitSummary { active, failed })
    }

    /// Book each item on the best active worker and enqueue it. Items are
    /// dropped when no worker is active. Returns the number enqueued.
    pub async fn assign(&self, items: Vec<DiscoveredItem>) -> usize {
        let now = Utc::now();
        let mut events = Vec::with_capacity(items.len());
        let mut queued = 0;
        {
            let mut s = self.inner.lock();
            for item in items {
                let Some(worker_id) = s.pool.select(None) else {
                    tracing::warn!(target: "dispatch", item_id = %item.id, "no active worker, item dropped");
                    s.counters.items_dropped += 1;
                    events.push(AssignerEvent::ItemDropped {
                        item_id: item.id,
                        reason: "no active worker".into(),
                    });
                    continue;
                };
                s.pool.assign_to(&worker_id, now);
                events.push(AssignerEvent::TaskAssigned {
                    worker_id: worker_id.clone(),
                    item_id: item.id.clone(),
                });
                s.queue.push_back(Task {
                    item,
                    worker_id,
                    created_at: now,
                    retry_count: 0,
                });
                queued += 1;
            }
            gauge!("dispatch_queue_len").set(s.queue.len() as f64);
            if queued > 0 {
                counter!("dispatch_tasks_total").increment(queued as u64);
                self.inner.kick(&mut s);
            }
        }
        for ev in events {
            self.inner.emit(ev).await;
        }
        queued
    }

    /// Release every session and clear the pool and queue.
    pub async fn cleanup(&self) {
        let clients = {
            let mut s = self.inner.lock();
            if let Some(handle) = s.drain.take() {
                handle.abort();
            }
            s.draining = false;
            s.queue.clear();
            s.pool.clear();
            gauge!("dispatch_queue_len").set(0.0);
            std::mem::take(&mut s.clients)
        };
        let mut set = JoinSet::new();
        for (_, client) in clients {
            set.spawn(async move { client.disconnect().await });
        }
        while set.join_next().await.is_some() {}
        tracing::info!(target: "dispatch", "worker pool released");
    }

    pub fn get_status(&self) -> AssignerStatus {
        let s = self.inner.lock();
        AssignerStatus {
            total_workers: s.pool.len(),
            active_workers: s.pool.active_count(),
            queue_len: s.queue.len(),
            is_processing: s.draining,
            total_errors: s.counters.total_errors,
            tasks_completed: s.counters.tasks_completed,
            tasks_skipped: s.counters.tasks_skipped,
            tasks_failed: s.counters.tasks_failed,
            items_dropped: s.counters.items_dropped,
            workers: s.pool.snapshot(),
        }
    }

    /// Zero all counters. Worker status is kept.
    pub fn reset_stats(&self) {
        let mut s = self.inner.lock();
        s.pool.reset_stats();
        s.counters = Counters::default();
        tracing::info!(target: "dispatch", "dispatch stats reset");
    }

    /// Return a demoted worker to rotation.
    pub fn reactivate_worker(&self, id: &str) -> Result<()> {
        let mut s = self.inner.lock();
        if !s.pool.reactivate(id) {
            return Err(RelayError::NotFound(id.to_string()));
        }
        tracing::info!(target: "dispatch", worker_id = %id, "worker reactivated");
        Ok(())
    }
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("assigner mutex poisoned")
    }

    async fn emit(&self, ev: AssignerEvent) {
        if self.events.send(ev).await.is_err() {
            tracing::debug!(target: "dispatch", "event receiver gone");
        }
    }

    /// Start the drain loop unless it is already running.
    fn kick(self: &Arc<Self>, s: &mut State) {
        if s.draining || s.queue.is_empty() {
            return;
        }
        s.draining = true;
        s.drain = Some(tokio::spawn(drain(self.clone())));
    }

    async fn process_task(&self, task: Task) {
        let client = self.lock().clients.get(&task.worker_id).cloned();
        let attempt = match client {
            Some(client) => self.attempt(&client, &task).await,
            None => Attempt::Failed {
                error: format!("no session for worker {}", task.worker_id),
                auth: false,
            },
        };

        match attempt {
            Attempt::Posted { reply_text, reply_id } => {
                {
                    let mut s = self.lock();
                    s.pool.record_success(&task.worker_id);
                    s.counters.tasks_completed += 1;
                }
                counter!("dispatch_replies_total").increment(1);
                tracing::info!(
                    target: "dispatch",
                    worker_id = %task.worker_id,
                    item_id = %task.item.id,
                    reply_id = %reply_id,
                    "reply posted"
                );
                self.emit(AssignerEvent::TaskCompleted {
                    worker_id: task.worker_id,
                    item_id: task.item.id,
                    reply_text,
                    reply_id,
                })
                .await;
            }
            Attempt::Skipped(reason) => {
                {
                    let mut s = self.lock();
                    s.pool.release(&task.worker_id);
                    s.counters.tasks_skipped += 1;
                }
                counter!("dispatch_skipped_total").increment(1);
                tracing::debug!(target: "dispatch", item_id = %task.item.id, reason = %reason, "item skipped");
                self.emit(AssignerEvent::TaskSkipped {
                    worker_id: task.worker_id,
                    item_id: task.item.id,
                    reason,
                })
                .await;
            }
            Attempt::Failed { error, auth } => {
                let reconnected = if auth {
                    let client = self.lock().clients.get(&task.worker_id).cloned();
                    match client {
                        Some(c) => c.reconnect().await,
                        None => false,
                    }
                } else {
                    true
                };
                self.handle_task_error(task, error, !reconnected).await;
            }
        }
    }

    /// Fetch, filter, generate, post.
    async fn attempt(&self, client: &DynPlatformClient, task: &Task) -> Attempt {
        let details = match client.get_item_details(&task.item.id).await {
            Ok(d) => d,
            Err(e) => return failed_call("details", e),
        };

        if self.settings.skip_own_items
            && client.user_id().as_deref() == Some(details.author_id.as_str())
        {
            return Attempt::Skipped("own item".into());
        }
        let age = Utc::now().signed_duration_since(details.created_at).num_seconds();
        if age < self.settings.min_item_age_secs {
            return Attempt::Skipped(format!("item too new ({age}s)"));
        }

        let ctx = reply_context(&details);
        let reply = self.generator.generate(&details.text, &ctx).await;
        if !reply.success || reply.text.trim().is_empty() {
            return Attempt::Failed {
                error: reply
                    .error
                    .unwrap_or_else(|| "generator returned no text".into()),
                auth: false,
            };
        }

        match client.post_reply(&reply.text, &task.item.id).await {
            Ok(posted) => Attempt::Posted {
                reply_text: reply.text,
                reply_id: posted.id,
            },
            Err(e) => failed_call("post", e),
        }
    }

    /// Penalise the worker, then re-queue on another worker or give up.
    async fn handle_task_error(&self, mut task: Task, error: String, session_lost: bool) {
        let mut events = Vec::new();
        {
            let mut s = self.lock();
            let outcome = s.pool.record_error(&task.worker_id, self.settings.error_threshold);
            let demoted = outcome.demoted || (session_lost && s.pool.demote(&task.worker_id));
            s.counters.total_errors += 1;
            counter!("dispatch_errors_total").increment(1);
            tracing::warn!(
                target: "dispatch",
                worker_id = %task.worker_id,
                item_id = %task.item.id,
                retry_count = task.retry_count,
                error = %error,
                "task attempt failed"
            );
            if demoted {
                tracing::error!(target: "dispatch", worker_id = %task.worker_id, error_count = outcome.error_count, "worker moved to error status");
                events.push(AssignerEvent::AccountError {
                    worker_id: task.worker_id.clone(),
                    error_count: outcome.error_count,
                });
            }

            task.retry_count += 1;
            let next = if task.retry_count <= self.settings.max_retries {
                s.pool.select(Some(task.worker_id.as_str()))
            } else {
                None
            };
            match next {
                Some(next) => {
                    s.pool.assign_to(&next, Utc::now());
                    events.push(AssignerEvent::TaskRetried {
                        from_worker: task.worker_id.clone(),
                        to_worker: next.clone(),
                        item_id: task.item.id.clone(),
                        retry_count: task.retry_count,
                    });
                    task.worker_id = next;
                    s.queue.push_back(task);
                    gauge!("dispatch_queue_len").set(s.queue.len() as f64);
                }
                None => {
                    s.counters.tasks_failed += 1;
                    counter!("dispatch_failed_total").increment(1);
                    tracing::error!(
                        target: "dispatch",
                        worker_id = %task.worker_id,
                        item_id = %task.item.id,
                        retry_count = task.retry_count,
                        "task failed permanently"
                    );
                    events.push(AssignerEvent::TaskFailed {
                        worker_id: task.worker_id,
                        item: task.item,
                        error,
                        retry_count: task.retry_count,
                    });
                }
            }
        }
        for ev in events {
            self.emit(ev).await;
        }
    }
}

fn failed_call(what: &str, e: ClientError) -> Attempt {
    Attempt::Failed {
        auth: e.is_auth(),
        error: format!("{what}: {e}"),
    }
}

/// A task booked on a worker that was demoted while it waited moves to the
/// best active worker, keeping its retry count. Without one it is dropped.
fn rebook_if_demoted(s: &mut State, mut task: Task) -> (Option<Task>, Option<AssignerEvent>) {
    if s.pool.get(&task.worker_id).is_some_and(|w| w.is_active()) {
        return (Some(task), None);
    }
    s.pool.release(&task.worker_id);
    match s.pool.select(None) {
        Some(next) => {
            s.pool.assign_to(&next, Utc::now());
            tracing::debug!(target: "dispatch", from = %task.worker_id, to = %next, item_id = %task.item.id, "task moved off demoted worker");
            let ev = AssignerEvent::TaskAssigned {
                worker_id: next.clone(),
                item_id: task.item.id.clone(),
            };
            task.worker_id = next;
            (Some(task), Some(ev))
        }
        None => {
            s.counters.items_dropped += 1;
            tracing::warn!(target: "dispatch", item_id = %task.item.id, "no active worker, queued item dropped");
            let ev = AssignerEvent::ItemDropped {
                item_id: task.item.id,
                reason: "no active worker".into(),
            };
            (None, Some(ev))
        }
    }
}

/// Serial drain: one task at a time, pacing delay in between. Stops when
/// the queue is empty; `assign` restarts it.
async fn drain(inner: Arc<Inner>) {
    let delay = Duration::from_millis(inner.settings.task_delay_ms);
    loop {
        let (task, rebooked) = {
            let mut s = inner.lock();
            match s.queue.pop_front() {
                Some(t) => {
                    gauge!("dispatch_queue_len").set(s.queue.len() as f64);
                    rebook_if_demoted(&mut s, t)
                }
                None => {
                    s.draining = false;
                    s.drain = None;
                    break;
                }
            }
        };
        if let Some(ev) = rebooked {
            inner.emit(ev).await;
        }
        let Some(task) = task else {
            continue;
        };

        inner.process_task(task).await;

        let more = !inner.lock().queue.is_empty();
        if more && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

//! Alert fan-out for hard failures seen on the system event stream.

pub mod antiflutter;
pub mod discord;
pub mod slack;

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::events::{AggregatorEvent, AssignerEvent, SystemEvent};
use crate::system::HealthLevel;

use self::antiflutter::AntiFlutter;
use self::discord::DiscordNotifier;
use self::slack::SlackNotifier;

/// One operator-facing alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    /// Cooldown key; repeats of the same key are suppressed.
    pub key: String,
    pub title: String,
    pub detail: String,
    pub ts: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, alert: &Alert) -> Result<()>;
    fn name(&self) -> &'static str;
}

/// Sends every alert to all configured channels; one failing channel does
/// not stop the others.
#[derive(Default, Clone)]
pub struct NotifierMux {
    targets: Vec<Arc<dyn Notifier>>,
}

impl NotifierMux {
    /// Slack from `SLACK_WEBHOOK_URL`, Discord from `DISCORD_WEBHOOK_URL`.
    pub fn from_env() -> Self {
        let mut mux = Self::default();
        if let Ok(url) = std::env::var("SLACK_WEBHOOK_URL") {
            if !url.trim().is_empty() {
                mux.push(Arc::new(SlackNotifier::new(url)));
            }
        }
        if let Ok(url) = std::env::var("DISCORD_WEBHOOK_URL") {
            if !url.trim().is_empty() {
                mux.push(Arc::new(DiscordNotifier::new(url)));
            }
        }
        mux
    }

    pub fn push(&mut self, target: Arc<dyn Notifier>) {
        self.targets.push(target);
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub async fn notify(&self, alert: &Alert) {
        for t in &self.targets {
            if let Err(e) = t.send(alert).await {
                tracing::warn!(target: "notify", channel = t.name(), error = %format!("{e:#}"), "alert delivery failed");
            }
        }
    }
}

/// Map a system event to an alert, if it warrants one.
pub fn alert_for(ev: &SystemEvent, now: DateTime<Utc>) -> Option<Alert> {
    let (key, title, detail) = match ev {
        SystemEvent::Listener(AggregatorEvent::GroupAuthFailed {
            source_id,
            source_name,
            error,
        }) => (
            format!("auth:{source_id}"),
            format!("Source {source_name} lost its session"),
            format!("Reconnect failed: {error}. Restart the source after fixing credentials."),
        ),
        SystemEvent::Dispatch(AssignerEvent::AccountError {
            worker_id,
            error_count,
        }) => (
            format!("worker:{worker_id}"),
            format!("Worker {worker_id} moved to error status"),
            format!("{error_count} errors recorded; it will not be used until reactivated."),
        ),
        SystemEvent::Dispatch(AssignerEvent::TaskFailed {
            worker_id,
            item,
            error,
            retry_count,
        }) => (
            format!("task:{worker_id}"),
            format!("Reply to {} failed", item.id),
            format!("Last worker {worker_id}, {retry_count} attempts: {error}"),
        ),
        SystemEvent::HealthChanged {
            level: HealthLevel::Critical,
            score,
        } => (
            "health".to_string(),
            "Relay health is critical".to_string(),
            format!("Health score dropped to {score}."),
        ),
        _ => return None,
    };
    Some(Alert {
        key,
        title,
        detail,
        ts: now,
    })
}

/// Forward alert-worthy events until the stream closes.
pub async fn run_alert_loop(
    mut rx: broadcast::Receiver<SystemEvent>,
    mux: NotifierMux,
    cooldown_secs: i64,
) {
    let mut af = AntiFlutter::new(cooldown_secs);
    loop {
        let ev = match rx.recv().await {
            Ok(ev) => ev,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(target: "notify", skipped = n, "alert loop lagged behind event stream");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let now = Utc::now();
        let Some(alert) = alert_for(&ev, now) else {
            continue;
        };
        if !af.should_alert(&alert.key, now) {
            tracing::debug!(target: "notify", key = %alert.key, "suppressed by antiflutter");
            continue;
        }
        mux.notify(&alert).await;
        af.record_alert(&alert.key, now);
    }
}

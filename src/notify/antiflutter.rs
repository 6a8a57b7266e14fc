// src/notify/antiflutter.rs
use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};

/// Per-key cooldown gate to prevent notification spam.
/// - First alert for a key always allowed.
/// - Inside the cooldown, the same key is suppressed; other keys pass.
/// - State is updated explicitly via `record_alert` after a send.
#[derive(Debug, Clone, Default)]
pub struct AntiFlutter {
    cooldown: ChronoDuration,
    last_alert: HashMap<String, DateTime<Utc>>,
}

impl AntiFlutter {
    /// `cooldown_secs` < 0 is treated as 0 (no cooldown).
    pub fn new(cooldown_secs: i64) -> Self {
        Self {
            cooldown: ChronoDuration::seconds(cooldown_secs.max(0)),
            last_alert: HashMap::new(),
        }
    }

    /// Does NOT mutate state.
    pub fn should_alert(&self, key: &str, now: DateTime<Utc>) -> bool {
        match self.last_alert.get(key) {
            None => true,
            Some(ts) => now.signed_duration_since(*ts) >= self.cooldown,
        }
    }

    pub fn record_alert(&mut self, key: &str, now: DateTime<Utc>) {
        self.last_alert.insert(key.to_string(), now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn first_alert_passes() {
        let af = AntiFlutter::new(900);
        let now = Utc.with_ymd_and_hms(2025, 9, 6, 9, 0, 0).unwrap();
        assert!(af.should_alert("auth:g1", now));
    }

    #[test]
    fn inside_cooldown_blocked_per_key() {
        let mut af = AntiFlutter::new(900);
        let t0 = Utc.with_ymd_and_hms(2025, 9, 6, 9, 0, 0).unwrap();
        af.record_alert("auth:g1", t0);
        let t1 = t0 + ChronoDuration::seconds(120);
        assert!(!af.should_alert("auth:g1", t1));
        assert!(af.should_alert("auth:g2", t1));
    }

    #[test]
    fn after_cooldown_passes() {
        let mut af = AntiFlutter::new(900);
        let t0 = Utc.with_ymd_and_hms(2025, 9, 6, 9, 0, 0).unwrap();
        af.record_alert("worker:w1", t0);
        let t_after = t0 + ChronoDuration::seconds(900 + 5);
        assert!(af.should_alert("worker:w1", t_after));
    }

    #[test]
    fn negative_cooldown_never_blocks() {
        let mut af = AntiFlutter::new(-5);
        let t0 = Utc.with_ymd_and_hms(2025, 9, 6, 9, 0, 0).unwrap();
        af.record_alert("health", t0);
        assert!(af.should_alert("health", t0));
    }
}

use anyhow::{Context, Result};
use reqwest::Client;

use super::{Alert, Notifier};

pub struct SlackNotifier {
    webhook_url: String,
    client: Client,
}

impl SlackNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: Client::new(),
        }
    }
}

fn render(alert: &Alert) -> serde_json::Value {
    let text = format!(
        "*Relay alert:* *{}*\n{}\n@ {}",
        alert.title,
        alert.detail,
        alert.ts.to_rfc3339()
    );
    serde_json::json!({ "text": text })
}

#[async_trait::async_trait]
impl Notifier for SlackNotifier {
    async fn send(&self, alert: &Alert) -> Result<()> {
        self.client
            .post(&self.webhook_url)
            .json(&render(alert))
            .send()
            .await
            .context("slack post")?
            .error_for_status()
            .context("slack non-2xx")?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "slack"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn text_carries_title_and_detail() {
        let alert = Alert {
            key: "worker:w1".into(),
            title: "Worker w1 moved to error status".into(),
            detail: "5 errors recorded".into(),
            ts: Utc::now(),
        };
        let body = render(&alert);
        let text = body["text"].as_str().unwrap();
        assert!(text.contains("*Worker w1 moved to error status*"));
        assert!(text.contains("5 errors recorded"));
    }
}

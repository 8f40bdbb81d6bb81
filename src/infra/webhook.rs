//! Cycle summary webhook.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::{CycleReport, TaskId, TaskStatus, WakeReason};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Body posted after each cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleSummary {
    /// Always `cycle_summary`.
    pub event: String,
    /// Cycle identifier.
    pub cycle_id: Uuid,
    /// Why the cycle ran.
    pub reason: WakeReason,
    /// Units launched.
    pub tasks_launched: usize,
    /// Tool invocations across all units.
    pub tools_used: u32,
    /// Recurrence successors created.
    pub rescheduled: usize,
    /// Due tasks left for a later cycle.
    pub deferred: usize,
    /// Wall time in milliseconds.
    pub duration_ms: u64,
    /// Final status per launched task.
    pub outcomes: Vec<TaskOutcome>,
}

/// One entry of [`CycleSummary::outcomes`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// Task id.
    pub task_id: TaskId,
    /// Terminal status.
    pub status: TaskStatus,
}

impl CycleSummary {
    /// Summarise a finished cycle.
    pub fn new(reason: WakeReason, report: &CycleReport) -> Self {
        Self {
            event: "cycle_summary".to_string(),
            cycle_id: report.cycle_id,
            reason,
            tasks_launched: report.launched,
            tools_used: report.tools_used,
            rescheduled: report.rescheduled,
            deferred: report.deferred,
            duration_ms: u64::try_from(report.duration.as_millis()).unwrap_or(u64::MAX),
            outcomes: report
                .outcomes
                .iter()
                .map(|&(task_id, status)| TaskOutcome { task_id, status })
                .collect(),
        }
    }
}

/// Posts cycle summaries to a configured URL. Delivery is best effort:
/// failures are logged and never retried.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    /// Notifier posting to `url`.
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .unwrap_or_else(|err| {
                tracing::warn!(error = %err, "webhook client fell back to defaults");
                reqwest::Client::new()
            });
        Self {
            url: url.into(),
            client,
        }
    }

    /// Target URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Post `summary` and wait for the response.
    pub async fn send(&self, summary: &CycleSummary) -> Result<(), reqwest::Error> {
        let response = self.client.post(&self.url).json(summary).send().await?;
        tracing::info!(url = %self.url, status = %response.status(), "webhook posted");
        Ok(())
    }

    /// Post `summary` in the background.
    pub fn notify(&self, summary: CycleSummary) {
        let notifier = self.clone();
        tokio::spawn(async move {
            if let Err(err) = notifier.send(&summary).await {
                tracing::warn!(url = %notifier.url, error = %err, "webhook failed");
            }
        });
    }
}

//! Alert delivery to notification groups.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use thiserror::Error;

use super::{AlertEvent, AlertKind};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("unknown alert group: {0}")]
    UnknownGroup(String),
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Sends alerts to named webhook groups.
#[derive(Clone)]
pub struct Notifier {
    client: reqwest::Client,
    groups: Arc<BTreeMap<String, String>>,
}

impl Notifier {
    /// `groups` maps a group name to its webhook URL.
    pub fn new(groups: BTreeMap<String, String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            client,
            groups: Arc::new(groups),
        }
    }

    pub fn group_names(&self) -> Vec<String> {
        self.groups.keys().cloned().collect()
    }

    /// Log the alert and deliver it to `group` when one is set.
    pub async fn notify(&self, event: &AlertEvent, group: Option<&str>) -> Result<(), NotifyError> {
        match event.kind {
            AlertKind::Down => tracing::warn!("Alert: {}", event.message()),
            AlertKind::Recovered => tracing::info!("Alert: {}", event.message()),
        }

        let Some(group) = group else {
            return Ok(());
        };
        let url = self
            .groups
            .get(group)
            .ok_or_else(|| NotifyError::UnknownGroup(group.to_string()))?;

        let payload = json!({
            "title": event.title(),
            "message": event.message(),
            "data": event,
        });

        self.client
            .post(url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;

        tracing::debug!("Delivered {:?} alert for {} to group {}", event.kind, event.host, group);
        Ok(())
    }
}

//! Outbound customer notifications.
//!
//! Delivery is fire-and-forget from the core's point of view: a sender reports
//! success or failure, and the effect runner logs failures without undoing
//! anything already committed.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKind {
    EstimateSent,
    InvoiceSent,
    PaymentReceived,
    AppointmentScheduled,
    AppointmentRescheduled,
}

impl TemplateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EstimateSent => "estimate_sent",
            Self::InvoiceSent => "invoice_sent",
            Self::PaymentReceived => "payment_received",
            Self::AppointmentScheduled => "appointment_scheduled",
            Self::AppointmentRescheduled => "appointment_rescheduled",
        }
    }
}

impl std::fmt::Display for TemplateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type TemplateVars = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl NotificationOutcome {
    pub fn delivered() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

#[async_trait::async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(
        &self,
        tenant_id: &str,
        customer_id: &str,
        template: TemplateKind,
        variables: &TemplateVars,
    ) -> NotificationOutcome;
}

/// Writes notifications to the log instead of delivering them.
#[derive(Debug, Default, Clone)]
pub struct LogNotificationSender;

#[async_trait::async_trait]
impl NotificationSender for LogNotificationSender {
    async fn send(
        &self,
        tenant_id: &str,
        customer_id: &str,
        template: TemplateKind,
        variables: &TemplateVars,
    ) -> NotificationOutcome {
        tracing::info!(
            tenant_id,
            customer_id,
            template = %template,
            ?variables,
            "Notification queued (log sender)"
        );
        NotificationOutcome::delivered()
    }
}

/// Posts notifications as JSON to an HTTP relay that owns SMS/email delivery.
#[derive(Debug, Clone)]
pub struct WebhookNotificationSender {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotificationSender {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait::async_trait]
impl NotificationSender for WebhookNotificationSender {
    async fn send(
        &self,
        tenant_id: &str,
        customer_id: &str,
        template: TemplateKind,
        variables: &TemplateVars,
    ) -> NotificationOutcome {
        let payload = serde_json::json!({
            "tenant_id": tenant_id,
            "customer_id": customer_id,
            "template": template,
            "variables": variables,
        });

        let response = self
            .client
            .post(&self.url)
            .header("User-Agent", "fieldserver-notifications/1.0")
            .json(&payload)
            .timeout(Duration::from_secs(10))
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(tenant_id, customer_id, template = %template, "Notification relayed");
                NotificationOutcome::delivered()
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                NotificationOutcome::failed(format!("relay returned {status}: {body}"))
            }
            Err(e) => NotificationOutcome::failed(format!("relay request failed: {e}")),
        }
    }
}

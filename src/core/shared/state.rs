use std::sync::Arc;

use diesel::SqliteConnection;

use crate::billing::stripe_integration::{PaymentProcessor, StripeClient};
use crate::billing::webhooks::WebhookReconciler;
use crate::core::config::AppConfig;
use crate::core::effects::EffectRunner;
use crate::core::error::{CoreError, CoreResult};
use crate::core::shared::utils::DbPool;
use crate::notifications::NotificationSender;

/// Shared handles for request handlers. Holds no mutable business state;
/// all coordination goes through the database.
pub struct AppState {
    pub conn: DbPool,
    pub config: AppConfig,
    pub effects: EffectRunner,
    pub webhooks: WebhookReconciler,
    pub payments: Option<Arc<dyn PaymentProcessor>>,
    pub stripe: Option<Arc<StripeClient>>,
}

impl AppState {
    pub fn new(conn: DbPool, config: AppConfig, notifier: Arc<dyn NotificationSender>) -> Self {
        let effects = EffectRunner::new(conn.clone(), notifier);
        let webhooks = WebhookReconciler::new(conn.clone(), effects.clone());
        Self {
            conn,
            config,
            effects,
            webhooks,
            payments: None,
            stripe: None,
        }
    }

    /// Use `client` both as the payment processor and as the webhook verifier.
    pub fn with_stripe(mut self, client: StripeClient) -> Self {
        let client = Arc::new(client);
        self.payments = Some(client.clone());
        self.stripe = Some(client);
        self
    }

    pub fn with_payment_processor(mut self, processor: Arc<dyn PaymentProcessor>) -> Self {
        self.payments = Some(processor);
        self
    }

    pub fn payment_processor(&self) -> CoreResult<&dyn PaymentProcessor> {
        self.payments
            .as_deref()
            .ok_or_else(|| CoreError::External("payment processor is not configured".to_string()))
    }

    /// Run blocking diesel work on a pooled connection off the async runtime.
    pub async fn blocking<T, F>(&self, work: F) -> CoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteConnection) -> CoreResult<T> + Send + 'static,
    {
        let pool = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            work(&mut conn)
        })
        .await?
    }
}

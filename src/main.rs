use std::sync::Arc;

use anyhow::Context;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use fieldserver::api_router::configure_api_routes;
use fieldserver::billing::stripe_integration::StripeClient;
use fieldserver::core::config::AppConfig;
use fieldserver::core::shared::state::AppState;
use fieldserver::core::shared::utils::init_database;
use fieldserver::notifications::{LogNotificationSender, NotificationSender, WebhookNotificationSender};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::load().context("failed to load configuration")?;
    let pool = init_database(&config.database.url, config.database.pool_size)
        .with_context(|| format!("failed to open database at {}", config.database.url))?;

    let notifier: Arc<dyn NotificationSender> = match &config.notifications.webhook_url {
        Some(url) => {
            tracing::info!(url = %url, "Delivering notifications through webhook relay");
            Arc::new(WebhookNotificationSender::new(url.clone()))
        }
        None => {
            tracing::warn!("No notification relay configured, notifications will only be logged");
            Arc::new(LogNotificationSender)
        }
    };

    let mut state = AppState::new(pool, config.clone(), notifier);
    match &config.stripe.api_key {
        Some(api_key) => {
            let mut client = StripeClient::new(api_key.clone(), config.stripe.webhook_secret.clone());
            if let Some(base_url) = &config.stripe.base_url {
                client = client.with_base_url(base_url.clone());
            }
            state = state.with_stripe(client);
            tracing::info!("Payment processor enabled");
        }
        None => tracing::warn!("stripe.api_key not set, payment intents and webhooks are disabled"),
    }

    let app = configure_api_routes()
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state));

    let address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    tracing::info!(%address, "fieldserver listening");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

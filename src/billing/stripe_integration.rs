use std::collections::{BTreeMap, HashMap};

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::core::error::CoreError;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_BASE_URL: &str = "https://api.stripe.com/v1";
/// Accepted clock skew between the signature timestamp and now, in seconds.
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Outbound payment processor operations used by invoicing.
#[async_trait::async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn create_payment_intent(
        &self,
        request: &PaymentIntentRequest,
    ) -> Result<CreatedPaymentIntent, StripeError>;

    async fn cancel_payment_intent(&self, intent_id: &str) -> Result<(), StripeError>;

    async fn get_payment_intent(&self, intent_id: &str) -> Result<RetrievedPaymentIntent, StripeError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntentRequest {
    pub amount: i64,
    pub currency: String,
    /// Echoed back on every webhook for the intent; carries `tenant_id` and
    /// `invoice_id`.
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreatedPaymentIntent {
    pub intent_id: String,
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetrievedPaymentIntent {
    pub intent_id: String,
    pub status: PaymentIntentStatus,
    pub amount: i64,
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentIntentStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    Processing,
    RequiresCapture,
    Canceled,
    Succeeded,
    #[serde(other)]
    Unknown,
}

impl PaymentIntentStatus {
    /// An intent that can still be paid and may be handed out again.
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            Self::RequiresPaymentMethod | Self::RequiresConfirmation | Self::RequiresAction
        )
    }

    /// An intent the customer has already committed money to.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Processing | Self::RequiresCapture | Self::Succeeded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequiresPaymentMethod => "requires_payment_method",
            Self::RequiresConfirmation => "requires_confirmation",
            Self::RequiresAction => "requires_action",
            Self::Processing => "processing",
            Self::RequiresCapture => "requires_capture",
            Self::Canceled => "canceled",
            Self::Succeeded => "succeeded",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripePaymentIntent {
    pub id: String,
    pub amount: i64,
    #[serde(default)]
    pub amount_received: i64,
    pub currency: String,
    pub status: PaymentIntentStatus,
    pub client_secret: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub last_payment_error: Option<StripePaymentError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripePaymentError {
    pub code: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeSubscription {
    pub id: String,
    pub customer: String,
    pub status: StripeSubscriptionStatus,
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StripeSubscriptionStatus {
    Active,
    Canceled,
    Incomplete,
    IncompleteExpired,
    PastDue,
    Paused,
    Trialing,
    Unpaid,
}

impl StripeSubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Canceled => "canceled",
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::PastDue => "past_due",
            Self::Paused => "paused",
            Self::Trialing => "trialing",
            Self::Unpaid => "unpaid",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeWebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: StripeWebhookData,
    /// Origination time at the provider, unix seconds.
    pub created: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StripeWebhookData {
    pub object: serde_json::Value,
}

#[derive(Debug, Clone)]
pub enum WebhookEventType {
    PaymentIntentSucceeded(StripePaymentIntent),
    PaymentIntentFailed(StripePaymentIntent),
    SubscriptionCreated(StripeSubscription),
    SubscriptionUpdated(StripeSubscription),
    SubscriptionDeleted(StripeSubscription),
    Unknown(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StripeError {
    #[error("Stripe API error: {0}")]
    ApiError(String),
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Invalid webhook: {0}")]
    InvalidWebhook(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Stripe is not configured")]
    NotConfigured,
}

impl From<StripeError> for CoreError {
    fn from(err: StripeError) -> Self {
        match err {
            StripeError::InvalidWebhook(_) | StripeError::ParseError(_) => {
                Self::Validation(err.to_string())
            }
            StripeError::ApiError(_) | StripeError::NetworkError(_) | StripeError::NotConfigured => {
                Self::External(err.to_string())
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct StripeClient {
    api_key: String,
    webhook_secret: Option<String>,
    client: reqwest::Client,
    base_url: String,
}

impl StripeClient {
    pub fn new(api_key: String, webhook_secret: Option<String>) -> Self {
        Self {
            api_key,
            webhook_secret,
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn verify_webhook_signature(&self, payload: &str, signature: &str) -> Result<StripeWebhookEvent, StripeError> {
        self.verify_webhook_signature_at(payload, signature, chrono::Utc::now().timestamp())
    }

    /// Check a `Stripe-Signature` header (`t=<unix>,v1=<hex>[,v1=...]`)
    /// against `now` and decode the event.
    pub fn verify_webhook_signature_at(
        &self,
        payload: &str,
        signature: &str,
        now: i64,
    ) -> Result<StripeWebhookEvent, StripeError> {
        let webhook_secret = self
            .webhook_secret
            .as_ref()
            .ok_or(StripeError::NotConfigured)?;

        let mut timestamp = None;
        let mut candidates = Vec::new();
        for part in signature.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = Some(value),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| StripeError::InvalidWebhook("Missing timestamp".to_string()))?;
        if candidates.is_empty() {
            return Err(StripeError::InvalidWebhook("Missing signature".to_string()));
        }

        let signed_payload = format!("{timestamp}.{payload}");
        let matched = candidates.iter().any(|candidate| {
            let Ok(received) = hex::decode(candidate) else {
                return false;
            };
            let Ok(mut mac) = HmacSha256::new_from_slice(webhook_secret.as_bytes()) else {
                return false;
            };
            mac.update(signed_payload.as_bytes());
            mac.verify_slice(&received).is_ok()
        });

        if !matched {
            return Err(StripeError::InvalidWebhook("Signature mismatch".to_string()));
        }

        let timestamp_i64: i64 = timestamp
            .parse()
            .map_err(|_| StripeError::InvalidWebhook("Invalid timestamp".to_string()))?;

        if (now - timestamp_i64).abs() > SIGNATURE_TOLERANCE_SECS {
            return Err(StripeError::InvalidWebhook("Timestamp outside tolerance".to_string()));
        }

        serde_json::from_str(payload).map_err(|e| StripeError::ParseError(e.to_string()))
    }

    pub fn parse_webhook_event(&self, event: &StripeWebhookEvent) -> Result<WebhookEventType, StripeError> {
        parse_webhook_event(event)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(&self, response: reqwest::Response) -> Result<T, StripeError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StripeError::NetworkError(e.to_string()))?;

        if !status.is_success() {
            #[derive(Deserialize)]
            struct StripeApiError {
                error: StripeApiErrorDetail,
            }

            #[derive(Deserialize)]
            struct StripeApiErrorDetail {
                message: String,
            }

            if let Ok(error) = serde_json::from_str::<StripeApiError>(&body) {
                return Err(StripeError::ApiError(error.error.message));
            }

            return Err(StripeError::ApiError(format!("HTTP {}: {}", status, body)));
        }

        serde_json::from_str(&body).map_err(|e| StripeError::ParseError(e.to_string()))
    }
}

pub fn parse_webhook_event(event: &StripeWebhookEvent) -> Result<WebhookEventType, StripeError> {
    fn object<T: serde::de::DeserializeOwned>(event: &StripeWebhookEvent) -> Result<T, StripeError> {
        serde_json::from_value(event.data.object.clone()).map_err(|e| StripeError::ParseError(e.to_string()))
    }

    match event.event_type.as_str() {
        "payment_intent.succeeded" => Ok(WebhookEventType::PaymentIntentSucceeded(object(event)?)),
        "payment_intent.payment_failed" => Ok(WebhookEventType::PaymentIntentFailed(object(event)?)),
        "customer.subscription.created" => Ok(WebhookEventType::SubscriptionCreated(object(event)?)),
        "customer.subscription.updated" => Ok(WebhookEventType::SubscriptionUpdated(object(event)?)),
        "customer.subscription.deleted" => Ok(WebhookEventType::SubscriptionDeleted(object(event)?)),
        _ => Ok(WebhookEventType::Unknown(event.event_type.clone())),
    }
}

#[async_trait::async_trait]
impl PaymentProcessor for StripeClient {
    async fn create_payment_intent(
        &self,
        request: &PaymentIntentRequest,
    ) -> Result<CreatedPaymentIntent, StripeError> {
        let mut form: Vec<(String, String)> = vec![
            ("amount".to_string(), request.amount.to_string()),
            ("currency".to_string(), request.currency.clone()),
            ("automatic_payment_methods[enabled]".to_string(), "true".to_string()),
        ];

        for (key, value) in &request.metadata {
            form.push((format!("metadata[{key}]"), value.clone()));
        }

        let response = self
            .client
            .post(format!("{}/payment_intents", self.base_url))
            .basic_auth(&self.api_key, Option::<&str>::None)
            .form(&form)
            .send()
            .await
            .map_err(|e| StripeError::NetworkError(e.to_string()))?;

        let intent: StripePaymentIntent = self.handle_response(response).await?;
        Ok(CreatedPaymentIntent {
            intent_id: intent.id,
            client_secret: intent.client_secret,
        })
    }

    async fn cancel_payment_intent(&self, intent_id: &str) -> Result<(), StripeError> {
        let response = self
            .client
            .post(format!("{}/payment_intents/{}/cancel", self.base_url, intent_id))
            .basic_auth(&self.api_key, Option::<&str>::None)
            .send()
            .await
            .map_err(|e| StripeError::NetworkError(e.to_string()))?;

        let _: StripePaymentIntent = self.handle_response(response).await?;
        Ok(())
    }

    async fn get_payment_intent(&self, intent_id: &str) -> Result<RetrievedPaymentIntent, StripeError> {
        let response = self
            .client
            .get(format!("{}/payment_intents/{}", self.base_url, intent_id))
            .basic_auth(&self.api_key, Option::<&str>::None)
            .send()
            .await
            .map_err(|e| StripeError::NetworkError(e.to_string()))?;

        let intent: StripePaymentIntent = self.handle_response(response).await?;
        Ok(RetrievedPaymentIntent {
            intent_id: intent.id,
            status: intent.status,
            amount: intent.amount,
            client_secret: intent.client_secret,
        })
    }
}

/// Build a `Stripe-Signature` header value for `payload`.
pub fn sign_payload(secret: &str, payload: &str, timestamp: i64) -> Result<String, StripeError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| StripeError::InvalidWebhook("Invalid webhook secret".to_string()))?;
    mac.update(format!("{timestamp}.{payload}").as_bytes());
    Ok(format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";

    fn event_json(event_type: &str, object: serde_json::Value) -> String {
        serde_json::json!({
            "id": "evt_1",
            "type": event_type,
            "created": 1_700_000_000,
            "data": { "object": object }
        })
        .to_string()
    }

    fn client(base_url: &str) -> StripeClient {
        StripeClient::new("sk_test".to_string(), Some(SECRET.to_string())).with_base_url(base_url)
    }

    #[test]
    fn test_valid_signature_decodes_event() {
        let payload = event_json("payment_intent.succeeded", serde_json::json!({
            "id": "pi_1", "amount": 500, "amount_received": 500, "currency": "usd",
            "status": "succeeded", "client_secret": null,
            "metadata": { "tenant_id": "t1", "invoice_id": "inv1" }
        }));
        let header = sign_payload(SECRET, &payload, 1_700_000_000).unwrap();
        let event = client(DEFAULT_BASE_URL)
            .verify_webhook_signature_at(&payload, &header, 1_700_000_100)
            .unwrap();
        assert_eq!(event.id, "evt_1");

        match parse_webhook_event(&event).unwrap() {
            WebhookEventType::PaymentIntentSucceeded(intent) => {
                assert_eq!(intent.amount_received, 500);
                assert_eq!(intent.metadata.get("invoice_id").map(String::as_str), Some("inv1"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let payload = event_json("payment_intent.succeeded", serde_json::json!({}));
        let header = sign_payload(SECRET, &payload, 1_700_000_000).unwrap();
        let tampered = payload.replace("evt_1", "evt_2");
        let err = client(DEFAULT_BASE_URL)
            .verify_webhook_signature_at(&tampered, &header, 1_700_000_000)
            .unwrap_err();
        assert!(matches!(err, StripeError::InvalidWebhook(_)));
    }

    #[test]
    fn test_stale_signature_rejected() {
        let payload = event_json("customer.subscription.updated", serde_json::json!({}));
        let header = sign_payload(SECRET, &payload, 1_700_000_000).unwrap();
        let err = client(DEFAULT_BASE_URL)
            .verify_webhook_signature_at(&payload, &header, 1_700_000_000 + SIGNATURE_TOLERANCE_SECS + 1)
            .unwrap_err();
        assert!(matches!(err, StripeError::InvalidWebhook(ref m) if m.contains("tolerance")));
    }

    #[test]
    fn test_any_matching_v1_is_accepted() {
        let payload = event_json("charge.refunded", serde_json::json!({}));
        let good = sign_payload(SECRET, &payload, 1_700_000_000).unwrap();
        let good_sig = good.split_once("v1=").map(|(_, s)| s).unwrap();
        let header = format!("t=1700000000,v1={},v1={good_sig}", "00".repeat(32));
        let event = client(DEFAULT_BASE_URL)
            .verify_webhook_signature_at(&payload, &header, 1_700_000_000)
            .unwrap();
        assert!(matches!(parse_webhook_event(&event).unwrap(), WebhookEventType::Unknown(ref t) if t == "charge.refunded"));
    }

    #[test]
    fn test_missing_secret_is_not_configured() {
        let stripe = StripeClient::new("sk_test".to_string(), None);
        assert!(matches!(
            stripe.verify_webhook_signature("{}", "t=1,v1=00"),
            Err(StripeError::NotConfigured)
        ));
    }

    #[tokio::test]
    async fn test_create_payment_intent_posts_form() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/payment_intents")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("amount".into(), "16238".into()),
                mockito::Matcher::UrlEncoded("metadata[invoice_id]".into(), "inv1".into()),
            ]))
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "id": "pi_123", "amount": 16238, "currency": "usd",
                    "status": "requires_payment_method", "client_secret": "pi_123_secret"
                })
                .to_string(),
            )
            .create_async()
            .await;

        let mut metadata = BTreeMap::new();
        metadata.insert("invoice_id".to_string(), "inv1".to_string());
        let created = client(&server.url())
            .create_payment_intent(&PaymentIntentRequest {
                amount: 16238,
                currency: "usd".to_string(),
                metadata,
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(created.intent_id, "pi_123");
        assert_eq!(created.client_secret.as_deref(), Some("pi_123_secret"));
    }

    #[tokio::test]
    async fn test_api_error_message_surfaces() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/payment_intents/pi_missing")
            .with_status(404)
            .with_body(r#"{"error":{"message":"No such payment_intent"}}"#)
            .create_async()
            .await;

        let err = client(&server.url())
            .get_payment_intent("pi_missing")
            .await
            .unwrap_err();
        assert!(matches!(err, StripeError::ApiError(ref m) if m == "No such payment_intent"));
        assert!(matches!(CoreError::from(err), CoreError::External(_)));
    }

    #[test]
    fn test_unknown_intent_status_tolerated() {
        let intent: StripePaymentIntent = serde_json::from_value(serde_json::json!({
            "id": "pi_1", "amount": 1, "currency": "usd", "status": "something_new"
        }))
        .unwrap();
        assert_eq!(intent.status, PaymentIntentStatus::Unknown);
        assert!(!intent.status.is_open());
    }
}

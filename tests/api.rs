mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{payment_intent_event, seed_tenant, setup_db, FakeProcessor, RecordingNotifier, Seed, TestDb};
use fieldserver::api_router::configure_api_routes;
use fieldserver::billing::stripe_integration::{sign_payload, StripeClient};
use fieldserver::core::config::AppConfig;
use fieldserver::core::shared::state::AppState;

const WEBHOOK_SECRET: &str = "whsec_api_test";

fn state(db: &TestDb) -> AppState {
    AppState::new(db.pool.clone(), AppConfig::default(), Arc::new(RecordingNotifier::default()))
}

fn app(state: AppState) -> Router {
    configure_api_routes().with_state(Arc::new(state))
}

fn request(method: &str, uri: &str, seed: Option<&Seed>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(seed) = seed {
        builder = builder
            .header("x-tenant-id", &seed.tenant_id)
            .header("x-caller-id", "dispatcher-1");
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn estimate_body(seed: &Seed, with_job: bool) -> Value {
    json!({
        "customer_id": seed.customer_id,
        "job_id": if with_job { Some(seed.job_id.clone()) } else { None },
        "tax_rate_bps": 825,
        "line_items": [{ "description": "Drain cleaning", "quantity": 1.0, "unit_price": 8500 }],
        "notes": null
    })
}

#[tokio::test]
async fn test_health() {
    let db = setup_db();
    let app = app(state(&db));

    let (status, body) = send(&app, request("GET", "/health", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "fieldserver");
}

#[tokio::test]
async fn test_missing_tenant_header_is_rejected() {
    let db = setup_db();
    let seed = seed_tenant(&mut db.conn(), "UTC");
    let app = app(state(&db));

    let (status, body) = send(&app, request("POST", "/api/estimates", None, Some(estimate_body(&seed, false)))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("x-tenant-id"));
}

#[tokio::test]
async fn test_estimate_lifecycle_over_http() {
    let db = setup_db();
    let seed = seed_tenant(&mut db.conn(), "UTC");
    let app = app(state(&db));

    let (status, created) = send(&app, request("POST", "/api/estimates", Some(&seed), Some(estimate_body(&seed, false)))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["estimate_number"], "EST-001");
    assert_eq!(created["subtotal"], 8500);
    assert_eq!(created["tax_amount"], 701);
    assert_eq!(created["total"], 9201);
    assert_eq!(created["line_items"].as_array().unwrap().len(), 1);
    let id = created["id"].as_str().unwrap().to_string();

    let (status, fetched) = send(&app, request("GET", &format!("/api/estimates/{id}"), Some(&seed), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["status"], "draft");

    let (status, _) = send(&app, request("POST", &format!("/api/estimates/{id}/approve"), Some(&seed), None)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app, request("POST", &format!("/api/estimates/{id}/void"), Some(&seed), None)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("approved"));

    let (status, _) = send(&app, request("POST", &format!("/api/estimates/{id}/convert"), Some(&seed), None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_estimate_is_not_found() {
    let db = setup_db();
    let seed = seed_tenant(&mut db.conn(), "UTC");
    let app = app(state(&db));

    let (status, _) = send(&app, request("GET", "/api/estimates/nope", Some(&seed), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_appointment_conflict_returns_conflicting_booking() {
    let db = setup_db();
    let seed = seed_tenant(&mut db.conn(), "UTC");
    let app = app(state(&db));

    let booking = |start: &str, end: &str, tech: &str| {
        json!({
            "job_id": seed.job_id,
            "technician_id": tech,
            "start_time": start,
            "end_time": end
        })
    };

    let (status, first) = send(
        &app,
        request(
            "POST",
            "/api/appointments",
            Some(&seed),
            Some(booking("2026-10-19T10:00:00", "2026-10-19T12:00:00", &seed.tech_a)),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(
        &app,
        request(
            "POST",
            "/api/appointments",
            Some(&seed),
            Some(booking("2026-10-19T11:00:00", "2026-10-19T13:00:00", &seed.tech_a)),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["conflicting"]["id"], first["id"]);

    let (status, _) = send(
        &app,
        request(
            "POST",
            "/api/appointments",
            Some(&seed),
            Some(booking("2026-10-19T11:00:00", "2026-10-19T13:00:00", &seed.tech_b)),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, availability) = send(
        &app,
        request(
            "GET",
            &format!(
                "/api/appointments/availability?date=2026-10-19&technician_id={}&duration_minutes=60",
                seed.tech_a
            ),
            Some(&seed),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    // 08:00-17:00 UTC in 30-minute steps is 17 one-hour slots; 10:00-12:00 blocks 09:30 through 11:30.
    assert_eq!(availability["slots"].as_array().unwrap().len(), 12);
}

#[tokio::test]
async fn test_payment_intent_requires_processor() {
    let db = setup_db();
    let seed = seed_tenant(&mut db.conn(), "UTC");
    let app = app(state(&db));

    let (status, _) = send(
        &app,
        request("POST", "/api/invoices/whatever/payment-intent", Some(&seed), Some(json!({}))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_payment_intent_over_http() {
    let db = setup_db();
    let seed = seed_tenant(&mut db.conn(), "UTC");
    let processor = Arc::new(FakeProcessor::default());
    let app = app(state(&db).with_payment_processor(processor.clone()));

    let (_, invoice) = send(
        &app,
        request(
            "POST",
            "/api/invoices",
            Some(&seed),
            Some(json!({
                "customer_id": seed.customer_id,
                "tax_rate_bps": 0,
                "line_items": [{ "description": "Service call", "quantity": 1.0, "unit_price": 12000 }]
            })),
        ),
    )
    .await;
    let id = invoice["id"].as_str().unwrap();

    let (status, body) = send(
        &app,
        request("POST", &format!("/api/invoices/{id}/payment-intent"), Some(&seed), Some(json!({}))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["amount"], 12000);
    assert_eq!(body["reused"], false);
    assert_eq!(processor.created.lock().unwrap()[0].currency, "usd");
}

#[tokio::test]
async fn test_webhook_unconfigured_and_unsigned() {
    let db = setup_db();
    let app = app(state(&db));

    let (status, _) = send(&app, request("POST", "/api/webhooks/stripe", None, Some(json!({})))).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    let stripe = StripeClient::new("sk_test".to_string(), Some(WEBHOOK_SECRET.to_string()));
    let app = configure_api_routes().with_state(Arc::new(state(&db).with_stripe(stripe)));
    let (status, _) = send(&app, request("POST", "/api/webhooks/stripe", None, Some(json!({})))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_signed_webhook_is_acknowledged() {
    let db = setup_db();
    let seed = seed_tenant(&mut db.conn(), "UTC");
    let stripe = StripeClient::new("sk_test".to_string(), Some(WEBHOOK_SECRET.to_string()));
    let app = app(state(&db).with_stripe(stripe));

    let payload = payment_intent_event(
        "evt_http",
        "payment_intent.succeeded",
        1_760_000_000,
        "pi_http",
        500,
        json!({ "tenant_id": seed.tenant_id, "invoice_id": "missing" }),
    );
    let signature = sign_payload(WEBHOOK_SECRET, &payload, chrono::Utc::now().timestamp()).unwrap();

    let deliver = || {
        Request::builder()
            .method("POST")
            .uri("/api/webhooks/stripe")
            .header("stripe-signature", &signature)
            .header("content-type", "application/json")
            .body(Body::from(payload.clone()))
            .unwrap()
    };

    let (status, body) = send(&app, deliver()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["received"], true);
    assert_eq!(body["outcome"], "discarded");

    let (status, body) = send(&app, deliver()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "duplicate");
}

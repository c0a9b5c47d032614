#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use diesel::prelude::*;
use diesel::sql_types::{Integer, Text};
use diesel::QueryableByName;
use tempfile::TempDir;

use fieldserver::billing::stripe_integration::{
    CreatedPaymentIntent, PaymentIntentRequest, PaymentIntentStatus, PaymentProcessor, RetrievedPaymentIntent,
    StripeError,
};
use fieldserver::billing::totals::LineItemInput;
use fieldserver::core::context::{CallerContext, CallerRole};
use fieldserver::core::effects::EffectRunner;
use fieldserver::core::shared::schema::{customers, jobs, technicians, tenants};
use fieldserver::core::shared::utils::{init_database, new_id, DbConn, DbPool};
use fieldserver::notifications::{NotificationOutcome, NotificationSender, TemplateKind, TemplateVars};

#[derive(QueryableByName)]
struct JournalMode {
    #[diesel(sql_type = Text)]
    journal_mode: String,
}

#[derive(QueryableByName)]
struct ForeignKeys {
    #[diesel(sql_type = Integer)]
    foreign_keys: i32,
}

#[derive(QueryableByName)]
struct BusyTimeout {
    #[diesel(sql_type = Integer, column_name = "timeout")]
    busy_timeout: i32,
}

pub struct TestDb {
    _dir: TempDir, // keep alive for the life of the test
    pub path: String,
    pub pool: DbPool,
}

impl TestDb {
    pub fn conn(&self) -> DbConn {
        self.pool.get().expect("pooled connection")
    }
}

pub fn setup_db() -> TestDb {
    let dir = TempDir::new().expect("tempdir");
    let mut p = PathBuf::from(dir.path());
    p.push("test.db");
    let path = p.to_string_lossy().to_string();

    let pool = init_database(&path, 8).expect("migrated pool");
    TestDb { _dir: dir, path, pool }
}

pub fn assert_sqlite_pragmas(conn: &mut SqliteConnection) {
    use diesel::sql_query;

    let jm: JournalMode = sql_query("PRAGMA journal_mode;").get_result(conn).unwrap();
    assert_eq!(jm.journal_mode.to_lowercase(), "wal");

    let fk: ForeignKeys = sql_query("PRAGMA foreign_keys;").get_result(conn).unwrap();
    assert_eq!(fk.foreign_keys, 1);

    let bt: BusyTimeout = sql_query("PRAGMA busy_timeout;").get_result(conn).unwrap();
    assert_eq!(bt.busy_timeout, 5000);
}

/// One tenant with a customer, a job for that customer and two technicians.
#[derive(Debug, Clone)]
pub struct Seed {
    pub tenant_id: String,
    pub customer_id: String,
    pub job_id: String,
    pub tech_a: String,
    pub tech_b: String,
}

impl Seed {
    pub fn ctx(&self) -> CallerContext {
        CallerContext::new(self.tenant_id.clone(), "dispatcher-1", CallerRole::Dispatcher)
    }
}

pub fn seed_tenant(conn: &mut SqliteConnection, timezone: &str) -> Seed {
    let tenant_id = new_id();
    diesel::insert_into(tenants::table)
        .values((
            tenants::id.eq(&tenant_id),
            tenants::name.eq("Acme Plumbing"),
            tenants::timezone.eq(timezone),
        ))
        .execute(conn)
        .unwrap();

    let customer_id = add_customer(conn, &tenant_id, "Dana Reyes");
    let job_id = add_job(conn, &tenant_id, &customer_id, "Water heater replacement");
    let tech_a = add_technician(conn, &tenant_id, "Sam", true);
    let tech_b = add_technician(conn, &tenant_id, "Alex", true);

    Seed {
        tenant_id,
        customer_id,
        job_id,
        tech_a,
        tech_b,
    }
}

pub fn add_customer(conn: &mut SqliteConnection, tenant_id: &str, name: &str) -> String {
    let id = new_id();
    diesel::insert_into(customers::table)
        .values((
            customers::id.eq(&id),
            customers::tenant_id.eq(tenant_id),
            customers::name.eq(name),
            customers::phone.eq(Some("+15550100")),
        ))
        .execute(conn)
        .unwrap();
    id
}

pub fn add_job(conn: &mut SqliteConnection, tenant_id: &str, customer_id: &str, title: &str) -> String {
    let id = new_id();
    diesel::insert_into(jobs::table)
        .values((
            jobs::id.eq(&id),
            jobs::tenant_id.eq(tenant_id),
            jobs::customer_id.eq(customer_id),
            jobs::title.eq(title),
        ))
        .execute(conn)
        .unwrap();
    id
}

pub fn add_technician(conn: &mut SqliteConnection, tenant_id: &str, name: &str, active: bool) -> String {
    let id = new_id();
    diesel::insert_into(technicians::table)
        .values((
            technicians::id.eq(&id),
            technicians::tenant_id.eq(tenant_id),
            technicians::name.eq(name),
            technicians::is_active.eq(active),
        ))
        .execute(conn)
        .unwrap();
    id
}

pub fn line(description: &str, quantity: f64, unit_price: i64) -> LineItemInput {
    LineItemInput {
        description: description.to_string(),
        quantity,
        unit_price,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentNotification {
    pub tenant_id: String,
    pub customer_id: String,
    pub template: TemplateKind,
    pub variables: TemplateVars,
}

/// Records every send and reports success.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<SentNotification>>,
}

impl RecordingNotifier {
    pub fn templates(&self) -> Vec<TemplateKind> {
        self.sent.lock().unwrap().iter().map(|n| n.template).collect()
    }

    pub fn count(&self, template: TemplateKind) -> usize {
        self.templates().into_iter().filter(|t| *t == template).count()
    }
}

#[async_trait::async_trait]
impl NotificationSender for RecordingNotifier {
    async fn send(
        &self,
        tenant_id: &str,
        customer_id: &str,
        template: TemplateKind,
        variables: &TemplateVars,
    ) -> NotificationOutcome {
        self.sent.lock().unwrap().push(SentNotification {
            tenant_id: tenant_id.to_string(),
            customer_id: customer_id.to_string(),
            template,
            variables: variables.clone(),
        });
        NotificationOutcome::delivered()
    }
}

/// Always fails, like an SMS gateway that is down.
#[derive(Debug, Default)]
pub struct FailingNotifier {
    pub attempts: AtomicUsize,
}

#[async_trait::async_trait]
impl NotificationSender for FailingNotifier {
    async fn send(
        &self,
        _tenant_id: &str,
        _customer_id: &str,
        _template: TemplateKind,
        _variables: &TemplateVars,
    ) -> NotificationOutcome {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        NotificationOutcome::failed("gateway unavailable")
    }
}

pub fn recording_runner(pool: &DbPool) -> (EffectRunner, Arc<RecordingNotifier>) {
    let notifier = Arc::new(RecordingNotifier::default());
    (EffectRunner::new(pool.clone(), notifier.clone()), notifier)
}

type CreateHook = Box<dyn FnOnce() + Send>;

/// In-memory payment processor.
#[derive(Default)]
pub struct FakeProcessor {
    pub created: Mutex<Vec<PaymentIntentRequest>>,
    pub canceled: Mutex<Vec<String>>,
    pub intents: Mutex<HashMap<String, RetrievedPaymentIntent>>,
    pub fail_create: bool,
    before_create: Mutex<Option<CreateHook>>,
    counter: AtomicUsize,
}

impl FakeProcessor {
    pub fn failing() -> Self {
        Self {
            fail_create: true,
            ..Self::default()
        }
    }

    /// Runs once, inside the next create call, before the intent exists.
    pub fn before_create(self, hook: impl FnOnce() + Send + 'static) -> Self {
        *self.before_create.lock().unwrap() = Some(Box::new(hook));
        self
    }

    pub fn set_status(&self, intent_id: &str, status: PaymentIntentStatus) {
        if let Some(intent) = self.intents.lock().unwrap().get_mut(intent_id) {
            intent.status = status;
        }
    }
}

#[async_trait::async_trait]
impl PaymentProcessor for FakeProcessor {
    async fn create_payment_intent(
        &self,
        request: &PaymentIntentRequest,
    ) -> Result<CreatedPaymentIntent, StripeError> {
        if self.fail_create {
            return Err(StripeError::NetworkError("connection reset".to_string()));
        }
        let hook = self.before_create.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let intent_id = format!("pi_fake_{n}");
        let client_secret = Some(format!("{intent_id}_secret"));

        self.created.lock().unwrap().push(request.clone());
        self.intents.lock().unwrap().insert(
            intent_id.clone(),
            RetrievedPaymentIntent {
                intent_id: intent_id.clone(),
                status: PaymentIntentStatus::RequiresPaymentMethod,
                amount: request.amount,
                client_secret: client_secret.clone(),
            },
        );
        Ok(CreatedPaymentIntent {
            intent_id,
            client_secret,
        })
    }

    async fn cancel_payment_intent(&self, intent_id: &str) -> Result<(), StripeError> {
        self.canceled.lock().unwrap().push(intent_id.to_string());
        self.set_status(intent_id, PaymentIntentStatus::Canceled);
        Ok(())
    }

    async fn get_payment_intent(&self, intent_id: &str) -> Result<RetrievedPaymentIntent, StripeError> {
        self.intents
            .lock()
            .unwrap()
            .get(intent_id)
            .cloned()
            .ok_or_else(|| StripeError::ApiError(format!("No such payment_intent: '{intent_id}'")))
    }
}

pub fn payment_intent_event(
    event_id: &str,
    event_type: &str,
    created: i64,
    intent_id: &str,
    amount: i64,
    metadata: serde_json::Value,
) -> String {
    serde_json::json!({
        "id": event_id,
        "type": event_type,
        "created": created,
        "data": {
            "object": {
                "id": intent_id,
                "object": "payment_intent",
                "amount": amount,
                "amount_received": if event_type == "payment_intent.succeeded" { amount } else { 0 },
                "currency": "usd",
                "status": if event_type == "payment_intent.succeeded" { "succeeded" } else { "requires_payment_method" },
                "client_secret": format!("{intent_id}_secret"),
                "metadata": metadata,
                "last_payment_error": if event_type == "payment_intent.payment_failed" {
                    serde_json::json!({ "code": "card_declined", "message": "Your card was declined." })
                } else {
                    serde_json::Value::Null
                }
            }
        }
    })
    .to_string()
}

pub fn subscription_event(
    event_id: &str,
    event_type: &str,
    created: i64,
    subscription_id: &str,
    status: &str,
    tenant_id: &str,
) -> String {
    serde_json::json!({
        "id": event_id,
        "type": event_type,
        "created": created,
        "data": {
            "object": {
                "id": subscription_id,
                "object": "subscription",
                "customer": "cus_123",
                "status": status,
                "current_period_end": created + 30 * 86_400,
                "metadata": { "tenant_id": tenant_id }
            }
        }
    })
    .to_string()
}

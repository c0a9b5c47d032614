mod common;

use common::{line, recording_runner, seed_tenant, setup_db};
use fieldserver::attribution::{
    advance_stage, get_record, mark_lost, record_call, AdvanceOutcome, FunnelLinks, FunnelStage, FunnelSubject,
};
use fieldserver::billing::estimates::{approve_estimate, convert_to_invoice, create_estimate, send_estimate, CreateEstimateInput};
use fieldserver::billing::invoices::{record_manual_payment, ManualPaymentInput};
use fieldserver::billing::status::PaymentMethod;
use fieldserver::calendar::scheduler::{create_appointment, update_status, AppointmentAction, CreateAppointmentInput};
use fieldserver::core::error::CoreError;

fn call(id: &str) -> FunnelSubject {
    FunnelSubject::Call(id.to_string())
}

#[test]
fn test_record_call_is_idempotent_while_open() {
    let db = setup_db();
    let mut conn = db.conn();
    let seed = seed_tenant(&mut conn, "UTC");

    let first = record_call(&mut conn, &seed.tenant_id, "call-1", None, Some(25000)).unwrap();
    let again = record_call(&mut conn, &seed.tenant_id, "call-1", None, None).unwrap();

    assert_eq!(first.id, again.id);
    assert_eq!(first.stage, "call_received");
    assert_eq!(again.estimated_value, Some(25000));

    let err = record_call(&mut conn, &seed.tenant_id, "  ", None, None).unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
}

#[test]
fn test_linkage_is_first_writer_wins() {
    let db = setup_db();
    let mut conn = db.conn();
    let seed = seed_tenant(&mut conn, "UTC");
    record_call(&mut conn, &seed.tenant_id, "call-2", None, None).unwrap();

    let outcome = advance_stage(
        &mut conn,
        &seed.tenant_id,
        &call("call-2"),
        FunnelStage::LeadCreated,
        None,
        &FunnelLinks::new(Some(seed.customer_id.clone()), Some(seed.job_id.clone())),
    )
    .unwrap();
    let AdvanceOutcome::Advanced { record } = outcome else {
        panic!("expected advance, got {outcome:?}");
    };
    assert_eq!(record.stage, "lead_created");
    assert_eq!(record.job_id.as_deref(), Some(seed.job_id.as_str()));

    let outcome = advance_stage(
        &mut conn,
        &seed.tenant_id,
        &call("call-2"),
        FunnelStage::QuoteSent,
        Some(9201),
        &FunnelLinks::new(Some("someone-else".to_string()), Some("other-job".to_string())),
    )
    .unwrap();
    let AdvanceOutcome::Advanced { record } = outcome else {
        panic!("expected advance, got {outcome:?}");
    };
    assert_eq!(record.customer_id.as_deref(), Some(seed.customer_id.as_str()));
    assert_eq!(record.job_id.as_deref(), Some(seed.job_id.as_str()));
    assert_eq!(record.estimated_value, Some(9201));
}

#[test]
fn test_regression_is_ignored() {
    let db = setup_db();
    let mut conn = db.conn();
    let seed = seed_tenant(&mut conn, "UTC");
    let opened = record_call(&mut conn, &seed.tenant_id, "call-3", None, None).unwrap();
    let links = FunnelLinks::default();

    let _ = advance_stage(&mut conn, &seed.tenant_id, &call("call-3"), FunnelStage::JobScheduled, None, &links).unwrap();
    let outcome = advance_stage(&mut conn, &seed.tenant_id, &call("call-3"), FunnelStage::QuoteSent, None, &links).unwrap();

    match outcome {
        AdvanceOutcome::Ignored { current, requested, .. } => {
            assert_eq!(current, FunnelStage::JobScheduled);
            assert_eq!(requested, FunnelStage::QuoteSent);
        }
        other => panic!("expected ignored, got {other:?}"),
    }
    assert_eq!(get_record(&mut conn, &seed.tenant_id, &opened.id).unwrap().stage, "job_scheduled");

    let repeat = advance_stage(&mut conn, &seed.tenant_id, &call("call-3"), FunnelStage::JobScheduled, None, &links).unwrap();
    assert!(matches!(repeat, AdvanceOutcome::Unchanged { .. }));
}

#[test]
fn test_lost_closes_the_record() {
    let db = setup_db();
    let mut conn = db.conn();
    let seed = seed_tenant(&mut conn, "UTC");
    let opened = record_call(&mut conn, &seed.tenant_id, "call-4", None, None).unwrap();

    let lost = mark_lost(&mut conn, &seed.tenant_id, &call("call-4")).unwrap();
    assert!(matches!(lost, AdvanceOutcome::Advanced { .. }));

    let later = advance_stage(
        &mut conn,
        &seed.tenant_id,
        &call("call-4"),
        FunnelStage::QuoteSent,
        None,
        &FunnelLinks::default(),
    )
    .unwrap();
    assert!(matches!(later, AdvanceOutcome::NoOpenRecord));
    assert_eq!(get_record(&mut conn, &seed.tenant_id, &opened.id).unwrap().stage, "lost");

    let reopened = record_call(&mut conn, &seed.tenant_id, "call-4", None, None).unwrap();
    assert_ne!(reopened.id, opened.id);
}

#[test]
fn test_advance_without_record_is_a_no_op() {
    let db = setup_db();
    let mut conn = db.conn();
    let seed = seed_tenant(&mut conn, "UTC");

    let outcome = advance_stage(
        &mut conn,
        &seed.tenant_id,
        &FunnelSubject::Job(seed.job_id.clone()),
        FunnelStage::JobScheduled,
        None,
        &FunnelLinks::default(),
    )
    .unwrap();
    assert!(matches!(outcome, AdvanceOutcome::NoOpenRecord));
}

#[test]
fn test_records_are_tenant_scoped() {
    let db = setup_db();
    let mut conn = db.conn();
    let seed = seed_tenant(&mut conn, "UTC");
    let other = seed_tenant(&mut conn, "UTC");
    let opened = record_call(&mut conn, &seed.tenant_id, "call-5", None, None).unwrap();

    let err = get_record(&mut conn, &other.tenant_id, &opened.id).unwrap_err();
    assert!(matches!(err, CoreError::NotFound(_)));
    let outcome = mark_lost(&mut conn, &other.tenant_id, &call("call-5")).unwrap();
    assert!(matches!(outcome, AdvanceOutcome::NoOpenRecord));
}

#[tokio::test]
async fn test_funnel_follows_job_from_quote_to_payment() {
    let db = setup_db();
    let seed = seed_tenant(&mut db.conn(), "UTC");
    let ctx = seed.ctx();
    let (runner, _notifier) = recording_runner(&db.pool);

    let opened = record_call(&mut db.conn(), &seed.tenant_id, "call-6", None, None).unwrap();
    let _ = advance_stage(
        &mut db.conn(),
        &seed.tenant_id,
        &call("call-6"),
        FunnelStage::LeadCreated,
        None,
        &FunnelLinks::new(Some(seed.customer_id.clone()), Some(seed.job_id.clone())),
    )
    .unwrap();
    let stage = || get_record(&mut db.conn(), &seed.tenant_id, &opened.id).unwrap();

    let estimate = create_estimate(
        &mut db.conn(),
        &ctx,
        CreateEstimateInput {
            customer_id: seed.customer_id.clone(),
            job_id: Some(seed.job_id.clone()),
            tax_rate_bps: 825,
            line_items: vec![line("Drain cleaning", 1.0, 8500)],
            notes: None,
        },
    )
    .unwrap();
    let estimate_id = estimate.estimate.id.clone();

    runner.complete(send_estimate(&mut db.conn(), &ctx, &estimate_id).unwrap()).await;
    let record = stage();
    assert_eq!(record.stage, "quote_sent");
    assert_eq!(record.estimated_value, Some(9201));

    runner.complete(approve_estimate(&mut db.conn(), &ctx, &estimate_id).unwrap()).await;
    assert_eq!(stage().stage, "quote_approved");

    let start = chrono::NaiveDate::from_ymd_opt(2026, 10, 19)
        .unwrap()
        .and_hms_opt(10, 0, 0)
        .unwrap();
    let appt = runner
        .complete(
            create_appointment(
                &mut db.conn(),
                &ctx,
                CreateAppointmentInput {
                    job_id: seed.job_id.clone(),
                    technician_id: Some(seed.tech_a.clone()),
                    start_time: start,
                    end_time: None,
                    duration_minutes: Some(120),
                    notes: None,
                },
            )
            .unwrap(),
        )
        .await;
    assert_eq!(stage().stage, "job_scheduled");

    runner.complete(update_status(&mut db.conn(), &ctx, &appt.id, AppointmentAction::Start).unwrap()).await;
    runner.complete(update_status(&mut db.conn(), &ctx, &appt.id, AppointmentAction::Complete).unwrap()).await;
    assert_eq!(stage().stage, "job_completed");

    let conversion = convert_to_invoice(&mut db.conn(), &ctx, &estimate_id).unwrap();
    let payment = record_manual_payment(
        &mut db.conn(),
        &ctx,
        &conversion.invoice.invoice.id,
        ManualPaymentInput {
            amount: 9201,
            method: PaymentMethod::Card,
            note: None,
        },
    )
    .unwrap();
    runner.complete(payment).await;

    let record = stage();
    assert_eq!(record.stage, "payment_collected");
    assert_eq!(record.actual_value, Some(9201));
}

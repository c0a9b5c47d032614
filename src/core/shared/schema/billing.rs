use crate::core::shared::schema::core::{customers, jobs};

diesel::table! {
    estimates (id) {
        id -> Text,
        tenant_id -> Text,
        customer_id -> Text,
        job_id -> Nullable<Text>,
        estimate_number -> Text,
        status -> Text,
        tax_rate_bps -> Integer,
        subtotal -> BigInt,
        tax_amount -> BigInt,
        total -> BigInt,
        notes -> Nullable<Text>,
        deposit_requested -> Bool,
        deposit_invoice_id -> Nullable<Text>,
        deposit_requested_at -> Nullable<Timestamp>,
        converted_invoice_id -> Nullable<Text>,
        sent_at -> Nullable<Timestamp>,
        approved_at -> Nullable<Timestamp>,
        declined_at -> Nullable<Timestamp>,
        voided_at -> Nullable<Timestamp>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    estimate_line_items (id) {
        id -> Text,
        estimate_id -> Text,
        tenant_id -> Text,
        description -> Text,
        quantity -> Double,
        unit_price -> BigInt,
        line_total -> BigInt,
        sort_order -> Integer,
    }
}

diesel::table! {
    invoices (id) {
        id -> Text,
        tenant_id -> Text,
        customer_id -> Text,
        job_id -> Nullable<Text>,
        estimate_id -> Nullable<Text>,
        invoice_number -> Text,
        status -> Text,
        tax_rate_bps -> Integer,
        subtotal -> BigInt,
        tax_amount -> BigInt,
        total -> BigInt,
        paid_amount -> BigInt,
        is_deposit -> Bool,
        payment_intent_id -> Nullable<Text>,
        notes -> Nullable<Text>,
        sent_at -> Nullable<Timestamp>,
        paid_at -> Nullable<Timestamp>,
        voided_at -> Nullable<Timestamp>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    invoice_line_items (id) {
        id -> Text,
        invoice_id -> Text,
        tenant_id -> Text,
        description -> Text,
        quantity -> Double,
        unit_price -> BigInt,
        line_total -> BigInt,
        sort_order -> Integer,
    }
}

diesel::table! {
    payments (id) {
        id -> Text,
        tenant_id -> Text,
        invoice_id -> Text,
        customer_id -> Text,
        amount -> BigInt,
        method -> Text,
        status -> Text,
        payment_intent_id -> Nullable<Text>,
        note -> Nullable<Text>,
        processed_at -> Timestamp,
        created_at -> Timestamp,
    }
}

diesel::table! {
    provider_subscriptions (id) {
        id -> Text,
        tenant_id -> Text,
        provider_subscription_id -> Text,
        status -> Text,
        current_period_end -> Nullable<Timestamp>,
        last_event_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    webhook_events (event_id) {
        event_id -> Text,
        event_type -> Text,
        subject_id -> Nullable<Text>,
        event_created_at -> Timestamp,
        outcome -> Text,
        processed_at -> Timestamp,
    }
}

diesel::joinable!(estimates -> customers (customer_id));
diesel::joinable!(estimates -> jobs (job_id));
diesel::joinable!(estimate_line_items -> estimates (estimate_id));
diesel::joinable!(invoices -> customers (customer_id));
diesel::joinable!(invoices -> jobs (job_id));
diesel::joinable!(invoice_line_items -> invoices (invoice_id));
diesel::joinable!(payments -> invoices (invoice_id));

use crate::core::shared::schema::core::{customers, jobs, technicians};

diesel::table! {
    business_hours (tenant_id, weekday) {
        tenant_id -> Text,
        weekday -> Integer,
        open_minute -> Integer,
        close_minute -> Integer,
        is_closed -> Bool,
    }
}

diesel::table! {
    appointments (id) {
        id -> Text,
        tenant_id -> Text,
        job_id -> Text,
        customer_id -> Text,
        technician_id -> Nullable<Text>,
        start_time -> Timestamp,
        end_time -> Timestamp,
        status -> Text,
        notes -> Nullable<Text>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::joinable!(appointments -> jobs (job_id));
diesel::joinable!(appointments -> customers (customer_id));
diesel::joinable!(appointments -> technicians (technician_id));

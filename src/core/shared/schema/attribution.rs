diesel::table! {
    attribution_records (id) {
        id -> Text,
        tenant_id -> Text,
        call_id -> Text,
        customer_id -> Nullable<Text>,
        job_id -> Nullable<Text>,
        stage -> Text,
        stage_changed_at -> Timestamp,
        estimated_value -> Nullable<BigInt>,
        actual_value -> Nullable<BigInt>,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

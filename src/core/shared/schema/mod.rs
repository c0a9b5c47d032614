pub mod attribution;
pub mod billing;
pub mod calendar;
pub mod core;

pub use self::attribution::*;
pub use self::billing::*;
pub use self::calendar::*;
pub use self::core::*;

diesel::allow_tables_to_appear_in_same_query!(
    tenants,
    customers,
    technicians,
    jobs,
    business_hours,
    estimates,
    estimate_line_items,
    invoices,
    invoice_line_items,
    payments,
    provider_subscriptions,
    webhook_events,
    appointments,
    attribution_records,
);

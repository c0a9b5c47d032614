#[derive(Debug)]
pub struct ApiUrls;

impl ApiUrls {
    // Estimates
    pub const ESTIMATES: &'static str = "/api/estimates";
    pub const ESTIMATE_BY_ID: &'static str = "/api/estimates/{id}";
    pub const ESTIMATE_SEND: &'static str = "/api/estimates/{id}/send";
    pub const ESTIMATE_APPROVE: &'static str = "/api/estimates/{id}/approve";
    pub const ESTIMATE_DECLINE: &'static str = "/api/estimates/{id}/decline";
    pub const ESTIMATE_VOID: &'static str = "/api/estimates/{id}/void";
    pub const ESTIMATE_CONVERT: &'static str = "/api/estimates/{id}/convert";
    pub const ESTIMATE_DEPOSIT: &'static str = "/api/estimates/{id}/deposit";

    // Invoices
    pub const INVOICES: &'static str = "/api/invoices";
    pub const INVOICE_BY_ID: &'static str = "/api/invoices/{id}";
    pub const INVOICE_SEND: &'static str = "/api/invoices/{id}/send";
    pub const INVOICE_VOID: &'static str = "/api/invoices/{id}/void";
    pub const INVOICE_VIEWED: &'static str = "/api/invoices/{id}/viewed";
    pub const INVOICE_OVERDUE: &'static str = "/api/invoices/{id}/overdue";
    pub const INVOICE_PAYMENTS: &'static str = "/api/invoices/{id}/payments";
    pub const INVOICE_PAYMENT_INTENT: &'static str = "/api/invoices/{id}/payment-intent";

    // Scheduling
    pub const AVAILABILITY: &'static str = "/api/appointments/availability";
    pub const APPOINTMENTS: &'static str = "/api/appointments";
    pub const APPOINTMENT_BY_ID: &'static str = "/api/appointments/{id}";
    pub const APPOINTMENT_RESCHEDULE: &'static str = "/api/appointments/{id}/reschedule";
    pub const APPOINTMENT_STATUS: &'static str = "/api/appointments/{id}/status";

    // Attribution
    pub const ATTRIBUTION_CALLS: &'static str = "/api/attribution/calls";
    pub const ATTRIBUTION_ADVANCE: &'static str = "/api/attribution/advance";
    pub const ATTRIBUTION_LOST: &'static str = "/api/attribution/lost";
    pub const ATTRIBUTION_BY_ID: &'static str = "/api/attribution/{id}";

    // Provider webhooks
    pub const STRIPE_WEBHOOK: &'static str = "/api/webhooks/stripe";

    pub const HEALTH: &'static str = "/health";
}

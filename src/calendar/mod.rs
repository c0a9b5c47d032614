//! Business hours, appointment scheduling and job status mirroring.

pub mod api;
pub mod hours;
pub mod jobs;
pub mod scheduler;

pub use api::configure_calendar_routes;
pub use scheduler::{Appointment, AppointmentAction, AppointmentStatus, Availability};

pub mod api_router;
pub mod attribution;
pub mod billing;
pub mod calendar;
pub mod core;
pub mod notifications;

pub use crate::core::config::AppConfig;
pub use crate::core::error::{CoreError, CoreResult};
pub use crate::core::shared::state::AppState;

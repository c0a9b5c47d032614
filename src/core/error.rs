use axum::{response::IntoResponse, Json};
use chrono::NaiveDateTime;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use serde::Serialize;

pub type CoreResult<T> = Result<T, CoreError>;

/// The booking that blocked a create or reschedule.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConflictingAppointment {
    pub id: String,
    pub technician_id: Option<String>,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub status: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Cannot {action} {entity} in status '{status}'")]
    StateConflict {
        entity: &'static str,
        status: String,
        action: &'static str,
    },
    #[error("Appointment conflicts with existing appointment {}", .conflicting.id)]
    AppointmentConflict { conflicting: ConflictingAppointment },
    #[error("Transient conflict: {0}")]
    TransientConflict(String),
    #[error("External dependency failure: {0}")]
    External(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn not_found(entity: &str, id: &str) -> Self {
        Self::NotFound(format!("{entity} {id}"))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientConflict(_))
    }
}

impl From<DieselError> for CoreError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::NotFound => Self::NotFound("record".to_string()),
            DieselError::DatabaseError(kind, info) => {
                let message = info.message().to_string();
                match kind {
                    DatabaseErrorKind::SerializationFailure | DatabaseErrorKind::UniqueViolation => {
                        Self::TransientConflict(message)
                    }
                    _ if is_lock_contention(&message) => Self::TransientConflict(message),
                    _ => Self::Internal(format!("database error: {message}")),
                }
            }
            other => Self::Internal(format!("database error: {other}")),
        }
    }
}

impl From<diesel::r2d2::PoolError> for CoreError {
    fn from(err: diesel::r2d2::PoolError) -> Self {
        Self::Internal(format!("connection pool: {err}"))
    }
}

impl From<tokio::task::JoinError> for CoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("blocking task failed: {err}"))
    }
}

fn is_lock_contention(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("database is locked") || lower.contains("database table is locked") || lower.contains("busy")
}

impl IntoResponse for CoreError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;
        let message = self.to_string();
        match self {
            Self::Validation(_) => {
                (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": message }))).into_response()
            }
            Self::NotFound(_) => {
                (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": message }))).into_response()
            }
            Self::StateConflict { .. } => {
                (StatusCode::CONFLICT, Json(serde_json::json!({ "error": message }))).into_response()
            }
            Self::AppointmentConflict { conflicting } => (
                StatusCode::CONFLICT,
                Json(serde_json::json!({ "error": message, "conflicting": conflicting })),
            )
                .into_response(),
            Self::TransientConflict(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": message, "retryable": true })),
            )
                .into_response(),
            Self::External(_) => {
                (StatusCode::BAD_GATEWAY, Json(serde_json::json!({ "error": message }))).into_response()
            }
            Self::Internal(_) => {
                tracing::error!("Internal error surfaced to caller: {message}");
                (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": message })))
                    .into_response()
            }
        }
    }
}

//! Resolved caller identity.
//!
//! Authentication happens upstream; by the time a request reaches the core it
//! carries an already-resolved tenant, caller and role. Every operation takes a
//! [`CallerContext`] and scopes all reads and writes to `tenant_id`.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use serde::{Deserialize, Serialize};

use crate::core::error::CoreError;

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const CALLER_HEADER: &str = "x-caller-id";
pub const ROLE_HEADER: &str = "x-caller-role";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallerRole {
    Owner,
    Admin,
    Dispatcher,
    Technician,
}

impl CallerRole {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "owner" => Some(Self::Owner),
            "admin" => Some(Self::Admin),
            "dispatcher" => Some(Self::Dispatcher),
            "technician" => Some(Self::Technician),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Admin => "admin",
            Self::Dispatcher => "dispatcher",
            Self::Technician => "technician",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallerContext {
    pub tenant_id: String,
    pub caller_id: String,
    pub role: CallerRole,
}

impl CallerContext {
    pub fn new(tenant_id: impl Into<String>, caller_id: impl Into<String>, role: CallerRole) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            caller_id: caller_id.into(),
            role,
        }
    }
}

impl<S> FromRequestParts<S> for CallerContext
where
    S: Send + Sync,
{
    type Rejection = CoreError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from)
        };

        let tenant_id = header(TENANT_HEADER)
            .ok_or_else(|| CoreError::Validation(format!("missing {TENANT_HEADER} header")))?;
        let caller_id = header(CALLER_HEADER).unwrap_or_else(|| "anonymous".to_string());
        let role = match header(ROLE_HEADER) {
            Some(raw) => CallerRole::parse(&raw)
                .ok_or_else(|| CoreError::Validation(format!("unknown caller role '{raw}'")))?,
            None => CallerRole::Dispatcher,
        };

        Ok(Self {
            tenant_id,
            caller_id,
            role,
        })
    }
}

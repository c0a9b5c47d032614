//! Closed status enums with a central table of permitted moves.
//!
//! Each entity status implements [`Lifecycle`] by listing, for every state,
//! the states it may move to. Operations never compare status strings
//! directly; they call [`ensure_transition`] and get a
//! [`CoreError::StateConflict`] when the table has no such edge.

use std::fmt::Debug;

use crate::core::error::{CoreError, CoreResult};

pub trait Lifecycle: Copy + Eq + Debug + Sized + 'static {
    /// Entity name used in state-conflict errors.
    const ENTITY: &'static str;

    fn as_str(&self) -> &'static str;

    fn parse(value: &str) -> Option<Self>;

    fn next_states(&self) -> &'static [Self];

    fn is_terminal(&self) -> bool {
        self.next_states().is_empty()
    }

    fn can_transition_to(&self, next: Self) -> bool {
        self.next_states().contains(&next)
    }
}

pub fn ensure_transition<S: Lifecycle>(from: S, to: S, action: &'static str) -> CoreResult<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(CoreError::StateConflict {
            entity: S::ENTITY,
            status: from.as_str().to_string(),
            action,
        })
    }
}

/// Parse a stored status column; an unknown value means the row was written
/// outside this service and is treated as an internal error.
pub fn parse_stored<S: Lifecycle>(value: &str) -> CoreResult<S> {
    S::parse(value)
        .ok_or_else(|| CoreError::Internal(format!("unknown {} status '{value}'", S::ENTITY)))
}

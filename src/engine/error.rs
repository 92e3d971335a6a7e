use thiserror::Error;
use ulid::Ulid;

use crate::model::{ItemId, Reservation};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("item {item_id} is already {} from {}", occupied_as(.existing), .existing.range)]
    Conflict {
        item_id: ItemId,
        existing: Box<Reservation>,
    },
    #[error("reservation not found: {0}")]
    NotFound(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("persistence error: {0}")]
    Persistence(String),
}

impl EngineError {
    /// The reservation that blocked a conflicting request, if any.
    pub fn conflicting(&self) -> Option<&Reservation> {
        match self {
            EngineError::Conflict { existing, .. } => Some(existing),
            _ => None,
        }
    }
}

fn occupied_as(existing: &Reservation) -> &'static str {
    if existing.is_hold { "blocked" } else { "booked" }
}

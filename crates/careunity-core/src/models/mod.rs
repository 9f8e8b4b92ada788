//! Data models for CareUnity sync

mod conflict;
mod entity;
mod operation;

pub use conflict::{Conflict, ConflictId, ConflictStatus};
pub use entity::{
    parse_timestamp, Entity, EntityId, EntityKey, EntityType, TEMPORARY_ID_PREFIX,
    UPDATED_AT_FIELD,
};
pub use operation::{OperationAction, OperationId, OperationStatus, PendingOperation};

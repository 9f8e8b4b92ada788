//! careunity-core - Offline sync core for CareUnity clients
//!
//! This crate contains the models, device-local store, operation queue,
//! conflict resolver and sync engine shared by every CareUnity front-end.
//! Edits are recorded locally first and reconciled with the authoritative
//! server whenever the device is online.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod network;
pub mod queue;
pub mod remote;
pub mod resolver;
pub mod services;
pub mod status;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
pub use models::{Conflict, ConflictId, Entity, EntityId, EntityType, OperationId, PendingOperation};

//! Database layer for the device-local store

mod connection;
mod migrations;
mod repository;

pub use connection::Database;
pub use repository::{Collection, LibSqlRecordRepository, Record, RecordRepository, WriteBatch};

//! Services shared by the sync engine and client front-ends

mod local_store;
mod recorder;

pub use local_store::LocalStore;
pub use recorder::ChangeRecorder;

//! Database initialization and write-retry helpers

pub mod init;
pub mod retry;

pub use init::{init_database, SCHEMA_VERSION};
pub use retry::{retry_on_lock, LockContention};

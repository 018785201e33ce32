//! Backend implementations for WorkQueueStore
//!
//! - `sqlite`: SQLite-based backend (default, requires `sqlite` feature)

#[cfg(feature = "sqlite")]
pub mod sqlite;

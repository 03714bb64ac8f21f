//! rollcall-store: SQLite persistence for the rollcall engine.
//!
//! The attendance table carries `UNIQUE(identity_id, date)`; the write-once
//! daily slot is enforced by the database, not by a read before the write.

mod codec;
pub mod notifier;
mod schema;
pub mod sqlite;

pub use notifier::StoreNotifier;
pub use sqlite::{Notification, SqliteStore, SqliteStoreError, StoreCounts};

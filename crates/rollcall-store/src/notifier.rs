use crate::sqlite::SqliteStore;
use rollcall_core::notify::attendance_message;
use rollcall_core::{AttendanceStatus, IdentityDirectory, Notifier, NotifyError, StoreError};
use std::sync::Arc;

/// Persists an unread notification row for each committed attendance record.
/// Ids missing from the identity directory have no recipient and are skipped.
pub struct StoreNotifier {
    store: Arc<SqliteStore>,
}

impl StoreNotifier {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self { store }
    }
}

impl Notifier for StoreNotifier {
    fn notify(&self, identity_id: &str, status: AttendanceStatus) -> Result<(), NotifyError> {
        if self.store.get_identity(identity_id)?.is_none() {
            tracing::debug!(identity_id, "no such identity; notification skipped");
            return Ok(());
        }
        let message = attendance_message(status);
        self.store
            .insert_notification(identity_id, &message)
            .map_err(StoreError::from)?;
        tracing::debug!(identity_id, %status, "notification stored");
        Ok(())
    }
}

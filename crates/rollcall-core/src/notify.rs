//! Best-effort notification hook fired once per newly committed record.

use crate::store::StoreError;
use crate::types::AttendanceStatus;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub trait Notifier {
    fn notify(&self, identity_id: &str, status: AttendanceStatus) -> Result<(), NotifyError>;
}

impl<T: Notifier + ?Sized> Notifier for Arc<T> {
    fn notify(&self, identity_id: &str, status: AttendanceStatus) -> Result<(), NotifyError> {
        (**self).notify(identity_id, status)
    }
}

/// Message delivered to a person whose attendance was just recorded.
pub fn attendance_message(status: AttendanceStatus) -> String {
    format!("Your attendance has been marked as {status}.")
}

/// Notifier that only emits a log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, identity_id: &str, status: AttendanceStatus) -> Result<(), NotifyError> {
        tracing::info!(identity_id, %status, message = %attendance_message(status), "notification");
        Ok(())
    }
}

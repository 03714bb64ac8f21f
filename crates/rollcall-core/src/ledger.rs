//! Attendance ledger: one write-once record per identity per calendar day.
//!
//! Each identity in a batch is committed as its own unit of work through
//! [`AttendanceStore::insert_if_absent`]. A batch interrupted midway leaves
//! the already-committed identities in place and is safe to retry.

use crate::notify::Notifier;
use crate::store::{AttendanceStore, InsertOutcome, StoreError};
use crate::types::{AttendanceRecord, AttendanceStatus};
use chrono::{NaiveDateTime, NaiveTime};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Format of [`AttendanceRecord::time`].
pub const TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error(
        "attendance already marked today for every requested identity: {}",
        .already_marked.join(", ")
    )]
    AllAlreadyMarked { already_marked: Vec<String> },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of a recording call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MarkOutcome {
    /// Records committed by this call.
    pub recorded: Vec<AttendanceRecord>,
    /// Identities that already had a record for the day; left untouched.
    pub already_marked: Vec<String>,
}

/// Default lateness cutoff, 09:00 local time.
pub fn default_late_cutoff() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default()
}

/// `LATE` strictly after the cutoff, `PRESENT` otherwise.
pub fn derive_status(time: NaiveTime, late_cutoff: NaiveTime) -> AttendanceStatus {
    if time > late_cutoff {
        AttendanceStatus::Late
    } else {
        AttendanceStatus::Present
    }
}

pub struct Ledger<S, N> {
    store: Arc<S>,
    notifier: N,
    late_cutoff: NaiveTime,
}

impl<S, N> Ledger<S, N>
where
    S: AttendanceStore,
    N: Notifier,
{
    pub fn new(store: Arc<S>, notifier: N) -> Self {
        Self {
            store,
            notifier,
            late_cutoff: default_late_cutoff(),
        }
    }

    pub fn with_late_cutoff(mut self, late_cutoff: NaiveTime) -> Self {
        self.late_cutoff = late_cutoff;
        self
    }

    pub fn late_cutoff(&self) -> NaiveTime {
        self.late_cutoff
    }

    /// Vision-driven path: status is `PRESENT` or `LATE` depending on `now`.
    pub fn record_automatic(
        &self,
        identity_ids: &[String],
        now: NaiveDateTime,
    ) -> Result<MarkOutcome, LedgerError> {
        let status = derive_status(now.time(), self.late_cutoff);
        self.commit(identity_ids.iter().map(|id| (id.as_str(), status)), now)
    }

    /// Roll-call path: presence was adjudicated by the caller. The record date is
    /// the processing date of `today`.
    pub fn record_manual(
        &self,
        entries: &[(String, bool)],
        today: NaiveDateTime,
    ) -> Result<MarkOutcome, LedgerError> {
        let entries = entries.iter().map(|(id, present)| {
            let status = if *present {
                AttendanceStatus::Present
            } else {
                AttendanceStatus::Absent
            };
            (id.as_str(), status)
        });
        self.commit(entries, today)
    }

    fn commit<'a>(
        &self,
        entries: impl IntoIterator<Item = (&'a str, AttendanceStatus)>,
        now: NaiveDateTime,
    ) -> Result<MarkOutcome, LedgerError> {
        let date = now.date();
        let time = now.format(TIME_FORMAT).to_string();
        let mut outcome = MarkOutcome::default();
        let mut requested = 0usize;

        for (identity_id, status) in entries {
            requested += 1;
            let record = AttendanceRecord {
                identity_id: identity_id.to_string(),
                date,
                time: time.clone(),
                status,
            };
            match self.store.insert_if_absent(&record)? {
                InsertOutcome::Inserted => {
                    tracing::info!(identity_id, %date, %status, "attendance recorded");
                    if let Err(err) = self.notifier.notify(identity_id, status) {
                        tracing::warn!(
                            identity_id,
                            error = %err,
                            "notification failed; record kept"
                        );
                    }
                    outcome.recorded.push(record);
                }
                InsertOutcome::AlreadyExists => {
                    tracing::debug!(identity_id, %date, "attendance already marked");
                    outcome.already_marked.push(record.identity_id);
                }
            }
        }

        if requested > 0 && outcome.recorded.is_empty() {
            return Err(LedgerError::AllAlreadyMarked {
                already_marked: outcome.already_marked,
            });
        }
        Ok(outcome)
    }
}

//! Read-only views over committed attendance records.

use crate::store::{AttendanceStore, IdentityDirectory, StoreError};
use crate::types::{AttendanceRecord, AttendanceStatus};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Record selection. Date bounds are inclusive whole days: `from` starts at its
/// midnight and `to` runs through its last instant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFilter {
    #[serde(default)]
    pub identity_id: Option<String>,
    #[serde(default)]
    pub status: Option<AttendanceStatus>,
    #[serde(default)]
    pub from: Option<NaiveDate>,
    #[serde(default)]
    pub to: Option<NaiveDate>,
}

impl RecordFilter {
    pub fn for_identity(identity_id: impl Into<String>) -> Self {
        Self {
            identity_id: Some(identity_id.into()),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: AttendanceStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn between(mut self, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    pub fn matches(&self, record: &AttendanceRecord) -> bool {
        self.identity_id
            .as_deref()
            .map_or(true, |id| record.identity_id == id)
            && self.status.map_or(true, |s| record.status == s)
            && self.from.map_or(true, |from| record.date >= from)
            && self.to.map_or(true, |to| record.date <= to)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCount {
    pub status: AttendanceStatus,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyStats {
    pub date: NaiveDate,
    pub statuses: Vec<StatusCount>,
    pub total: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceStats {
    pub status_counts: Vec<StatusCount>,
    /// Ascending by date.
    pub daily: Vec<DailyStats>,
}

/// A report row: the record plus the identity's display name, if still known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRow {
    #[serde(flatten)]
    pub record: AttendanceRecord,
    pub name: Option<String>,
}

fn counts_of<'a>(records: impl IntoIterator<Item = &'a AttendanceRecord>) -> Vec<StatusCount> {
    let mut counts: BTreeMap<AttendanceStatus, u64> = BTreeMap::new();
    for r in records {
        *counts.entry(r.status).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|(status, count)| StatusCount { status, count })
        .collect()
}

/// Count records per status. Statuses with no records are omitted.
pub fn status_counts(records: &[AttendanceRecord]) -> Vec<StatusCount> {
    counts_of(records)
}

/// Count records per day, then per status, ascending by day.
pub fn daily_counts(records: &[AttendanceRecord]) -> Vec<DailyStats> {
    let mut by_day: BTreeMap<NaiveDate, Vec<&AttendanceRecord>> = BTreeMap::new();
    for r in records {
        by_day.entry(r.date).or_default().push(r);
    }
    by_day
        .into_iter()
        .map(|(date, day)| DailyStats {
            date,
            total: day.len() as u64,
            statuses: counts_of(day),
        })
        .collect()
}

fn newest_first(records: &mut [AttendanceRecord]) {
    records.sort_by(|a, b| {
        b.date
            .cmp(&a.date)
            .then_with(|| b.time.cmp(&a.time))
            .then_with(|| a.identity_id.cmp(&b.identity_id))
    });
}

/// Query facade over a store.
pub struct Reports<S> {
    store: Arc<S>,
}

impl<S> Reports<S>
where
    S: AttendanceStore + IdentityDirectory,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Records of one identity, newest first.
    pub fn history(
        &self,
        identity_id: &str,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let filter = RecordFilter::for_identity(identity_id).between(from, to);
        let mut records = self.store.query_records(&filter)?;
        newest_first(&mut records);
        Ok(records)
    }

    /// Filtered records with display names, newest first.
    pub fn report(&self, filter: &RecordFilter) -> Result<Vec<ReportRow>, StoreError> {
        let mut records = self.store.query_records(filter)?;
        newest_first(&mut records);

        let mut names: HashMap<String, Option<String>> = HashMap::new();
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            let name = match names.get(&record.identity_id) {
                Some(name) => name.clone(),
                None => {
                    let name = self
                        .store
                        .get_identity(&record.identity_id)?
                        .map(|identity| identity.name);
                    names.insert(record.identity_id.clone(), name.clone());
                    name
                }
            };
            rows.push(ReportRow { record, name });
        }
        Ok(rows)
    }

    /// Status totals and per-day breakdown over an inclusive date range.
    pub fn stats(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<AttendanceStats, StoreError> {
        let records = self
            .store
            .query_records(&RecordFilter::default().between(from, to))?;
        Ok(AttendanceStats {
            status_counts: status_counts(&records),
            daily: daily_counts(&records),
        })
    }
}

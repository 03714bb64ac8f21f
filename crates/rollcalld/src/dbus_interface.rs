use crate::config::Config;
use crate::engine::{EngineError, EngineHandle};
use chrono::{Local, NaiveDate};
use rollcall_core::{Descriptor, Identity, RecordFilter, RegistryError, Role};
use serde::Serialize;
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
///
/// Structured results are returned as JSON strings.
pub struct AttendanceService {
    engine: EngineHandle,
    match_threshold: f32,
    descriptor_dim: usize,
    late_cutoff: String,
}

impl AttendanceService {
    pub fn new(engine: EngineHandle, config: &Config) -> Self {
        Self {
            engine,
            match_threshold: config.match_threshold,
            descriptor_dim: config.descriptor_dim,
            late_cutoff: config.late_cutoff.format("%H:%M:%S").to_string(),
        }
    }
}

fn to_fdo(err: EngineError) -> fdo::Error {
    match err {
        EngineError::Registry(
            RegistryError::InvalidDescriptor { .. } | RegistryError::UnknownIdentity(_),
        )
        | EngineError::NoFacesDetected => fdo::Error::InvalidArgs(err.to_string()),
        other => fdo::Error::Failed(other.to_string()),
    }
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("encoding reply: {e}")))
}

fn to_descriptor(values: Vec<f64>) -> Descriptor {
    Descriptor::new(values.into_iter().map(|v| v as f32).collect())
}

/// Empty string means "unbounded".
fn parse_day(raw: &str) -> fdo::Result<Option<NaiveDate>> {
    if raw.is_empty() {
        return Ok(None);
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(Some)
        .map_err(|e| fdo::Error::InvalidArgs(format!("invalid date {raw:?}: {e}")))
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Create or update an identity in the directory. An empty section means none.
    async fn add_identity(
        &self,
        id: &str,
        name: &str,
        role: &str,
        section: &str,
    ) -> fdo::Result<()> {
        let role: Role = if role.is_empty() {
            Role::default()
        } else {
            role.parse::<Role>().map_err(|e| fdo::Error::InvalidArgs(e.to_string()))?
        };
        let identity = Identity {
            id: id.to_string(),
            name: name.to_string(),
            role,
            section: (!section.is_empty()).then(|| section.to_string()),
        };
        self.engine.add_identity(identity).await.map_err(to_fdo)
    }

    /// Enroll or replace the descriptor for an identity.
    async fn enroll(&self, identity_id: &str, descriptor: Vec<f64>) -> fdo::Result<()> {
        tracing::info!(identity_id, "enroll requested");
        self.engine
            .enroll(identity_id.to_string(), to_descriptor(descriptor))
            .await
            .map_err(to_fdo)
    }

    /// Match descriptors against the registry without recording attendance.
    async fn recognize(&self, descriptors: Vec<Vec<f64>>) -> fdo::Result<String> {
        tracing::info!(faces = descriptors.len(), "recognize requested");
        let descriptors = descriptors.into_iter().map(to_descriptor).collect();
        let result = self.engine.recognize(descriptors).await.map_err(to_fdo)?;
        to_json(&result)
    }

    /// Match descriptors and record today's attendance for every recognized identity.
    async fn mark_automatic(&self, descriptors: Vec<Vec<f64>>) -> fdo::Result<String> {
        tracing::info!(faces = descriptors.len(), "mark requested");
        let descriptors = descriptors.into_iter().map(to_descriptor).collect();
        let now = Local::now().naive_local();
        let mark = self
            .engine
            .mark_automatic(descriptors, now)
            .await
            .map_err(to_fdo)?;
        to_json(&mark)
    }

    /// Record a roll call: `(identity_id, present)` pairs for today.
    async fn mark_roll_call(&self, entries: Vec<(String, bool)>) -> fdo::Result<String> {
        tracing::info!(entries = entries.len(), "roll call submitted");
        let now = Local::now().naive_local();
        let outcome = self
            .engine
            .mark_roll_call(entries, now)
            .await
            .map_err(to_fdo)?;
        to_json(&outcome)
    }

    /// Attendance history of one identity, newest first. Dates are `YYYY-MM-DD` or empty.
    async fn history(&self, identity_id: &str, from: &str, to: &str) -> fdo::Result<String> {
        let records = self
            .engine
            .history(identity_id.to_string(), parse_day(from)?, parse_day(to)?)
            .await
            .map_err(to_fdo)?;
        to_json(&records)
    }

    /// Filtered report. `filter` is a JSON object with optional
    /// `identity_id`, `status`, `from` and `to` keys.
    async fn report(&self, filter: &str) -> fdo::Result<String> {
        let filter: RecordFilter = if filter.trim().is_empty() {
            RecordFilter::default()
        } else {
            serde_json::from_str(filter)
                .map_err(|e| fdo::Error::InvalidArgs(format!("invalid filter: {e}")))?
        };
        let rows = self.engine.report(filter).await.map_err(to_fdo)?;
        to_json(&rows)
    }

    /// Counts grouped by status and by day.
    async fn stats(&self, from: &str, to: &str) -> fdo::Result<String> {
        let stats = self
            .engine
            .stats(parse_day(from)?, parse_day(to)?)
            .await
            .map_err(to_fdo)?;
        to_json(&stats)
    }

    /// Notifications for an identity, newest first; optionally marks them read.
    async fn notifications(&self, identity_id: &str, mark_read: bool) -> fdo::Result<String> {
        let list = self
            .engine
            .notifications(identity_id.to_string(), mark_read)
            .await
            .map_err(to_fdo)?;
        to_json(&list)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let counts = self.engine.counts().await.map_err(to_fdo)?;
        to_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "match_threshold": self.match_threshold,
            "descriptor_dim": self.descriptor_dim,
            "late_cutoff": self.late_cutoff,
            "identities": counts.identities,
            "enrolled": counts.descriptors,
            "attendance_records": counts.attendance,
        }))
    }
}

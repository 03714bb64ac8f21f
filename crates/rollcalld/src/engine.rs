use crate::config::Config;
use chrono::{NaiveDate, NaiveDateTime};
use rollcall_core::{
    AttendanceRecord, AttendanceStats, Descriptor, Identity, IdentityDirectory, Ledger,
    LedgerError, MarkOutcome, MatchError, MatchResult, Matcher, NearestMatcher, RecordFilter,
    Registry, RegistryError, ReportRow, Reports, StoreError,
};
use rollcall_store::{Notification, SqliteStore, SqliteStoreError, StoreCounts, StoreNotifier};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to open store: {0}")]
    Open(#[from] SqliteStoreError),
    #[error("no faces detected in the submitted image")]
    NoFacesDetected,
    #[error("no recognized faces found")]
    NoRecognizedFaces,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Result of a vision-driven marking call.
#[derive(Debug, Clone, Serialize)]
pub struct AutomaticMark {
    pub matches: MatchResult,
    #[serde(flatten)]
    pub outcome: MarkOutcome,
}

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    AddIdentity {
        identity: Identity,
        reply: Reply<()>,
    },
    Enroll {
        identity_id: String,
        descriptor: Descriptor,
        reply: Reply<()>,
    },
    Recognize {
        descriptors: Vec<Descriptor>,
        reply: Reply<MatchResult>,
    },
    MarkAutomatic {
        descriptors: Vec<Descriptor>,
        now: NaiveDateTime,
        reply: Reply<AutomaticMark>,
    },
    MarkRollCall {
        entries: Vec<(String, bool)>,
        now: NaiveDateTime,
        reply: Reply<MarkOutcome>,
    },
    History {
        identity_id: String,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        reply: Reply<Vec<AttendanceRecord>>,
    },
    Report {
        filter: RecordFilter,
        reply: Reply<Vec<ReportRow>>,
    },
    Stats {
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
        reply: Reply<AttendanceStats>,
    },
    Notifications {
        identity_id: String,
        mark_read: bool,
        reply: Reply<Vec<Notification>>,
    },
    Counts {
        reply: Reply<StoreCounts>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn add_identity(&self, identity: Identity) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::AddIdentity { identity, reply }).await
    }

    /// Enroll or replace the descriptor of an identity.
    pub async fn enroll(
        &self,
        identity_id: String,
        descriptor: Descriptor,
    ) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::Enroll {
            identity_id,
            descriptor,
            reply,
        })
        .await
    }

    /// Match descriptors against the registry without recording anything.
    pub async fn recognize(
        &self,
        descriptors: Vec<Descriptor>,
    ) -> Result<MatchResult, EngineError> {
        self.request(|reply| EngineRequest::Recognize { descriptors, reply }).await
    }

    /// Match descriptors, then record every recognized identity for the day of `now`.
    pub async fn mark_automatic(
        &self,
        descriptors: Vec<Descriptor>,
        now: NaiveDateTime,
    ) -> Result<AutomaticMark, EngineError> {
        self.request(|reply| EngineRequest::MarkAutomatic {
            descriptors,
            now,
            reply,
        })
        .await
    }

    /// Record a teacher-adjudicated roll call for the day of `now`.
    pub async fn mark_roll_call(
        &self,
        entries: Vec<(String, bool)>,
        now: NaiveDateTime,
    ) -> Result<MarkOutcome, EngineError> {
        self.request(|reply| EngineRequest::MarkRollCall {
            entries,
            now,
            reply,
        })
        .await
    }

    pub async fn history(
        &self,
        identity_id: String,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<Vec<AttendanceRecord>, EngineError> {
        self.request(|reply| EngineRequest::History {
            identity_id,
            from,
            to,
            reply,
        })
        .await
    }

    pub async fn report(&self, filter: RecordFilter) -> Result<Vec<ReportRow>, EngineError> {
        self.request(|reply| EngineRequest::Report { filter, reply }).await
    }

    pub async fn stats(
        &self,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Result<AttendanceStats, EngineError> {
        self.request(|reply| EngineRequest::Stats { from, to, reply }).await
    }

    pub async fn notifications(
        &self,
        identity_id: String,
        mark_read: bool,
    ) -> Result<Vec<Notification>, EngineError> {
        self.request(|reply| EngineRequest::Notifications {
            identity_id,
            mark_read,
            reply,
        })
        .await
    }

    pub async fn counts(&self) -> Result<StoreCounts, EngineError> {
        self.request(|reply| EngineRequest::Counts { reply }).await
    }
}

/// State owned by the engine thread.
struct Engine {
    store: Arc<SqliteStore>,
    registry: Registry<SqliteStore>,
    matcher: NearestMatcher,
    ledger: Ledger<SqliteStore, StoreNotifier>,
    reports: Reports<SqliteStore>,
}

impl Engine {
    fn new(store: Arc<SqliteStore>, config: &Config) -> Self {
        Self {
            registry: Registry::new(store.clone(), config.descriptor_dim),
            matcher: NearestMatcher::new(config.match_threshold),
            ledger: Ledger::new(store.clone(), StoreNotifier::new(store.clone()))
                .with_late_cutoff(config.late_cutoff),
            reports: Reports::new(store.clone()),
            store,
        }
    }

    fn handle(&self, req: EngineRequest) {
        match req {
            EngineRequest::AddIdentity { identity, reply } => {
                let result = self.store.upsert_identity(&identity).map_err(EngineError::from);
                if result.is_ok() {
                    tracing::info!(
                        identity_id = %identity.id,
                        role = %identity.role,
                        "identity saved"
                    );
                }
                let _ = reply.send(result);
            }
            EngineRequest::Enroll {
                identity_id,
                descriptor,
                reply,
            } => {
                let result = self
                    .registry
                    .enroll(&identity_id, &descriptor)
                    .map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::Recognize { descriptors, reply } => {
                let _ = reply.send(self.recognize(&descriptors));
            }
            EngineRequest::MarkAutomatic {
                descriptors,
                now,
                reply,
            } => {
                let _ = reply.send(self.mark_automatic(&descriptors, now));
            }
            EngineRequest::MarkRollCall {
                entries,
                now,
                reply,
            } => {
                let result = self
                    .ledger
                    .record_manual(&entries, now)
                    .map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::History {
                identity_id,
                from,
                to,
                reply,
            } => {
                let result = self
                    .reports
                    .history(&identity_id, from, to)
                    .map_err(EngineError::from);
                let _ = reply.send(result);
            }
            EngineRequest::Report { filter, reply } => {
                let _ = reply.send(self.reports.report(&filter).map_err(EngineError::from));
            }
            EngineRequest::Stats { from, to, reply } => {
                let _ = reply.send(self.reports.stats(from, to).map_err(EngineError::from));
            }
            EngineRequest::Notifications {
                identity_id,
                mark_read,
                reply,
            } => {
                let _ = reply.send(self.notifications(&identity_id, mark_read));
            }
            EngineRequest::Counts { reply } => {
                let result = self
                    .store
                    .counts()
                    .map_err(|e| EngineError::Store(e.into()));
                let _ = reply.send(result);
            }
        }
    }

    fn recognize(&self, descriptors: &[Descriptor]) -> Result<MatchResult, EngineError> {
        for descriptor in descriptors {
            self.registry.validate(descriptor)?;
        }
        if descriptors.is_empty() {
            return Ok(MatchResult::default());
        }
        let gallery = self.registry.all_descriptors()?;
        let result = self.matcher.match_faces(descriptors, &gallery)?;
        tracing::info!(
            faces = descriptors.len(),
            enrolled = gallery.len(),
            recognized = result.len(),
            "recognition pass"
        );
        Ok(result)
    }

    fn mark_automatic(
        &self,
        descriptors: &[Descriptor],
        now: NaiveDateTime,
    ) -> Result<AutomaticMark, EngineError> {
        if descriptors.is_empty() {
            return Err(EngineError::NoFacesDetected);
        }
        let matches = self.recognize(descriptors)?;
        if matches.is_empty() {
            return Err(EngineError::NoRecognizedFaces);
        }
        let outcome = self.ledger.record_automatic(&matches.identity_ids(), now)?;
        Ok(AutomaticMark { matches, outcome })
    }

    fn notifications(
        &self,
        identity_id: &str,
        mark_read: bool,
    ) -> Result<Vec<Notification>, EngineError> {
        let list = self
            .store
            .list_notifications(identity_id)
            .map_err(|e| EngineError::Store(e.into()))?;
        if mark_read {
            let changed = self
                .store
                .mark_notifications_read(identity_id)
                .map_err(|e| EngineError::Store(e.into()))?;
            tracing::debug!(identity_id, changed, "notifications marked read");
        }
        Ok(list)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Opens the store synchronously so the daemon fails fast when the database
/// is unreachable, then enters a request loop.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let store = SqliteStore::open(&config.db_path)?;
    spawn_with_store(Arc::new(store), config)
}

fn spawn_with_store(store: Arc<SqliteStore>, config: &Config) -> Result<EngineHandle, EngineError> {
    let engine = Engine::new(store, config);
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(32);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                engine.handle(req);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusKind;
    use chrono::NaiveTime;
    use rollcall_core::{AttendanceStatus, Role};

    fn config() -> Config {
        Config {
            db_path: ":memory:".into(),
            match_threshold: 0.6,
            descriptor_dim: 3,
            late_cutoff: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            bus: BusKind::Session,
        }
    }

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 11, 4)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn d(values: [f32; 3]) -> Descriptor {
        Descriptor::new(values.to_vec())
    }

    async fn engine_with_class() -> EngineHandle {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let engine = spawn_with_store(store, &config()).unwrap();
        for (id, name, v) in [
            ("s1", "Ana", [0.0, 0.0, 0.0]),
            ("s2", "Bruno", [1.0, 1.0, 1.0]),
        ] {
            engine
                .add_identity(Identity {
                    id: id.into(),
                    name: name.into(),
                    role: Role::Student,
                    section: Some("3C".into()),
                })
                .await
                .unwrap();
            engine.enroll(id.into(), d(v)).await.unwrap();
        }
        engine
    }

    #[tokio::test]
    async fn test_enroll_validates_dimension() {
        let engine = engine_with_class().await;
        let err = engine
            .enroll("s1".into(), Descriptor::new(vec![0.0; 4]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Registry(RegistryError::InvalidDescriptor { expected: 3, actual: 4 })
        ));
    }

    #[tokio::test]
    async fn test_enroll_unknown_identity() {
        let engine = engine_with_class().await;
        let err = engine.enroll("ghost".into(), d([0.0; 3])).await.unwrap_err();
        assert!(matches!(err, EngineError::Registry(RegistryError::UnknownIdentity(_))));
    }

    #[tokio::test]
    async fn test_recognize_does_not_record() {
        let engine = engine_with_class().await;
        let result = engine.recognize(vec![d([0.1, 0.0, 0.0])]).await.unwrap();
        assert_eq!(result.identity_ids(), vec!["s1".to_string()]);
        assert_eq!(engine.counts().await.unwrap().attendance, 0);
    }

    #[tokio::test]
    async fn test_recognize_empty_registry() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let engine = spawn_with_store(store, &config()).unwrap();
        let err = engine.recognize(vec![d([0.0; 3])]).await.unwrap_err();
        assert!(matches!(err, EngineError::Registry(RegistryError::EmptyRegistry)));
    }

    #[tokio::test]
    async fn test_mark_automatic_flow() {
        let engine = engine_with_class().await;
        let mark = engine
            .mark_automatic(vec![d([0.0, 0.1, 0.0]), d([1.0, 1.0, 0.9])], at(9, 5))
            .await
            .unwrap();
        assert_eq!(mark.matches.len(), 2);
        assert_eq!(mark.outcome.recorded.len(), 2);
        assert!(mark
            .outcome
            .recorded
            .iter()
            .all(|r| r.status == AttendanceStatus::Late));

        let err = engine
            .mark_automatic(vec![d([0.0, 0.0, 0.0])], at(10, 0))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Ledger(LedgerError::AllAlreadyMarked { .. })
        ));

        let notes = engine.notifications("s1".into(), true).await.unwrap();
        assert_eq!(notes.len(), 1);
        let notes = engine.notifications("s1".into(), false).await.unwrap();
        assert_eq!(notes[0].status, "read");
    }

    #[tokio::test]
    async fn test_mark_automatic_rejects_empty_and_unknown_faces() {
        let engine = engine_with_class().await;
        assert!(matches!(
            engine.mark_automatic(vec![], at(8, 0)).await.unwrap_err(),
            EngineError::NoFacesDetected
        ));
        assert!(matches!(
            engine
                .mark_automatic(vec![d([9.0, 9.0, 9.0])], at(8, 0))
                .await
                .unwrap_err(),
            EngineError::NoRecognizedFaces
        ));
    }

    #[tokio::test]
    async fn test_roll_call_then_reports() {
        let engine = engine_with_class().await;
        let outcome = engine
            .mark_roll_call(vec![("s1".into(), true), ("s2".into(), false)], at(11, 0))
            .await
            .unwrap();
        assert_eq!(outcome.recorded.len(), 2);

        let history = engine.history("s2".into(), None, None).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, AttendanceStatus::Absent);

        let rows = engine
            .report(RecordFilter::default().with_status(AttendanceStatus::Present))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name.as_deref(), Some("Ana"));

        let stats = engine.stats(None, None).await.unwrap();
        assert_eq!(stats.daily.len(), 1);
        assert_eq!(stats.daily[0].total, 2);
    }

    #[tokio::test]
    async fn test_concurrent_mark_automatic_records_once() {
        let engine = engine_with_class().await;
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    engine.mark_automatic(vec![d([0.0, 0.0, 0.05])], at(8, 30)).await
                })
            })
            .collect();

        let mut recorded = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(mark) => recorded += mark.outcome.recorded.len(),
                Err(EngineError::Ledger(LedgerError::AllAlreadyMarked { .. })) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(recorded, 1);
        assert_eq!(engine.counts().await.unwrap().attendance, 1);
    }
}

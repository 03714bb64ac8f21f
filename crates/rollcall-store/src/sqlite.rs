use crate::codec::{decode_descriptor, encode_descriptor};
use crate::schema;
use chrono::{NaiveDate, SecondsFormat, Utc};
use rollcall_core::{
    AttendanceRecord, AttendanceStatus, AttendanceStore, Descriptor, DescriptorStore,
    EnrolledFace, Identity, IdentityDirectory, InsertOutcome, RecordFilter, Role, StoreError,
};
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

/// How long a writer waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Error, Debug)]
pub enum SqliteStoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cannot create data directory {path}: {source}")]
    DataDir {
        path: String,
        source: std::io::Error,
    },
    #[error("corrupt descriptor for {identity_id}: {len} bytes do not hold the stored dimension")]
    CorruptDescriptor { identity_id: String, len: usize },
    #[error("connection lock poisoned")]
    LockPoisoned,
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl From<SqliteStoreError> for StoreError {
    fn from(err: SqliteStoreError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// A persisted notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub id: String,
    pub identity_id: String,
    pub message: String,
    pub status: String,
    pub created_at: String,
}

/// Row counts reported by the daemon's status call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub identities: u64,
    pub descriptors: u64,
    pub attendance: u64,
}

/// SQLite-backed store. One connection per instance; open several instances on
/// the same file for independent writers.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SqliteStoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| SqliteStoreError::DataDir {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        Self::init(conn, Some(&mode), path)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self, SqliteStoreError> {
        Self::init(Connection::open_in_memory()?, None, Path::new(":memory:"))
    }

    fn init(
        conn: Connection,
        journal_mode: Option<&str>,
        path: &Path,
    ) -> Result<Self, SqliteStoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::create_tables(&conn)?;
        tracing::info!(path = %path.display(), journal_mode, "attendance store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, SqliteStoreError> {
        self.conn.lock().map_err(|_| SqliteStoreError::LockPoisoned)
    }

    pub fn insert_notification(
        &self,
        identity_id: &str,
        message: &str,
    ) -> Result<Notification, SqliteStoreError> {
        let notification = Notification {
            id: uuid::Uuid::new_v4().to_string(),
            identity_id: identity_id.to_string(),
            message: message.to_string(),
            status: "unread".into(),
            created_at: now_timestamp(),
        };
        self.conn()?.execute(
            "INSERT INTO notifications (id, identity_id, message, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                notification.id,
                notification.identity_id,
                notification.message,
                notification.status,
                notification.created_at
            ],
        )?;
        Ok(notification)
    }

    /// Notifications of one identity, newest first.
    pub fn list_notifications(
        &self,
        identity_id: &str,
    ) -> Result<Vec<Notification>, SqliteStoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, identity_id, message, status, created_at FROM notifications
             WHERE identity_id = ?1 ORDER BY created_at DESC, rowid DESC",
        )?;
        let rows = stmt.query_map([identity_id], |row| {
            Ok(Notification {
                id: row.get(0)?,
                identity_id: row.get(1)?,
                message: row.get(2)?,
                status: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Mark every unread notification of an identity as read. Returns how many changed.
    pub fn mark_notifications_read(&self, identity_id: &str) -> Result<usize, SqliteStoreError> {
        Ok(self.conn()?.execute(
            "UPDATE notifications SET status = 'read' WHERE identity_id = ?1 AND status = 'unread'",
            [identity_id],
        )?)
    }

    pub fn counts(&self) -> Result<StoreCounts, SqliteStoreError> {
        let conn = self.conn()?;
        let count = |table: &str| -> rusqlite::Result<u64> {
            let sql = format!("SELECT COUNT(*) FROM {table}");
            let n: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
            Ok(n as u64)
        };
        Ok(StoreCounts {
            identities: count("identities")?,
            descriptors: count("descriptors")?,
            attendance: count("attendance")?,
        })
    }

    fn get_identity_row(&self, id: &str) -> Result<Option<Identity>, SqliteStoreError> {
        let conn = self.conn()?;
        let identity = conn
            .query_row(
                "SELECT id, name, role, section FROM identities WHERE id = ?1",
                [id],
                |row| {
                    let role: String = row.get(2)?;
                    Ok(Identity {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        role: role.parse::<Role>().map_err(|e| text_conversion(2, e))?,
                        section: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(identity)
    }

    fn load_descriptor_rows(&self) -> Result<Vec<EnrolledFace>, SqliteStoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT d.identity_id, i.name, d.dim, d.vector
             FROM descriptors d JOIN identities i ON i.id = d.identity_id
             ORDER BY d.identity_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Vec<u8>>(3)?,
            ))
        })?;

        let mut gallery = Vec::new();
        for row in rows {
            let (identity_id, name, dim, blob) = row?;
            let descriptor = decode_descriptor(&blob)
                .filter(|d| d.len() as i64 == dim)
                .ok_or_else(|| SqliteStoreError::CorruptDescriptor {
                    identity_id: identity_id.clone(),
                    len: blob.len(),
                })?;
            gallery.push(EnrolledFace {
                identity_id,
                name,
                descriptor,
            });
        }
        Ok(gallery)
    }

    fn query_rows(&self, filter: &RecordFilter) -> Result<Vec<AttendanceRecord>, SqliteStoreError> {
        let mut sql =
            String::from("SELECT identity_id, date, time, status FROM attendance WHERE 1 = 1");
        let mut args: Vec<Value> = Vec::new();
        if let Some(identity_id) = &filter.identity_id {
            sql.push_str(" AND identity_id = ?");
            args.push(Value::Text(identity_id.clone()));
        }
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            args.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(from) = filter.from {
            sql.push_str(" AND date >= ?");
            args.push(Value::Text(from.format(DATE_FORMAT).to_string()));
        }
        if let Some(to) = filter.to {
            sql.push_str(" AND date <= ?");
            args.push(Value::Text(to.format(DATE_FORMAT).to_string()));
        }

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            let date: String = row.get(1)?;
            let status: String = row.get(3)?;
            Ok(AttendanceRecord {
                identity_id: row.get(0)?,
                date: NaiveDate::parse_from_str(&date, DATE_FORMAT)
                    .map_err(|e| text_conversion(1, e))?,
                time: row.get(2)?,
                status: status
                    .parse::<AttendanceStatus>()
                    .map_err(|e| text_conversion(3, e))?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn text_conversion(
    column: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(err))
}

impl IdentityDirectory for SqliteStore {
    fn upsert_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        self.conn()?
            .execute(
                "INSERT INTO identities (id, name, role, section) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name, role = excluded.role, section = excluded.section",
                params![identity.id, identity.name, identity.role.as_str(), identity.section],
            )
            .map_err(SqliteStoreError::from)?;
        Ok(())
    }

    fn get_identity(&self, id: &str) -> Result<Option<Identity>, StoreError> {
        Ok(self.get_identity_row(id)?)
    }
}

impl DescriptorStore for SqliteStore {
    fn upsert_descriptor(
        &self,
        identity_id: &str,
        descriptor: &Descriptor,
    ) -> Result<(), StoreError> {
        self.conn()?
            .execute(
                "INSERT INTO descriptors (identity_id, dim, vector, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(identity_id) DO UPDATE SET
                     dim = excluded.dim,
                     vector = excluded.vector,
                     updated_at = excluded.updated_at",
                params![
                    identity_id,
                    descriptor.len() as i64,
                    encode_descriptor(descriptor),
                    now_timestamp()
                ],
            )
            .map_err(SqliteStoreError::from)?;
        Ok(())
    }

    fn load_descriptors(&self) -> Result<Vec<EnrolledFace>, StoreError> {
        Ok(self.load_descriptor_rows()?)
    }
}

impl AttendanceStore for SqliteStore {
    fn insert_if_absent(&self, record: &AttendanceRecord) -> Result<InsertOutcome, StoreError> {
        // The UNIQUE(identity_id, date) constraint arbitrates between concurrent writers.
        let changed = self
            .conn()?
            .execute(
                "INSERT INTO attendance (id, identity_id, date, time, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(identity_id, date) DO NOTHING",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    record.identity_id,
                    record.date.format(DATE_FORMAT).to_string(),
                    record.time,
                    record.status.as_str(),
                    now_timestamp()
                ],
            )
            .map_err(SqliteStoreError::from)?;
        Ok(if changed == 1 {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::AlreadyExists
        })
    }

    fn query_records(&self, filter: &RecordFilter) -> Result<Vec<AttendanceRecord>, StoreError> {
        Ok(self.query_rows(filter)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{Ledger, LedgerError, LogNotifier};
    use std::path::PathBuf;
    use std::sync::{Arc, Barrier};

    fn identity(id: &str, name: &str) -> Identity {
        Identity {
            id: id.into(),
            name: name.into(),
            role: Role::Student,
            section: Some("10A".into()),
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 10, d).unwrap()
    }

    fn record(id: &str, d: u32, status: AttendanceStatus) -> AttendanceRecord {
        AttendanceRecord {
            identity_id: id.into(),
            date: day(d),
            time: "08:10:00".into(),
            status,
        }
    }

    struct TempDb(PathBuf);

    impl TempDb {
        fn new() -> Self {
            let name = format!("rollcall-test-{}.db", uuid::Uuid::new_v4());
            Self(std::env::temp_dir().join(name))
        }
    }

    impl Drop for TempDb {
        fn drop(&mut self) {
            for suffix in ["", "-wal", "-shm"] {
                let mut path = self.0.clone().into_os_string();
                path.push(suffix);
                let _ = std::fs::remove_file(path);
            }
        }
    }

    #[test]
    fn test_identity_upsert_and_get() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_identity(&identity("s1", "Ana")).unwrap();
        let mut updated = identity("s1", "Ana Lima");
        updated.role = Role::Teacher;
        updated.section = None;
        store.upsert_identity(&updated).unwrap();

        assert_eq!(store.get_identity("s1").unwrap(), Some(updated));
        assert_eq!(store.get_identity("missing").unwrap(), None);
    }

    #[test]
    fn test_descriptor_upsert_replaces_in_place() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_identity(&identity("s1", "Ana")).unwrap();
        store.upsert_identity(&identity("s2", "Bo")).unwrap();
        store.upsert_descriptor("s2", &Descriptor::new(vec![0.5, 0.5])).unwrap();
        store.upsert_descriptor("s1", &Descriptor::new(vec![0.1, 0.2])).unwrap();
        store.upsert_descriptor("s1", &Descriptor::new(vec![0.3, 0.4])).unwrap();

        let gallery = store.load_descriptors().unwrap();
        assert_eq!(gallery.len(), 2);
        assert_eq!(gallery[0].identity_id, "s1");
        assert_eq!(gallery[0].name, "Ana");
        assert_eq!(gallery[0].descriptor.values, vec![0.3, 0.4]);
        assert_eq!(store.counts().unwrap().descriptors, 2);
    }

    #[test]
    fn test_descriptor_dim_column_is_checked_on_load() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_identity(&identity("s1", "Ana")).unwrap();
        store.upsert_descriptor("s1", &Descriptor::new(vec![0.1, 0.2])).unwrap();
        store
            .conn()
            .unwrap()
            .execute("UPDATE descriptors SET dim = 3 WHERE identity_id = 's1'", [])
            .unwrap();

        assert!(matches!(
            store.load_descriptor_rows(),
            Err(SqliteStoreError::CorruptDescriptor { len: 8, .. })
        ));
    }

    #[test]
    fn test_descriptor_requires_known_identity() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store
            .upsert_descriptor("ghost", &Descriptor::new(vec![0.0]))
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[test]
    fn test_insert_if_absent_respects_unique_day() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(
            store.insert_if_absent(&record("s1", 1, AttendanceStatus::Present)).unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert_if_absent(&record("s1", 1, AttendanceStatus::Late)).unwrap(),
            InsertOutcome::AlreadyExists
        );
        assert_eq!(
            store.insert_if_absent(&record("s1", 2, AttendanceStatus::Late)).unwrap(),
            InsertOutcome::Inserted
        );

        let day_one = store
            .query_records(&RecordFilter::for_identity("s1").between(Some(day(1)), Some(day(1))))
            .unwrap();
        assert_eq!(day_one, vec![record("s1", 1, AttendanceStatus::Present)]);
    }

    #[test]
    fn test_query_filters() {
        let store = SqliteStore::open_in_memory().unwrap();
        for r in [
            record("s1", 1, AttendanceStatus::Present),
            record("s2", 1, AttendanceStatus::Absent),
            record("s1", 3, AttendanceStatus::Late),
            record("s2", 9, AttendanceStatus::Late),
        ] {
            store.insert_if_absent(&r).unwrap();
        }

        let late = store
            .query_records(&RecordFilter::default().with_status(AttendanceStatus::Late))
            .unwrap();
        assert_eq!(late.len(), 2);

        let ranged = store
            .query_records(&RecordFilter::default().between(Some(day(1)), Some(day(3))))
            .unwrap();
        assert_eq!(ranged.len(), 3);

        let s2_late = store
            .query_records(&RecordFilter::for_identity("s2").with_status(AttendanceStatus::Late))
            .unwrap();
        assert_eq!(s2_late, vec![record("s2", 9, AttendanceStatus::Late)]);
    }

    #[test]
    fn test_notifications_newest_first_and_mark_read() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert_notification("s1", "first").unwrap();
        store.insert_notification("s1", "second").unwrap();
        store.insert_notification("s2", "other").unwrap();

        let list = store.list_notifications("s1").unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].message, "second");
        assert!(list.iter().all(|n| n.status == "unread"));

        assert_eq!(store.mark_notifications_read("s1").unwrap(), 2);
        assert_eq!(store.mark_notifications_read("s1").unwrap(), 0);
        assert_eq!(store.list_notifications("s2").unwrap()[0].status, "unread");
    }

    #[test]
    fn test_reopen_keeps_records() {
        let db = TempDb::new();
        {
            let store = SqliteStore::open(&db.0).unwrap();
            store.insert_if_absent(&record("s1", 1, AttendanceStatus::Present)).unwrap();
        }
        let store = SqliteStore::open(&db.0).unwrap();
        assert_eq!(store.counts().unwrap().attendance, 1);
        assert_eq!(
            store.insert_if_absent(&record("s1", 1, AttendanceStatus::Present)).unwrap(),
            InsertOutcome::AlreadyExists
        );
    }

    #[test]
    fn test_concurrent_connections_insert_once() {
        const WRITERS: usize = 8;
        let db = TempDb::new();
        let stores: Vec<SqliteStore> = (0..WRITERS)
            .map(|_| SqliteStore::open(&db.0).unwrap())
            .collect();
        let barrier = Barrier::new(WRITERS);

        let outcomes: Vec<InsertOutcome> = std::thread::scope(|s| {
            let handles: Vec<_> = stores
                .iter()
                .map(|store| {
                    let barrier = &barrier;
                    s.spawn(move || {
                        barrier.wait();
                        store
                            .insert_if_absent(&record("s1", 5, AttendanceStatus::Present))
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let inserted = outcomes.iter().filter(|o| **o == InsertOutcome::Inserted).count();
        assert_eq!(inserted, 1);
        assert_eq!(stores[0].counts().unwrap().attendance, 1);
    }

    #[test]
    fn test_concurrent_ledgers_record_once() {
        const WRITERS: usize = 8;
        let db = TempDb::new();
        let ledgers: Vec<_> = (0..WRITERS)
            .map(|_| Ledger::new(Arc::new(SqliteStore::open(&db.0).unwrap()), LogNotifier))
            .collect();
        let barrier = Barrier::new(WRITERS);
        let now = day(7).and_hms_opt(9, 30, 0).unwrap();
        let ids = vec!["s1".to_string(), "s2".to_string()];

        let results: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = ledgers
                .iter()
                .map(|ledger| {
                    let (barrier, ids) = (&barrier, &ids);
                    s.spawn(move || {
                        barrier.wait();
                        ledger.record_automatic(ids, now)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let recorded: usize = results
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .map(|o| o.recorded.len())
            .sum();
        assert_eq!(recorded, 2);
        assert!(results
            .iter()
            .all(|r| matches!(r, Ok(_) | Err(LedgerError::AllAlreadyMarked { .. }))));

        let check = SqliteStore::open(&db.0).unwrap();
        let rows = check.query_records(&RecordFilter::default()).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.status == AttendanceStatus::Late));
    }
}

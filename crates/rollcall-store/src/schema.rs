use rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id      TEXT PRIMARY KEY,
    name    TEXT NOT NULL,
    role    TEXT NOT NULL DEFAULT 'student',
    section TEXT
);

CREATE TABLE IF NOT EXISTS descriptors (
    identity_id TEXT PRIMARY KEY REFERENCES identities(id) ON DELETE CASCADE,
    dim         INTEGER NOT NULL,
    vector      BLOB NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attendance (
    id          TEXT PRIMARY KEY,
    identity_id TEXT NOT NULL,
    date        TEXT NOT NULL,
    time        TEXT NOT NULL,
    status      TEXT NOT NULL CHECK (status IN ('present', 'late', 'absent')),
    created_at  TEXT NOT NULL,
    UNIQUE (identity_id, date)
);

CREATE INDEX IF NOT EXISTS attendance_date_idx ON attendance(date);

CREATE TABLE IF NOT EXISTS notifications (
    id          TEXT PRIMARY KEY,
    identity_id TEXT NOT NULL,
    message     TEXT NOT NULL,
    status      TEXT NOT NULL DEFAULT 'unread' CHECK (status IN ('unread', 'read')),
    created_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS notifications_identity_idx ON notifications(identity_id);
";

pub fn create_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA)
}

//! SQLite attendance ledger and user registry.

use crate::StoreError;
use chrono::{NaiveDate, NaiveDateTime};
use rollcall_core::{AttendanceLedger, AttendanceRecord, MarkKind, PersistenceError};
use rusqlite::{params, Connection, OptionalExtension, Params};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const DAY_FORMAT: &str = "%Y-%m-%d";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
    PRAGMA foreign_keys = ON;

    CREATE TABLE IF NOT EXISTS users (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        name          TEXT UNIQUE NOT NULL,
        email         TEXT,
        department    TEXT,
        role          TEXT,
        registered_at TEXT NOT NULL DEFAULT (datetime('now', 'localtime')),
        is_active     INTEGER NOT NULL DEFAULT 1
    );

    CREATE TABLE IF NOT EXISTS attendance (
        id        INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id   INTEGER NOT NULL REFERENCES users (id),
        day       TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        kind      TEXT NOT NULL DEFAULT 'auto',
        UNIQUE (user_id, day)
    );

    CREATE INDEX IF NOT EXISTS attendance_by_day ON attendance (day);
";

/// Fields accepted when registering a person in the user registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewUser {
    pub name: String,
    pub email: Option<String>,
    pub department: Option<String>,
    pub role: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
    pub department: Option<String>,
    pub role: Option<String>,
    pub registered_at: String,
}

/// [`AttendanceLedger`] over SQLite.
///
/// One row per (user, day) is enforced by a unique constraint, so two
/// processes racing on the same person and day cannot both insert.
pub struct SqliteLedger {
    conn: Connection,
}

impl SqliteLedger {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Add a person to the registry. Returns `false` if the name exists.
    pub fn add_user(&self, user: &NewUser) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO users (name, email, department, role) VALUES (?1, ?2, ?3, ?4)",
            params![user.name, user.email, user.department, user.role],
        )?;
        if changed == 1 {
            tracing::info!(name = %user.name, "user added");
        }
        Ok(changed == 1)
    }

    pub fn ensure_user(&self, name: &str) -> Result<(), StoreError> {
        self.conn
            .execute("INSERT OR IGNORE INTO users (name) VALUES (?1)", params![name])?;
        Ok(())
    }

    /// Active users ordered by name.
    pub fn users(&self) -> Result<Vec<User>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, email, department, role, registered_at
             FROM users WHERE is_active = 1 ORDER BY name",
        )?;
        let users = stmt
            .query_map([], |row| {
                Ok(User {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    email: row.get(2)?,
                    department: row.get(3)?,
                    role: row.get(4)?,
                    registered_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(users)
    }

    /// Records dated within `[from, to]`, oldest first.
    pub fn records_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.query_records(
            "WHERE a.day >= ?1 AND a.day <= ?2",
            params![day_key(from), day_key(to)],
        )
    }

    pub fn all_records(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.query_records("", [])
    }

    /// Write every record as CSV (`Name,Time,Kind`). Returns the row count.
    pub fn export_csv<W: Write>(&self, mut out: W) -> Result<usize, StoreError> {
        let records = self.all_records()?;
        let io_err = |e| StoreError::io("<export>", e);
        writeln!(out, "Name,Time,Kind").map_err(io_err)?;
        for r in &records {
            writeln!(
                out,
                "{},{},{}",
                csv_field(&r.label),
                r.timestamp.format(TIMESTAMP_FORMAT),
                r.kind
            )
            .map_err(io_err)?;
        }
        out.flush().map_err(io_err)?;
        Ok(records.len())
    }

    fn query_records<P: Params>(
        &self,
        filter: &str,
        params: P,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let sql = format!(
            "SELECT u.name, a.timestamp, a.kind
             FROM attendance a JOIN users u ON u.id = a.user_id
             {filter}
             ORDER BY a.timestamp, a.id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params, |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(label, ts, kind)| {
                let timestamp = NaiveDateTime::parse_from_str(&ts, TIMESTAMP_FORMAT)
                    .map_err(|e| StoreError::BadRow(format!("timestamp '{ts}': {e}")))?;
                let kind = kind
                    .parse::<MarkKind>()
                    .map_err(|e| StoreError::BadRow(e.to_string()))?;
                Ok(AttendanceRecord {
                    label,
                    timestamp,
                    kind,
                })
            })
            .collect()
    }

    fn has_record_on(&self, label: &str, date: NaiveDate) -> Result<bool, StoreError> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM attendance a JOIN users u ON u.id = a.user_id
                 WHERE u.name = ?1 AND a.day = ?2",
                params![label, day_key(date)],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn insert_record(&mut self, record: &AttendanceRecord) -> Result<bool, StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO users (name) VALUES (?1)",
            params![record.label],
        )?;
        let user_id: i64 = tx.query_row(
            "SELECT id FROM users WHERE name = ?1",
            params![record.label],
            |row| row.get(0),
        )?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO attendance (user_id, day, timestamp, kind)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                user_id,
                day_key(record.date()),
                record.timestamp.format(TIMESTAMP_FORMAT).to_string(),
                record.kind.as_str()
            ],
        )?;
        tx.commit()?;
        Ok(inserted == 1)
    }
}

impl AttendanceLedger for SqliteLedger {
    fn has_record(&self, label: &str, date: NaiveDate) -> Result<bool, PersistenceError> {
        Ok(self.has_record_on(label, date)?)
    }

    fn append_record(&mut self, record: &AttendanceRecord) -> Result<bool, PersistenceError> {
        Ok(self.insert_record(record)?)
    }

    fn records_since(&self, since: NaiveDate) -> Result<Vec<AttendanceRecord>, PersistenceError> {
        Ok(self.query_records("WHERE a.day >= ?1", params![day_key(since)])?)
    }
}

fn day_key(date: NaiveDate) -> String {
    date.format(DAY_FORMAT).to_string()
}

/// Quote a CSV field when it contains a delimiter, quote or line break.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{admit, AdmissionOutcome};

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).unwrap()
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, DAY_FORMAT).unwrap()
    }

    fn record(label: &str, ts: &str) -> AttendanceRecord {
        AttendanceRecord {
            label: label.into(),
            timestamp: at(ts),
            kind: MarkKind::Auto,
        }
    }

    #[test]
    fn test_append_once_per_day() {
        let mut ledger = SqliteLedger::open_in_memory().unwrap();
        assert!(ledger.append_record(&record("alice", "2024-01-01 09:00:00")).unwrap());
        assert!(!ledger.append_record(&record("alice", "2024-01-01 18:00:00")).unwrap());
        assert!(ledger.has_record("alice", date("2024-01-01")).unwrap());
        assert!(!ledger.has_record("alice", date("2024-01-02")).unwrap());
        assert!(!ledger.has_record("bob", date("2024-01-01")).unwrap());
    }

    #[test]
    fn test_admission_against_sqlite() {
        let mut ledger = SqliteLedger::open_in_memory().unwrap();
        let now = at("2024-01-01 09:00:00");
        let first = admit(["alice", "bob"], now, &mut ledger).unwrap();
        assert!(first.values().all(|o| *o == AdmissionOutcome::Admitted));
        let second = admit(["alice", "bob"], at("2024-01-01 12:00:00"), &mut ledger).unwrap();
        assert!(second.values().all(|o| *o == AdmissionOutcome::AlreadyMarkedToday));
        let next_day = admit(["alice"], at("2024-01-02 09:00:00"), &mut ledger).unwrap();
        assert_eq!(next_day["alice"], AdmissionOutcome::Admitted);
    }

    #[test]
    fn test_uniqueness_holds_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("attendance.db");
        let mut first = SqliteLedger::open(&path).unwrap();
        let mut second = SqliteLedger::open(&path).unwrap();

        assert!(first.append_record(&record("carol", "2024-02-02 08:00:00")).unwrap());
        assert!(second.has_record("carol", date("2024-02-02")).unwrap());
        assert!(!second.append_record(&record("carol", "2024-02-02 08:05:00")).unwrap());
        assert_eq!(second.all_records().unwrap().len(), 1);
    }

    #[test]
    fn test_records_round_trip_kind_and_order() {
        let mut ledger = SqliteLedger::open_in_memory().unwrap();
        let mut manual = record("bob", "2024-03-02 10:00:00");
        manual.kind = MarkKind::Manual;
        ledger.append_record(&manual).unwrap();
        ledger.append_record(&record("alice", "2024-03-01 09:00:00")).unwrap();
        ledger.append_record(&record("alice", "2024-03-03 09:00:00")).unwrap();

        let all = ledger.all_records().unwrap();
        let labels: Vec<_> = all.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, ["alice", "bob", "alice"]);
        assert_eq!(all[1], manual);

        let since = ledger.records_since(date("2024-03-02")).unwrap();
        assert_eq!(since.len(), 2);
        let window = ledger
            .records_between(date("2024-03-01"), date("2024-03-02"))
            .unwrap();
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_user_registry() {
        let mut ledger = SqliteLedger::open_in_memory().unwrap();
        let alice = NewUser {
            name: "alice".into(),
            email: Some("alice@example.org".into()),
            department: Some("R&D".into()),
            role: None,
        };
        assert!(ledger.add_user(&alice).unwrap());
        assert!(!ledger.add_user(&alice).unwrap());

        // Admission auto-creates unknown people.
        ledger.append_record(&record("bob", "2024-01-01 09:00:00")).unwrap();
        ledger.ensure_user("carol").unwrap();
        ledger.ensure_user("alice").unwrap();

        let users = ledger.users().unwrap();
        let names: Vec<_> = users.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, ["alice", "bob", "carol"]);
        assert_eq!(users[0].department.as_deref(), Some("R&D"));
    }

    #[test]
    fn test_export_csv_quotes_fields() {
        let mut ledger = SqliteLedger::open_in_memory().unwrap();
        ledger.append_record(&record("Doe, Jane", "2024-01-01 09:00:00")).unwrap();
        ledger.append_record(&record("bob", "2024-01-01 09:30:00")).unwrap();

        let mut out = Vec::new();
        let rows = ledger.export_csv(&mut out).unwrap();
        assert_eq!(rows, 2);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Name,Time,Kind\n\"Doe, Jane\",2024-01-01 09:00:00,auto\nbob,2024-01-01 09:30:00,auto\n"
        );
    }

    #[test]
    fn test_csv_field() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}

//! SQLite implementation of the cohort store traits.
//!
//! One database holds all four tables. Membership history is maintained by
//! AFTER INSERT / AFTER DELETE triggers on `memberships`, so every add and
//! remove is recorded no matter which code path performed it (edit, bulk
//! enrollment, or the expiration sweeper). The upsert's DO UPDATE path fires
//! no insert trigger, so refreshing `until` does not duplicate history.

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::path::Path;

use cohort_core::{
    format_until, CohortError, CohortResult, HistoryRecord, HistoryStore, MembershipStore,
    MembershipUpdate, NewSegment, NewUser, Operation, Segment, SegmentCatalog, User,
    UserDirectory,
};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, PrimitiveDateTime};

const MIGRATION_VERSION: i64 = 1;

// memberships and membership_history carry no foreign keys on purpose:
// deleting a segment leaves its edges behind, and the history triggers
// resolve the slug at write time (falling back to '' once the segment row
// is gone). Existence checks live in the orchestrator.
const SCHEMA_COHORT_V1: &str = r"
CREATE TABLE IF NOT EXISTS users (
  user_id INTEGER PRIMARY KEY AUTOINCREMENT,
  username TEXT NOT NULL UNIQUE,
  first_name TEXT NOT NULL,
  last_name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS segments (
  segment_id INTEGER PRIMARY KEY AUTOINCREMENT,
  slug TEXT NOT NULL UNIQUE,
  percent INTEGER CHECK (percent BETWEEN 1 AND 100 OR percent IS NULL)
);

CREATE TABLE IF NOT EXISTS memberships (
  user_id INTEGER NOT NULL,
  segment_id INTEGER NOT NULL,
  until TEXT,
  PRIMARY KEY (user_id, segment_id)
);

CREATE INDEX IF NOT EXISTS idx_memberships_until
  ON memberships(until) WHERE until IS NOT NULL;

CREATE TABLE IF NOT EXISTS membership_history (
  record_id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id INTEGER NOT NULL,
  segment_slug TEXT NOT NULL,
  operation TEXT NOT NULL CHECK (operation IN ('add', 'remove')),
  datetime TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_membership_history_datetime
  ON membership_history(datetime);

CREATE TRIGGER IF NOT EXISTS trg_memberships_history_add
AFTER INSERT ON memberships
BEGIN
  INSERT INTO membership_history(user_id, segment_slug, operation, datetime)
  VALUES (
    NEW.user_id,
    COALESCE((SELECT slug FROM segments WHERE segment_id = NEW.segment_id), ''),
    'add',
    strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
  );
END;

CREATE TRIGGER IF NOT EXISTS trg_memberships_history_remove
AFTER DELETE ON memberships
BEGIN
  INSERT INTO membership_history(user_id, segment_slug, operation, datetime)
  VALUES (
    OLD.user_id,
    COALESCE((SELECT slug FROM segments WHERE segment_id = OLD.segment_id), ''),
    'remove',
    strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
  );
END;
";

/// Shared SQLite store. The connection sits behind a mutex so one store can
/// serve concurrent request handlers and the sweeper; every trait method is
/// a single statement (or one transaction) under the lock.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn db_err(operation: &'static str) -> impl FnOnce(rusqlite::Error) -> CohortError {
    move |err| CohortError::internal(operation, err)
}

/// Uniqueness races lose at the constraint, not at the pre-check; the loser
/// must see a Conflict-kind error rather than a generic internal one.
fn constraint_or_internal(
    operation: &'static str,
    conflict: CohortError,
) -> impl FnOnce(rusqlite::Error) -> CohortError {
    move |err| match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            conflict
        }
        _ => CohortError::internal(operation, err),
    }
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        user_id: row.get(0)?,
        username: row.get(1)?,
        first_name: row.get(2)?,
        last_name: row.get(3)?,
    })
}

fn row_to_segment(row: &Row<'_>) -> rusqlite::Result<Segment> {
    Ok(Segment {
        segment_id: row.get(0)?,
        slug: row.get(1)?,
        percent: row.get(2)?,
    })
}

impl SqliteStore {
    pub fn open(path: &Path) -> CohortResult<Self> {
        let conn = Connection::open(path)
            .map_err(|err| CohortError::internal("open sqlite database", err))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(db_err("configure sqlite pragmas"))?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn migrate(&self) -> CohortResult<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
             );",
        )
        .map_err(db_err("ensure schema_migrations exists"))?;

        conn.execute_batch(SCHEMA_COHORT_V1)
            .map_err(db_err("apply cohort schema"))?;

        let now = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|err| CohortError::internal("format migration timestamp", err))?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![MIGRATION_VERSION, now],
        )
        .map_err(db_err("register cohort schema migration"))?;

        Ok(())
    }
}

impl UserDirectory for SqliteStore {
    fn insert_user(&self, user: &NewUser) -> CohortResult<u64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users(username, first_name, last_name) VALUES (?1, ?2, ?3)",
            params![user.username, user.first_name, user.last_name],
        )
        .map_err(constraint_or_internal(
            "insert user",
            CohortError::UsernameTaken,
        ))?;

        u64::try_from(conn.last_insert_rowid())
            .map_err(|err| CohortError::internal("insert user rowid", err))
    }

    fn update_user(&self, user: &User) -> CohortResult<()> {
        self.conn
            .lock()
            .execute(
                "UPDATE users SET username = ?1, first_name = ?2, last_name = ?3
                 WHERE user_id = ?4",
                params![user.username, user.first_name, user.last_name, user.user_id],
            )
            .map_err(constraint_or_internal(
                "update user",
                CohortError::UsernameTaken,
            ))?;

        Ok(())
    }

    fn delete_user(&self, user_id: u64) -> CohortResult<()> {
        self.conn
            .lock()
            .execute("DELETE FROM users WHERE user_id = ?1", params![user_id])
            .map_err(db_err("delete user"))?;

        Ok(())
    }

    fn user_by_id(&self, user_id: u64) -> CohortResult<Option<User>> {
        self.conn
            .lock()
            .query_row(
                "SELECT user_id, username, first_name, last_name FROM users
                 WHERE user_id = ?1",
                params![user_id],
                row_to_user,
            )
            .optional()
            .map_err(db_err("select user by id"))
    }

    fn user_by_username(&self, username: &str) -> CohortResult<Option<User>> {
        self.conn
            .lock()
            .query_row(
                "SELECT user_id, username, first_name, last_name FROM users
                 WHERE username = ?1",
                params![username],
                row_to_user,
            )
            .optional()
            .map_err(db_err("select user by username"))
    }

    fn all_user_ids(&self) -> CohortResult<Vec<u64>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT user_id FROM users ORDER BY user_id ASC")
            .map_err(db_err("prepare user id listing"))?;

        let mut rows = stmt.query([]).map_err(db_err("list user ids"))?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next().map_err(db_err("list user ids"))? {
            ids.push(row.get(0).map_err(db_err("read user id"))?);
        }

        Ok(ids)
    }
}

impl SegmentCatalog for SqliteStore {
    fn insert_segment(&self, segment: &NewSegment) -> CohortResult<u64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO segments(slug, percent) VALUES (?1, ?2)",
            params![segment.slug, segment.percent],
        )
        .map_err(constraint_or_internal(
            "insert segment",
            CohortError::SlugTaken,
        ))?;

        u64::try_from(conn.last_insert_rowid())
            .map_err(|err| CohortError::internal("insert segment rowid", err))
    }

    fn delete_segment(&self, slug: &str) -> CohortResult<()> {
        self.conn
            .lock()
            .execute("DELETE FROM segments WHERE slug = ?1", params![slug])
            .map_err(db_err("delete segment"))?;

        Ok(())
    }

    fn segment_by_slug(&self, slug: &str) -> CohortResult<Option<Segment>> {
        self.conn
            .lock()
            .query_row(
                "SELECT segment_id, slug, percent FROM segments WHERE slug = ?1",
                params![slug],
                row_to_segment,
            )
            .optional()
            .map_err(db_err("select segment by slug"))
    }
}

impl MembershipStore for SqliteStore {
    fn upsert_memberships(&self, user_id: u64, updates: &[MembershipUpdate]) -> CohortResult<()> {
        if updates.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock();
        let tx = conn
            .unchecked_transaction()
            .map_err(db_err("begin membership upsert"))?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO memberships(user_id, segment_id, until) VALUES (?1, ?2, ?3)
                     ON CONFLICT(user_id, segment_id) DO UPDATE SET until = excluded.until",
                )
                .map_err(db_err("prepare membership upsert"))?;
            for update in updates {
                stmt.execute(params![user_id, update.segment_id, update.until])
                    .map_err(db_err("upsert membership"))?;
            }
        }
        tx.commit().map_err(db_err("commit membership upsert"))?;

        Ok(())
    }

    fn enroll_users(&self, segment_id: u64, user_ids: &[u64]) -> CohortResult<()> {
        if user_ids.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock();
        let tx = conn
            .unchecked_transaction()
            .map_err(db_err("begin bulk enrollment"))?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO memberships(user_id, segment_id, until) VALUES (?1, ?2, NULL)
                     ON CONFLICT(user_id, segment_id) DO NOTHING",
                )
                .map_err(db_err("prepare bulk enrollment"))?;
            for user_id in user_ids {
                stmt.execute(params![user_id, segment_id])
                    .map_err(db_err("enroll user"))?;
            }
        }
        tx.commit().map_err(db_err("commit bulk enrollment"))?;

        Ok(())
    }

    fn remove_memberships(&self, user_id: u64, segment_ids: &[u64]) -> CohortResult<()> {
        if segment_ids.is_empty() {
            return Ok(());
        }

        let placeholders = vec!["?"; segment_ids.len()].join(", ");
        let sql = format!(
            "DELETE FROM memberships WHERE user_id = ? AND segment_id IN ({placeholders})"
        );

        self.conn
            .lock()
            .execute(
                &sql,
                params_from_iter(std::iter::once(user_id).chain(segment_ids.iter().copied())),
            )
            .map_err(db_err("delete memberships"))?;

        Ok(())
    }

    fn segments_for_user(&self, user_id: u64) -> CohortResult<Vec<Segment>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT s.segment_id, s.slug, s.percent
                 FROM segments s
                 JOIN memberships m ON m.segment_id = s.segment_id
                 WHERE m.user_id = ?1
                 ORDER BY s.segment_id ASC",
            )
            .map_err(db_err("prepare segment listing"))?;

        let mut rows = stmt
            .query(params![user_id])
            .map_err(db_err("list segments for user"))?;
        let mut segments = Vec::new();
        while let Some(row) = rows.next().map_err(db_err("list segments for user"))? {
            segments.push(row_to_segment(row).map_err(db_err("read segment row"))?);
        }

        Ok(segments)
    }

    fn purge_expired(&self, now: PrimitiveDateTime) -> CohortResult<usize> {
        // The storage format is zero-padded, so lexicographic order is
        // chronological order and a string compare suffices.
        let cutoff = format_until(now)?;

        self.conn
            .lock()
            .execute(
                "DELETE FROM memberships WHERE until IS NOT NULL AND until < ?1",
                params![cutoff],
            )
            .map_err(db_err("purge expired memberships"))
    }
}

impl HistoryStore for SqliteStore {
    fn history_for_month(&self, year: i32, month: u8) -> CohortResult<Vec<HistoryRecord>> {
        let month_key = format!("{year:04}-{month:02}");
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT user_id, segment_slug, operation, datetime
                 FROM membership_history
                 WHERE strftime('%Y-%m', datetime) = ?1
                 ORDER BY record_id ASC",
            )
            .map_err(db_err("prepare history listing"))?;

        let mut rows = stmt
            .query(params![month_key])
            .map_err(db_err("list history records"))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().map_err(db_err("list history records"))? {
            let operation: String = row.get(2).map_err(db_err("read history operation"))?;
            let operation = Operation::parse(&operation).ok_or_else(|| {
                CohortError::Internal(format!("unknown history operation: {operation}"))
            })?;
            records.push(HistoryRecord {
                user_id: row.get(0).map_err(db_err("read history user"))?,
                segment_slug: row.get(1).map_err(db_err("read history slug"))?,
                operation,
                datetime: row.get(3).map_err(db_err("read history datetime"))?,
            });
        }

        Ok(records)
    }
}

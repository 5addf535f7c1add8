use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

use crate::models::CapturedRecord;

/// SQLite file holding either the local key/value cache or the local
/// application store, depending on which tables are used.
pub struct Database {
    conn: Connection,
    path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct StoredApplication {
    pub id: i64,
    pub record: CapturedRecord,
    pub applied_at: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct StoredResume {
    pub id: i64,
    pub user_id: Option<String>,
    pub payload: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn,
            path: PathBuf::from(":memory:"),
        };
        db.init()?;
        Ok(db)
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS applications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                identity TEXT NOT NULL UNIQUE,
                company TEXT NOT NULL,
                position TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'Applied' CHECK (status IN ('Applied', 'Interviewing', 'Offered', 'Rejected', 'Withdrawn')),
                applied_at TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS resumes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_applications_company ON applications(company);
            CREATE INDEX IF NOT EXISTS idx_resumes_user ON resumes(user_id);
            "#,
        )?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('kv', 'applications', 'resumes')",
            [],
            |row| row.get(0),
        )?;
        if tables < 3 {
            return Err(anyhow!(
                "Database at {} not initialized. Run 'hunt-relay init' first.",
                self.path.display()
            ));
        }
        Ok(())
    }

    // --- Key/value operations ---

    pub fn kv_get(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
            .optional()
            .with_context(|| format!("Failed to read key '{}'", key))
    }

    pub fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
                params![key, value],
            )
            .with_context(|| format!("Failed to write key '{}'", key))?;
        Ok(())
    }

    pub fn kv_remove(&self, key: &str) -> Result<()> {
        self.conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
        Ok(())
    }

    // --- Application operations ---

    /// Insert a record unless one with the same identity exists.
    /// Returns `None` for a duplicate.
    pub fn insert_application(
        &self,
        record: &CapturedRecord,
        applied_at: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        let identity = record.identity().to_string();
        let payload = serde_json::to_string(record)?;

        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO applications (identity, company, position, payload, status, applied_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                identity,
                record.company,
                record.position,
                payload,
                record.status.to_string(),
                applied_at.to_rfc3339()
            ],
        )?;

        if inserted == 0 {
            return Ok(None);
        }
        Ok(Some(self.conn.last_insert_rowid()))
    }

    pub fn list_applications(&self) -> Result<Vec<StoredApplication>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, payload, applied_at, created_at FROM applications ORDER BY id DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut applications = Vec::new();
        for row in rows {
            let (id, payload, applied_at, created_at) = row?;
            let record = serde_json::from_str(&payload)
                .with_context(|| format!("Corrupt application row #{}", id))?;
            applications.push(StoredApplication {
                id,
                record,
                applied_at,
                created_at,
            });
        }
        Ok(applications)
    }

    pub fn count_applications(&self) -> Result<i64> {
        let count = self
            .conn
            .query_row("SELECT COUNT(*) FROM applications", [], |row| row.get(0))?;
        Ok(count)
    }

    // --- Resume operations ---

    pub fn insert_resume(&self, user_id: Option<&str>, payload: &str) -> Result<StoredResume> {
        self.conn.execute(
            "INSERT INTO resumes (user_id, payload) VALUES (?1, ?2)",
            params![user_id, payload],
        )?;
        let id = self.conn.last_insert_rowid();
        self.get_resume(id)?
            .ok_or_else(|| anyhow!("Resume #{} vanished after insert", id))
    }

    pub fn update_resume(&self, id: i64, payload: &str) -> Result<Option<StoredResume>> {
        let updated = self.conn.execute(
            "UPDATE resumes SET payload = ?1, updated_at = datetime('now') WHERE id = ?2",
            params![payload, id],
        )?;
        if updated == 0 {
            return Ok(None);
        }
        self.get_resume(id)
    }

    pub fn get_resume(&self, id: i64) -> Result<Option<StoredResume>> {
        self.conn
            .query_row(
                "SELECT id, user_id, payload, created_at, updated_at FROM resumes WHERE id = ?1",
                [id],
                Self::row_to_resume,
            )
            .optional()
            .context("Failed to read resume")
    }

    pub fn list_resumes(&self, user_id: Option<&str>) -> Result<Vec<StoredResume>> {
        let mut sql = String::from(
            "SELECT id, user_id, payload, created_at, updated_at FROM resumes",
        );
        if user_id.is_some() {
            sql.push_str(" WHERE user_id = ?1");
        }
        sql.push_str(" ORDER BY updated_at DESC, id DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = if let Some(user) = user_id {
            stmt.query_map([user], Self::row_to_resume)?
        } else {
            stmt.query_map([], Self::row_to_resume)?
        };

        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list resumes")
    }

    pub fn delete_resume(&self, id: i64) -> Result<bool> {
        let deleted = self.conn.execute("DELETE FROM resumes WHERE id = ?1", [id])?;
        Ok(deleted > 0)
    }

    fn row_to_resume(row: &rusqlite::Row) -> rusqlite::Result<StoredResume> {
        Ok(StoredResume {
            id: row.get(0)?,
            user_id: row.get(1)?,
            payload: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }
}

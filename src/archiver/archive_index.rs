use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::archiver::domain::ArchiveRecord;
use crate::sync_ext::MutexExt;

/// Durable URL → archived-location index backed by SQLite.
///
/// `put` is idempotent on `source_url`: a second insert for the same URL
/// leaves the first record untouched and returns it. Lookups go through the
/// primary key, so they are better than O(log n).
pub struct ArchiveIndex {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS archived_videos (
    source_url          TEXT PRIMARY KEY,
    archive_url         TEXT NOT NULL,
    archive_message_id  INTEGER NOT NULL,
    archive_channel_id  INTEGER NOT NULL,
    guild_id            INTEGER NOT NULL,
    archived_at         TEXT NOT NULL
)";

impl ArchiveIndex {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open archive index at {}", path.display()))?;
        conn.execute(SCHEMA, [])
            .context("failed to create archive index schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory index, used by tests and by hosts that disable durability.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory index")?;
        conn.execute(SCHEMA, [])
            .context("failed to create archive index schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a record unless the URL is already archived; returns the
    /// record that is durable after the call (the existing one on conflict).
    pub fn put(&self, record: &ArchiveRecord) -> Result<ArchiveRecord> {
        let conn = self.conn.lock_unpoisoned();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO archived_videos
                 (source_url, archive_url, archive_message_id, archive_channel_id, guild_id, archived_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.source_url,
                    record.archive_url,
                    record.archive_message_id as i64,
                    record.archive_channel_id as i64,
                    record.guild_id as i64,
                    record.archived_at.to_rfc3339(),
                ],
            )
            .context("failed to insert archive record")?;
        if inserted == 0 {
            debug!(url = %record.source_url, "archive index already holds this url");
        }
        Self::fetch(&conn, &record.source_url)?
            .context("archive record missing immediately after insert")
    }

    pub fn get(&self, source_url: &str) -> Result<Option<ArchiveRecord>> {
        let conn = self.conn.lock_unpoisoned();
        Self::fetch(&conn, source_url)
    }

    pub fn has(&self, source_url: &str) -> Result<bool> {
        Ok(self.get(source_url)?.is_some())
    }

    fn fetch(conn: &Connection, source_url: &str) -> Result<Option<ArchiveRecord>> {
        conn.query_row(
            "SELECT source_url, archive_url, archive_message_id, archive_channel_id, guild_id, archived_at
             FROM archived_videos WHERE source_url = ?1",
            params![source_url],
            |row| {
                let archived_at: String = row.get(5)?;
                Ok(ArchiveRecord {
                    source_url: row.get(0)?,
                    archive_url: row.get(1)?,
                    archive_message_id: row.get::<_, i64>(2)? as u64,
                    archive_channel_id: row.get::<_, i64>(3)? as u64,
                    guild_id: row.get::<_, i64>(4)? as u64,
                    archived_at: DateTime::parse_from_rfc3339(&archived_at)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                })
            },
        )
        .optional()
        .context("failed to query archive index")
    }
}

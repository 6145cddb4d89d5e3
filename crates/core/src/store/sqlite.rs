// Trawl is an open source web crawling pipeline.
// Copyright (C) 2024 Trawl ApS
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{Store, Visit};
use crate::scheduler::ScheduleSink;
use crate::{Error, Result};

/// Embedded sql store backend.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn store_err<E: std::fmt::Display>(err: E) -> Error {
    Error::StoreIo(err.to_string())
}

fn parse_time(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .ok()
    })
}

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS visits (
        url TEXT PRIMARY KEY,
        last_visit TEXT,
        last_update TEXT,
        last_hash TEXT NOT NULL,
        update_frequency_secs INTEGER NOT NULL,
        update_backoff INTEGER NOT NULL,
        next_update TEXT,
        visit_count INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS queue (
        url TEXT PRIMARY KEY
    );
    CREATE TABLE IF NOT EXISTS queue_after (
        url TEXT PRIMARY KEY,
        at TEXT NOT NULL
    );
"#;

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn get_visit(conn: &Connection, url: &str) -> Result<Option<Visit>, Error> {
        conn.query_row(
            "SELECT url, last_visit, last_update, last_hash, update_frequency_secs,
                    update_backoff, next_update, visit_count
             FROM visits WHERE url = ?1",
            params![url],
            |row| {
                Ok(Visit {
                    url: row.get(0)?,
                    last_visit: parse_time(row.get(1)?),
                    last_update: parse_time(row.get(2)?),
                    last_hash: row.get(3)?,
                    update_frequency: Duration::from_secs(row.get::<_, u64>(4)?),
                    update_backoff: row.get(5)?,
                    next_update: parse_time(row.get(6)?),
                    visit_count: row.get(7)?,
                })
            },
        )
        .optional()
        .map_err(store_err)
    }
}

#[async_trait::async_trait]
impl Store for SqliteStore {
    async fn queue(&self, url: &str) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "INSERT OR REPLACE INTO queue (url) VALUES (?1)",
            params![url],
        )
        .map_err(store_err)?;

        Ok(())
    }

    async fn queue_at(&self, url: &str, at: DateTime<Utc>) -> Result<(), Error> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "INSERT OR REPLACE INTO queue_after (url, at) VALUES (?1, ?2)",
            params![url, at.to_rfc3339()],
        )
        .map_err(store_err)?;

        Ok(())
    }

    async fn is_queued(&self, url: &str) -> Result<bool, Error> {
        let conn = self.conn.lock().unwrap();

        let queued: Option<String> = conn
            .query_row("SELECT url FROM queue WHERE url = ?1", params![url], |row| {
                row.get(0)
            })
            .optional()
            .map_err(store_err)?;

        Ok(queued.is_some())
    }

    async fn visit(&self, url: &str, hash: &str) -> Result<Visit, Error> {
        let conn = self.conn.lock().unwrap();

        let prior = Self::get_visit(&conn, url)?;
        let visit = Visit::advance(prior, url, hash, Utc::now());

        conn.execute(
            "INSERT OR REPLACE INTO visits
             (url, last_visit, last_update, last_hash, update_frequency_secs,
              update_backoff, next_update, visit_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                visit.url,
                visit.last_visit.map(|t| t.to_rfc3339()),
                visit.last_update.map(|t| t.to_rfc3339()),
                visit.last_hash,
                visit.update_frequency.as_secs(),
                visit.update_backoff,
                visit.next_update.map(|t| t.to_rfc3339()),
                visit.visit_count,
            ],
        )
        .map_err(store_err)?;

        conn.execute("DELETE FROM queue WHERE url = ?1", params![url])
            .map_err(store_err)?;

        Ok(visit)
    }

    async fn should_visit(&self, url: &str) -> Result<bool, Error> {
        let conn = self.conn.lock().unwrap();

        Ok(match Self::get_visit(&conn, url)? {
            None => true,
            Some(visit) => visit
                .next_update
                .map(|next| next <= Utc::now())
                .unwrap_or(true),
        })
    }

    async fn has_visited(&self, url: &str) -> Result<bool, Error> {
        let conn = self.conn.lock().unwrap();
        Ok(Self::get_visit(&conn, url)?.is_some())
    }

    async fn reschedule(&self, sink: &dyn ScheduleSink) -> Result<(), Error> {
        let now = Utc::now();

        let due: Vec<String> = {
            let conn = self.conn.lock().unwrap();

            let mut stmt = conn
                .prepare("SELECT url, at FROM queue_after")
                .map_err(store_err)?;

            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(store_err)?;

            let mut due = Vec::new();
            for row in rows {
                let (url, at) = row.map_err(store_err)?;
                if let Some(at) = parse_time(Some(at)) {
                    if at <= now {
                        due.push(url);
                    }
                }
            }

            due
        };

        for url in due {
            {
                let conn = self.conn.lock().unwrap();

                conn.execute("DELETE FROM queue_after WHERE url = ?1", params![url])
                    .map_err(store_err)?;
                conn.execute(
                    "INSERT OR REPLACE INTO queue (url) VALUES (?1)",
                    params![url],
                )
                .map_err(store_err)?;
            }

            if let Err(err) = sink.schedule(&url) {
                tracing::warn!(url, error = %err, "failed to reschedule url");
            }
        }

        Ok(())
    }
}

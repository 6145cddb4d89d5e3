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

use std::time::Duration;

use chrono::{DateTime, Utc};
use scylla::prepared_statement::PreparedStatement;
use scylla::SessionBuilder;

use super::{Store, Visit};
use crate::scheduler::ScheduleSink;
use crate::{Error, Result};

/// Remote document store backend for deployments where multiple
/// processes share visit state. Timestamps are kept as rfc3339 text so
/// rows stay readable from any client.
pub struct ScyllaStore {
    session: scylla::Session,
    insert_visit: PreparedStatement,
    insert_queue: PreparedStatement,
    delete_queue: PreparedStatement,
    insert_queue_after: PreparedStatement,
    delete_queue_after: PreparedStatement,
}

fn store_err<E: std::fmt::Display>(err: E) -> Error {
    Error::StoreIo(err.to_string())
}

impl ScyllaStore {
    pub async fn connect(seed_node: &str) -> Result<Self> {
        let session = SessionBuilder::new().known_node(seed_node).build().await?;

        session.query("CREATE KEYSPACE IF NOT EXISTS trawl WITH REPLICATION = {'class' : 'SimpleStrategy', 'replication_factor' : 1}", &[]).await?;

        session
            .query(
                "CREATE TABLE IF NOT EXISTS trawl.visits (url text primary key, last_visit text, last_update text, last_hash text, update_frequency_secs bigint, update_backoff bigint, next_update text, visit_count bigint)",
                &[],
            )
            .await?;

        session
            .query(
                "CREATE TABLE IF NOT EXISTS trawl.queue (url text primary key)",
                &[],
            )
            .await?;

        session
            .query(
                "CREATE TABLE IF NOT EXISTS trawl.queue_after (url text primary key, at text)",
                &[],
            )
            .await?;

        let insert_visit = session
            .prepare(
                "INSERT INTO trawl.visits (url, last_visit, last_update, last_hash, update_frequency_secs, update_backoff, next_update, visit_count) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .await?;

        let insert_queue = session
            .prepare("INSERT INTO trawl.queue (url) VALUES (?)")
            .await?;

        let delete_queue = session
            .prepare("DELETE FROM trawl.queue WHERE url = ?")
            .await?;

        let insert_queue_after = session
            .prepare("INSERT INTO trawl.queue_after (url, at) VALUES (?, ?)")
            .await?;

        let delete_queue_after = session
            .prepare("DELETE FROM trawl.queue_after WHERE url = ?")
            .await?;

        Ok(Self {
            session,
            insert_visit,
            insert_queue,
            delete_queue,
            insert_queue_after,
            delete_queue_after,
        })
    }

    async fn get_visit(&self, url: &str) -> Result<Option<Visit>, Error> {
        let row = self
            .session
            .query(
                "SELECT url, last_visit, last_update, last_hash, update_frequency_secs, update_backoff, next_update, visit_count FROM trawl.visits WHERE url = ?",
                (url,),
            )
            .await
            .map_err(store_err)?
            .maybe_first_row_typed::<(
                String,
                Option<String>,
                Option<String>,
                Option<String>,
                i64,
                i64,
                Option<String>,
                i64,
            )>()
            .map_err(store_err)?;

        Ok(row.map(
            |(url, last_visit, last_update, last_hash, frequency_secs, backoff, next, count)| {
                Visit {
                    url,
                    last_visit: parse_time(last_visit),
                    last_update: parse_time(last_update),
                    last_hash: last_hash.unwrap_or_default(),
                    update_frequency: Duration::from_secs(frequency_secs.max(0) as u64),
                    update_backoff: backoff,
                    next_update: parse_time(next),
                    visit_count: count,
                }
            },
        ))
    }
}

fn parse_time(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .ok()
    })
}

#[async_trait::async_trait]
impl Store for ScyllaStore {
    async fn queue(&self, url: &str) -> Result<(), Error> {
        self.session
            .execute(&self.insert_queue, (url,))
            .await
            .map_err(store_err)?;

        Ok(())
    }

    async fn queue_at(&self, url: &str, at: DateTime<Utc>) -> Result<(), Error> {
        self.session
            .execute(&self.insert_queue_after, (url, at.to_rfc3339()))
            .await
            .map_err(store_err)?;

        Ok(())
    }

    async fn is_queued(&self, url: &str) -> Result<bool, Error> {
        let row = self
            .session
            .query("SELECT url FROM trawl.queue WHERE url = ?", (url,))
            .await
            .map_err(store_err)?
            .maybe_first_row_typed::<(String,)>()
            .map_err(store_err)?;

        Ok(row.is_some())
    }

    async fn visit(&self, url: &str, hash: &str) -> Result<Visit, Error> {
        let prior = self.get_visit(url).await?;
        let visit = Visit::advance(prior, url, hash, Utc::now());

        self.session
            .execute(
                &self.insert_visit,
                (
                    visit.url.as_str(),
                    visit.last_visit.map(|t| t.to_rfc3339()),
                    visit.last_update.map(|t| t.to_rfc3339()),
                    visit.last_hash.as_str(),
                    visit.update_frequency.as_secs() as i64,
                    visit.update_backoff,
                    visit.next_update.map(|t| t.to_rfc3339()),
                    visit.visit_count,
                ),
            )
            .await
            .map_err(store_err)?;

        self.session
            .execute(&self.delete_queue, (url,))
            .await
            .map_err(store_err)?;

        Ok(visit)
    }

    async fn should_visit(&self, url: &str) -> Result<bool, Error> {
        Ok(match self.get_visit(url).await? {
            None => true,
            Some(visit) => visit
                .next_update
                .map(|next| next <= Utc::now())
                .unwrap_or(true),
        })
    }

    async fn has_visited(&self, url: &str) -> Result<bool, Error> {
        Ok(self.get_visit(url).await?.is_some())
    }

    async fn reschedule(&self, sink: &dyn ScheduleSink) -> Result<(), Error> {
        let now = Utc::now();

        let rows = self
            .session
            .query("SELECT url, at FROM trawl.queue_after", &[])
            .await
            .map_err(store_err)?
            .rows_typed::<(String, Option<String>)>()
            .map_err(store_err)?;

        for row in rows {
            let (url, at) = row.map_err(store_err)?;

            let due = parse_time(at).map(|at| at <= now).unwrap_or(true);
            if !due {
                continue;
            }

            self.session
                .execute(&self.delete_queue_after, (url.as_str(),))
                .await
                .map_err(store_err)?;
            self.session
                .execute(&self.insert_queue, (url.as_str(),))
                .await
                .map_err(store_err)?;

            if let Err(err) = sink.schedule(&url) {
                tracing::warn!(url, error = %err, "failed to reschedule url");
            }
        }

        Ok(())
    }
}

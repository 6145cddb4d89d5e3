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

use chrono::{DateTime, Utc};
use redb::{ReadableTable, TableDefinition};

use super::{Store, Visit};
use crate::scheduler::ScheduleSink;
use crate::{Error, Result};

const VISITS: TableDefinition<'static, &'static str, &'static [u8]> =
    TableDefinition::new("visits");
const QUEUE: TableDefinition<'static, &'static str, ()> = TableDefinition::new("queue");
const QUEUE_AFTER: TableDefinition<'static, &'static str, &'static str> =
    TableDefinition::new("queue_after");

/// Embedded key-value store backend. Visits are serialized rows keyed by
/// normalized url; the deferred queue maps url to its rfc3339 not-before
/// time.
pub struct RedbStore {
    inner: Mutex<InnerDb>,
}

struct InnerDb {
    db: redb::Database,
}

fn store_err<E: std::fmt::Display>(err: E) -> Error {
    Error::StoreIo(err.to_string())
}

impl InnerDb {
    fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().join("scheduler.db");

        let db = if !path.exists() {
            if let Some(parent) = path.parent() {
                if !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }

            redb::Database::create(&path)?
        } else {
            redb::Database::open(&path)?
        };

        // make sure the tables exist
        let txn = db.begin_write()?;

        txn.open_table(VISITS)?;
        txn.open_table(QUEUE)?;
        txn.open_table(QUEUE_AFTER)?;

        txn.commit()?;

        Ok(Self { db })
    }

    fn get_visit(&self, url: &str) -> Result<Option<Visit>, Error> {
        let txn = self.db.begin_read().map_err(store_err)?;
        let table = txn.open_table(VISITS).map_err(store_err)?;

        match table.get(url).map_err(store_err)? {
            Some(row) => {
                let visit = serde_json::from_slice(row.value()).map_err(store_err)?;
                Ok(Some(visit))
            }
            None => Ok(None),
        }
    }

    fn put_visit_and_dequeue(&self, visit: &Visit) -> Result<(), Error> {
        let row = serde_json::to_vec(visit).map_err(store_err)?;

        let txn = self.db.begin_write().map_err(store_err)?;
        {
            let mut visits = txn.open_table(VISITS).map_err(store_err)?;
            visits
                .insert(visit.url.as_str(), row.as_slice())
                .map_err(store_err)?;

            let mut queue = txn.open_table(QUEUE).map_err(store_err)?;
            queue.remove(visit.url.as_str()).map_err(store_err)?;
        }
        txn.commit().map_err(store_err)?;

        Ok(())
    }
}

impl RedbStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = InnerDb::open(path)?;

        Ok(Self {
            inner: Mutex::new(db),
        })
    }
}

#[async_trait::async_trait]
impl Store for RedbStore {
    async fn queue(&self, url: &str) -> Result<(), Error> {
        let inner = self.inner.lock().unwrap();

        let txn = inner.db.begin_write().map_err(store_err)?;
        {
            let mut queue = txn.open_table(QUEUE).map_err(store_err)?;
            queue.insert(url, ()).map_err(store_err)?;
        }
        txn.commit().map_err(store_err)?;

        Ok(())
    }

    async fn queue_at(&self, url: &str, at: DateTime<Utc>) -> Result<(), Error> {
        let inner = self.inner.lock().unwrap();

        let txn = inner.db.begin_write().map_err(store_err)?;
        {
            let mut queue_after = txn.open_table(QUEUE_AFTER).map_err(store_err)?;
            queue_after
                .insert(url, at.to_rfc3339().as_str())
                .map_err(store_err)?;
        }
        txn.commit().map_err(store_err)?;

        Ok(())
    }

    async fn is_queued(&self, url: &str) -> Result<bool, Error> {
        let inner = self.inner.lock().unwrap();

        let txn = inner.db.begin_read().map_err(store_err)?;
        let queue = txn.open_table(QUEUE).map_err(store_err)?;

        Ok(queue.get(url).map_err(store_err)?.is_some())
    }

    async fn visit(&self, url: &str, hash: &str) -> Result<Visit, Error> {
        let inner = self.inner.lock().unwrap();

        let prior = inner.get_visit(url)?;
        let visit = Visit::advance(prior, url, hash, Utc::now());

        inner.put_visit_and_dequeue(&visit)?;

        Ok(visit)
    }

    async fn should_visit(&self, url: &str) -> Result<bool, Error> {
        let inner = self.inner.lock().unwrap();

        Ok(match inner.get_visit(url)? {
            None => true,
            Some(visit) => visit
                .next_update
                .map(|next| next <= Utc::now())
                .unwrap_or(true),
        })
    }

    async fn has_visited(&self, url: &str) -> Result<bool, Error> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.get_visit(url)?.is_some())
    }

    async fn reschedule(&self, sink: &dyn ScheduleSink) -> Result<(), Error> {
        let now = Utc::now();

        let due: Vec<String> = {
            let inner = self.inner.lock().unwrap();

            let txn = inner.db.begin_read().map_err(store_err)?;
            let queue_after = txn.open_table(QUEUE_AFTER).map_err(store_err)?;

            let mut due = Vec::new();
            for row in queue_after.iter().map_err(store_err)? {
                let (url, at) = row.map_err(store_err)?;

                let at = DateTime::parse_from_rfc3339(at.value()).map_err(store_err)?;
                if at.with_timezone(&Utc) <= now {
                    due.push(url.value().to_string());
                }
            }

            due
        };

        for url in due {
            {
                let inner = self.inner.lock().unwrap();

                let txn = inner.db.begin_write().map_err(store_err)?;
                {
                    let mut queue_after = txn.open_table(QUEUE_AFTER).map_err(store_err)?;
                    queue_after.remove(url.as_str()).map_err(store_err)?;

                    let mut queue = txn.open_table(QUEUE).map_err(store_err)?;
                    queue.insert(url.as_str(), ()).map_err(store_err)?;
                }
                txn.commit().map_err(store_err)?;
            }

            if let Err(err) = sink.schedule(&url) {
                tracing::warn!(url, error = %err, "failed to reschedule url");
            }
        }

        Ok(())
    }
}

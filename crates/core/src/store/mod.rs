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

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::scheduler::ScheduleSink;
use crate::Error;

mod redb;
mod scylla;
mod sqlite;

pub use self::redb::RedbStore;
pub use self::scylla::ScyllaStore;
pub use self::sqlite::SqliteStore;

pub const BASE_UPDATE_FREQUENCY: Duration = Duration::from_secs(15 * 60);

/// The re-crawl interval stops doubling at this backoff count, which
/// caps it at 2^12 times the base frequency.
pub const MAX_UPDATE_BACKOFF: i64 = 12;

/// Per-url visit state, updated on every successful crawl.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Visit {
    pub url: String,
    pub last_visit: Option<DateTime<Utc>>,
    pub last_update: Option<DateTime<Utc>>,
    pub last_hash: String,
    pub update_frequency: Duration,
    pub update_backoff: i64,
    pub next_update: Option<DateTime<Utc>>,
    pub visit_count: i64,
}

impl Visit {
    /// Advance the visit state for a crawl of `url` that observed
    /// `hash`. Repeated identical content doubles the re-crawl interval
    /// until the backoff cap; changed content resets it to the base
    /// frequency.
    pub fn advance(prior: Option<Visit>, url: &str, hash: &str, now: DateTime<Utc>) -> Visit {
        match prior {
            None => Visit {
                url: url.to_string(),
                last_visit: Some(now),
                last_update: Some(now),
                last_hash: hash.to_string(),
                update_frequency: BASE_UPDATE_FREQUENCY,
                update_backoff: 1,
                next_update: Some(now + BASE_UPDATE_FREQUENCY),
                visit_count: 1,
            },
            Some(mut visit) => {
                visit.last_visit = Some(now);
                visit.last_update = Some(now);
                visit.visit_count += 1;

                if visit.last_hash == hash {
                    if visit.update_backoff < MAX_UPDATE_BACKOFF {
                        visit.update_frequency =
                            (visit.update_frequency * 2).min(BASE_UPDATE_FREQUENCY * 4096);
                        visit.update_backoff += 1;
                    }
                } else {
                    visit.update_frequency = BASE_UPDATE_FREQUENCY;
                    visit.update_backoff = 1;
                    visit.last_hash = hash.to_string();
                }

                visit.next_update = Some(now + visit.update_frequency);
                visit
            }
        }
    }
}

/// Persists visit state, queue membership and deferred urls. A transient
/// backend failure must not crash the pipeline; callers observe the
/// error and retry at the next tick.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Record that the url has been handed to the scheduler.
    async fn queue(&self, url: &str) -> Result<(), Error>;

    /// Record that the url should be scheduled no earlier than `at`.
    async fn queue_at(&self, url: &str, at: DateTime<Utc>) -> Result<(), Error>;

    async fn is_queued(&self, url: &str) -> Result<bool, Error>;

    /// Register a visit of `url` with the observed content hash and
    /// remove the url from the queue. Returns the updated visit.
    async fn visit(&self, url: &str, hash: &str) -> Result<Visit, Error>;

    /// True iff no visit exists or the next update is due.
    async fn should_visit(&self, url: &str) -> Result<bool, Error>;

    async fn has_visited(&self, url: &str) -> Result<bool, Error>;

    /// Move every deferred url whose not-before time has passed into the
    /// primary queue and hand it back to the scheduler.
    async fn reschedule(&self, sink: &dyn ScheduleSink) -> Result<(), Error>;
}

/// In-memory store for tests and single-process runs.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<MemInner>,
}

#[derive(Default)]
struct MemInner {
    visits: HashMap<String, Visit>,
    queue: HashSet<String>,
    queue_after: HashMap<String, DateTime<Utc>>,
}

#[async_trait::async_trait]
impl Store for MemStore {
    async fn queue(&self, url: &str) -> Result<(), Error> {
        self.inner.lock().unwrap().queue.insert(url.to_string());
        Ok(())
    }

    async fn queue_at(&self, url: &str, at: DateTime<Utc>) -> Result<(), Error> {
        self.inner
            .lock()
            .unwrap()
            .queue_after
            .insert(url.to_string(), at);
        Ok(())
    }

    async fn is_queued(&self, url: &str) -> Result<bool, Error> {
        Ok(self.inner.lock().unwrap().queue.contains(url))
    }

    async fn visit(&self, url: &str, hash: &str) -> Result<Visit, Error> {
        let mut inner = self.inner.lock().unwrap();

        let prior = inner.visits.get(url).cloned();
        let visit = Visit::advance(prior, url, hash, Utc::now());

        inner.visits.insert(url.to_string(), visit.clone());
        inner.queue.remove(url);

        Ok(visit)
    }

    async fn should_visit(&self, url: &str) -> Result<bool, Error> {
        let inner = self.inner.lock().unwrap();

        Ok(match inner.visits.get(url) {
            None => true,
            Some(visit) => visit
                .next_update
                .map(|next| next <= Utc::now())
                .unwrap_or(true),
        })
    }

    async fn has_visited(&self, url: &str) -> Result<bool, Error> {
        Ok(self.inner.lock().unwrap().visits.contains_key(url))
    }

    async fn reschedule(&self, sink: &dyn ScheduleSink) -> Result<(), Error> {
        let now = Utc::now();

        let due: Vec<String> = {
            let inner = self.inner.lock().unwrap();
            inner
                .queue_after
                .iter()
                .filter(|(_, at)| **at <= now)
                .map(|(url, _)| url.clone())
                .collect()
        };

        for url in due {
            {
                let mut inner = self.inner.lock().unwrap();
                inner.queue_after.remove(&url);
                inner.queue.insert(url.clone());
            }

            if let Err(err) = sink.schedule(&url) {
                tracing::warn!(url, error = %err, "failed to reschedule url");
            }
        }

        Ok(())
    }
}

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

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::config::SchedulerConfig;
use crate::crawler::{Client, CrawlRecord};
use crate::metrics::Instrument;
use crate::webpage::url_ext::UrlExt;
use crate::Error;

/// Anything that accepts urls for scheduling. Implemented by the
/// scheduler itself; feed sources and stores depend on this seam
/// instead of the concrete scheduler.
pub trait ScheduleSink: Send + Sync {
    fn schedule(&self, url: &str) -> Result<(), Error>;
}

/// Outcome of a harvest callback. `CancelSchedule` tells the scheduler
/// the callback took care of scheduling itself, suppressing the
/// automatic fan-out of harvested urls.
pub enum Harvest {
    Continue,
    CancelSchedule,
}

pub type HarvestFn = dyn Fn(&CrawlRecord) -> Harvest + Send + Sync;

/// Owns admission of urls into the crawl service and enforces
/// politeness: per-host queues drained one url per host per tick, which
/// gives each host a minimum inter-request spacing of the crawl delay.
pub struct Scheduler {
    client: Arc<dyn Client>,
    instrument: Arc<dyn Instrument>,
    allowed_hosts: HashSet<String>,
    crawl_delay: Duration,
    shutdown_timeout: Duration,
    state: Mutex<SchedState>,
    harvest: Mutex<Option<Arc<HarvestFn>>>,
    quit: Mutex<Option<mpsc::Sender<oneshot::Sender<()>>>>,
}

#[derive(Default)]
struct SchedState {
    visited: HashSet<String>,
    queued: HashSet<String>,
    pending: HashMap<String, VecDeque<Url>>,
}

impl Scheduler {
    pub fn new(
        config: &SchedulerConfig,
        client: Arc<dyn Client>,
        instrument: Arc<dyn Instrument>,
    ) -> Self {
        Self {
            client,
            instrument,
            allowed_hosts: config.allowed_hosts.iter().cloned().collect(),
            crawl_delay: Duration::from_millis(config.crawl_delay_ms),
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
            state: Mutex::new(SchedState::default()),
            harvest: Mutex::new(None),
            quit: Mutex::new(None),
        }
    }

    /// Install the callback invoked with every completed crawl, after
    /// publication and before the harvested urls are rescheduled.
    pub fn on_harvest<F>(&self, callback: F)
    where
        F: Fn(&CrawlRecord) -> Harvest + Send + Sync + 'static,
    {
        *self.harvest.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Admit a url: normalize, drop disallowed hosts and already
    /// visited or queued urls, then prepend to the host's queue.
    pub fn schedule(&self, url: &str) -> Result<(), Error> {
        let url = Url::parse_normalized(url)?;
        let host = url.host_str().unwrap_or_default().to_string();

        if !self.allowed_hosts.contains(&host) {
            self.instrument.count("scheduler_host_denied");
            return Ok(());
        }

        {
            let mut state = self.state.lock().unwrap();

            if state.visited.contains(url.as_str()) || state.queued.contains(url.as_str()) {
                return Ok(());
            }

            state.queued.insert(url.as_str().to_string());
            state
                .pending
                .entry(host.clone())
                .or_default()
                .push_front(url);
        }

        self.instrument.count("scheduler_url_scheduled");
        self.instrument.histogram("scheduler_host", &host);

        Ok(())
    }

    /// Spawn the politeness ticker.
    pub fn start(self: &Arc<Self>) {
        let (quit_tx, quit_rx) = mpsc::channel(1);
        *self.quit.lock().unwrap() = Some(quit_tx);

        let scheduler = Arc::clone(self);
        tokio::spawn(scheduler.run(quit_rx));
    }

    /// Signal the ticker to exit. In-flight crawls continue to
    /// completion but their results may not be reinjected.
    pub async fn stop(&self) -> Result<(), Error> {
        let quit = self.quit.lock().unwrap().take();

        let Some(quit) = quit else { return Ok(()) };

        let (ack_tx, ack_rx) = oneshot::channel();
        if quit.send(ack_tx).await.is_err() {
            return Ok(());
        }

        match tokio::time::timeout(self.shutdown_timeout, ack_rx).await {
            Ok(Ok(())) => Ok(()),
            _ => Err(Error::ShutdownTimeout),
        }
    }

    async fn run(self: Arc<Self>, mut quit: mpsc::Receiver<oneshot::Sender<()>>) {
        let mut interval = tokio::time::interval(self.crawl_delay);

        loop {
            tokio::select! {
                ack = quit.recv() => {
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                    return;
                }
                _ = interval.tick() => {
                    for url in self.pop_batch() {
                        let scheduler = Arc::clone(&self);
                        tokio::spawn(async move {
                            scheduler.crawl_one(url).await;
                        });
                    }
                }
            }
        }
    }

    /// Pop at most one url per host.
    fn pop_batch(&self) -> Vec<Url> {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;

        let mut batch = Vec::new();
        for queue in state.pending.values_mut() {
            if let Some(url) = queue.pop_front() {
                state.queued.remove(url.as_str());
                batch.push(url);
            }
        }

        batch
    }

    async fn crawl_one(&self, url: Url) {
        let record = match self.client.crawl(url.as_str()).await {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(url = %url, error = %err, "crawl request failed");
                return;
            }
        };

        if let Some(code) = &record.error_code {
            tracing::warn!(url = %url, code, "crawl completed with error, not visiting");
            return;
        }

        self.state
            .lock()
            .unwrap()
            .visited
            .insert(url.as_str().to_string());

        let harvest = self.harvest.lock().unwrap().clone();
        if let Some(harvest) = harvest {
            if matches!(harvest(&record), Harvest::CancelSchedule) {
                return;
            }
        }

        for harvested in &record.harvested_urls {
            match Url::parse_with_base_url(&url, harvested) {
                Ok(resolved) => {
                    if let Err(err) = self.schedule(resolved.as_str()) {
                        tracing::warn!(url = %resolved, error = %err, "failed to schedule harvested url");
                    }
                }
                // malformed harvested urls are dropped
                Err(_) => continue,
            }
        }
    }
}

impl ScheduleSink for Scheduler {
    fn schedule(&self, url: &str) -> Result<(), Error> {
        Scheduler::schedule(self, url)
    }
}

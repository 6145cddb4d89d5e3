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

//! Host-feed sources: independent tasks that periodically pull urls
//! from a remote site index or feed and inject the new ones into the
//! scheduler. Transient fetch and parse failures log and skip the
//! iteration; the tick loop never wedges.

use std::collections::HashSet;
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::config::{
    FeedConfig, HostConfig, RssSourceData, SitemapSourceData, SourceKind,
};
use crate::scheduler::ScheduleSink;
use crate::sitemap::{parse_sitemap, SitemapEntry};
use crate::store::Store;
use crate::{Error, Result};

pub mod parser;

/// A started source is stopped through its handle; the variants exist
/// because the two source kinds carry different state.
pub enum Source {
    Sitemap(Arc<SitemapSource>),
    Feed(Arc<FeedSource>),
}

impl Source {
    pub fn start(&self, sink: Arc<dyn ScheduleSink>, store: Arc<dyn Store>) {
        match self {
            Source::Sitemap(source) => source.start(sink, store),
            Source::Feed(source) => source.start(sink, store),
        }
    }

    pub async fn stop(&self) -> Result<(), Error> {
        match self {
            Source::Sitemap(source) => source.stop().await,
            Source::Feed(source) => source.stop().await,
        }
    }
}

/// Build the feed sources configured for one host.
pub fn sources_from_host(host: &HostConfig, config: &FeedConfig) -> Result<Vec<Source>> {
    let mut sources = Vec::new();

    for spec in &host.sources {
        match spec.kind {
            SourceKind::Sitemap => {
                let data: SitemapSourceData = serde_json::from_value(spec.data.clone())?;
                sources.push(Source::Sitemap(Arc::new(SitemapSource::from_config(
                    &data, config,
                )?)));
            }
            SourceKind::Rss => {
                let data: RssSourceData = serde_json::from_value(spec.data.clone())?;
                sources.push(Source::Feed(Arc::new(FeedSource::from_config(
                    &data, config,
                )?)));
            }
        }
    }

    Ok(sources)
}

/// Queue and schedule a url unless the store already knows it as
/// visited or queued. Store failures are logged and the url is skipped
/// until the next tick.
async fn admit(url: &str, sink: &dyn ScheduleSink, store: &dyn Store) {
    let known = async {
        Ok::<_, Error>(store.has_visited(url).await? || store.is_queued(url).await?)
    }
    .await;

    match known {
        Ok(true) => {}
        Ok(false) => {
            if let Err(err) = store.queue(url).await {
                tracing::warn!(url, error = %err, "failed to mark url queued");
                return;
            }

            if let Err(err) = sink.schedule(url) {
                tracing::warn!(url, error = %err, "failed to schedule url");
            }
        }
        Err(err) => {
            tracing::warn!(url, error = %err, "store failure, skipping url");
        }
    }
}

/// Fetch a document, transparently decompressing gzip payloads (either
/// by content type or by magic bytes, since many sitemap servers lie).
async fn fetch_document(client: &reqwest::Client, url: &Url) -> Result<String, Error> {
    let response = client
        .get(url.clone())
        .send()
        .await
        .map_err(|err| Error::FetchTransport(err.to_string()))?;

    let status = response.status().as_u16();
    if status >= 400 {
        return Err(Error::FetchStatus(status));
    }

    let gzip_content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|ct| ct.contains("gzip"))
        .unwrap_or(false);

    let bytes = response
        .bytes()
        .await
        .map_err(|err| Error::BodyRead(err.to_string()))?;

    if gzip_content_type || bytes.starts_with(&[0x1f, 0x8b]) {
        let mut out = String::new();
        GzDecoder::new(bytes.as_ref())
            .read_to_string(&mut out)
            .map_err(|err| Error::BodyRead(err.to_string()))?;
        Ok(out)
    } else {
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

pub enum SitemapFilter {
    Contains(Vec<String>),
}

impl SitemapFilter {
    fn matches(&self, url: &str) -> bool {
        match self {
            SitemapFilter::Contains(needles) => needles.iter().any(|needle| url.contains(needle)),
        }
    }
}

/// Pulls a site-index document on a periodic tick, descends into child
/// sitemaps that changed since the last run, and schedules the fresh
/// urls.
pub struct SitemapSource {
    client: reqwest::Client,
    sitemaps: Vec<Url>,
    exclude: HashSet<String>,
    filter: Option<SitemapFilter>,
    interval: Duration,
    last_run: Mutex<Option<DateTime<Utc>>>,
    quit: Mutex<Option<mpsc::Sender<oneshot::Sender<()>>>>,
}

impl SitemapSource {
    pub fn from_config(data: &SitemapSourceData, config: &FeedConfig) -> Result<Self> {
        let sitemaps = data
            .sitemaps
            .iter()
            .map(|raw| Url::parse(raw).map_err(|_| Error::MalformedUrl(raw.clone())))
            .collect::<Result<Vec<_>, _>>()?;

        let contains: Vec<String> = data
            .filter
            .iter()
            .flat_map(|filter| filter.contains.iter().cloned())
            .collect();

        let filter = if contains.is_empty() {
            None
        } else {
            Some(SitemapFilter::Contains(contains))
        };

        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()?,
            sitemaps,
            exclude: data.exclude.iter().cloned().collect(),
            filter,
            interval: Duration::from_secs(config.interval_secs),
            last_run: Mutex::new(None),
            quit: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>, sink: Arc<dyn ScheduleSink>, store: Arc<dyn Store>) {
        let (quit_tx, quit_rx) = mpsc::channel(1);
        *self.quit.lock().unwrap() = Some(quit_tx);

        let source = Arc::clone(self);
        tokio::spawn(async move {
            source.run(sink, store, quit_rx).await;
        });
    }

    pub async fn stop(&self) -> Result<(), Error> {
        stop_through(&self.quit).await
    }

    async fn run(
        &self,
        sink: Arc<dyn ScheduleSink>,
        store: Arc<dyn Store>,
        mut quit: mpsc::Receiver<oneshot::Sender<()>>,
    ) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                ack = quit.recv() => {
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                    return;
                }
                _ = interval.tick() => {
                    self.run_once(&*sink, &*store).await;
                }
            }
        }
    }

    async fn run_once(&self, sink: &dyn ScheduleSink, store: &dyn Store) {
        // first run looks one day back instead of crawling all history
        let last_run = self
            .last_run
            .lock()
            .unwrap()
            .unwrap_or_else(|| Utc::now() - chrono::Duration::hours(24));

        for sitemap_url in &self.sitemaps {
            let body = match fetch_document(&self.client, sitemap_url).await {
                Ok(body) => body,
                Err(err) => {
                    tracing::warn!(url = %sitemap_url, error = %err, "failed to fetch sitemap");
                    continue;
                }
            };

            let mut urls = Vec::new();
            let mut children = Vec::new();

            for entry in parse_sitemap(&body) {
                match entry {
                    SitemapEntry::Url(dated) => urls.push(dated),
                    SitemapEntry::Sitemap(dated) => children.push(dated),
                }
            }

            for child in children {
                let Some(lastmod) = child.last_modified else {
                    continue;
                };

                if lastmod <= last_run {
                    continue;
                }

                if self.exclude.contains(child.url.as_str()) {
                    continue;
                }

                if let Some(filter) = &self.filter {
                    if !filter.matches(child.url.as_str()) {
                        continue;
                    }
                }

                match fetch_document(&self.client, &child.url).await {
                    Ok(body) => {
                        for entry in parse_sitemap(&body) {
                            if let SitemapEntry::Url(dated) = entry {
                                urls.push(dated);
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(url = %child.url, error = %err, "failed to fetch child sitemap");
                    }
                }
            }

            for dated in urls {
                let Some(lastmod) = dated.last_modified else {
                    continue;
                };

                if lastmod <= last_run {
                    continue;
                }

                admit(dated.url.as_str(), sink, store).await;
            }
        }

        *self.last_run.lock().unwrap() = Some(Utc::now());
    }
}

/// Pulls configured rss/atom feeds on a periodic tick and schedules
/// entries the store has not seen.
pub struct FeedSource {
    client: reqwest::Client,
    feeds: Vec<Url>,
    interval: Duration,
    quit: Mutex<Option<mpsc::Sender<oneshot::Sender<()>>>>,
}

impl FeedSource {
    pub fn from_config(data: &RssSourceData, config: &FeedConfig) -> Result<Self> {
        let feeds = data
            .feeds
            .iter()
            .map(|raw| Url::parse(raw).map_err(|_| Error::MalformedUrl(raw.clone())))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .danger_accept_invalid_certs(data.allow_insecure)
                .build()?,
            feeds,
            interval: Duration::from_secs(config.interval_secs),
            quit: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>, sink: Arc<dyn ScheduleSink>, store: Arc<dyn Store>) {
        let (quit_tx, quit_rx) = mpsc::channel(1);
        *self.quit.lock().unwrap() = Some(quit_tx);

        let source = Arc::clone(self);
        tokio::spawn(async move {
            source.run(sink, store, quit_rx).await;
        });
    }

    pub async fn stop(&self) -> Result<(), Error> {
        stop_through(&self.quit).await
    }

    async fn run(
        &self,
        sink: Arc<dyn ScheduleSink>,
        store: Arc<dyn Store>,
        mut quit: mpsc::Receiver<oneshot::Sender<()>>,
    ) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                ack = quit.recv() => {
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                    return;
                }
                _ = interval.tick() => {
                    self.run_once(&*sink, &*store).await;
                }
            }
        }
    }

    async fn run_once(&self, sink: &dyn ScheduleSink, store: &dyn Store) {
        for feed_url in &self.feeds {
            let body = match fetch_document(&self.client, feed_url).await {
                Ok(body) => body,
                Err(err) => {
                    tracing::warn!(url = %feed_url, error = %err, "failed to fetch feed");
                    continue;
                }
            };

            for entry in parser::parse(&body) {
                let Some(url) = entry.url() else {
                    continue;
                };

                admit(url.as_str(), sink, store).await;
            }
        }
    }
}

async fn stop_through(
    quit: &Mutex<Option<mpsc::Sender<oneshot::Sender<()>>>>,
) -> Result<(), Error> {
    let quit = quit.lock().unwrap().take();

    let Some(quit) = quit else { return Ok(()) };

    let (ack_tx, ack_rx) = oneshot::channel();
    if quit.send(ack_tx).await.is_err() {
        return Ok(());
    }

    match tokio::time::timeout(Duration::from_secs(10), ack_rx).await {
        Ok(Ok(())) => Ok(()),
        _ => Err(Error::ShutdownTimeout),
    }
}

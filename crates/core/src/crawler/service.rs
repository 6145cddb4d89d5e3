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

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::dispatcher::Dispatcher;
use super::worker::Worker;
use super::{CrawlJob, CrawlRecord, Publisher};
use crate::config::CrawlerConfig;
use crate::extractor::ExtractorRegistry;
use crate::metrics::Instrument;
use crate::{Error, Result};

/// The seam between the scheduler (or any other caller) and a crawl
/// service. Remote transports implement this on top of their bus; the
/// in-process implementation is [`CrawlService`] itself.
#[async_trait::async_trait]
pub trait Client: Send + Sync {
    async fn crawl(&self, url: &str) -> Result<CrawlRecord, Error>;
}

#[derive(Debug, Clone)]
struct LiveCrawl {
    #[allow(dead_code)]
    url: String,
    #[allow(dead_code)]
    loaded_time: DateTime<Utc>,
}

/// Accepts crawl requests, assigns ids, and runs them through the
/// dispatcher's bounded worker pool.
pub struct CrawlService {
    submit: mpsc::Sender<CrawlJob>,
    live: Arc<DashMap<Uuid, LiveCrawl>>,
    timeout: Duration,
    dispatcher: Dispatcher,
}

impl CrawlService {
    pub fn new(
        config: &CrawlerConfig,
        extractors: Arc<ExtractorRegistry>,
        publisher: Arc<dyn Publisher>,
        instrument: Arc<dyn Instrument>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .user_agent(&config.user_agent)
            .build()?;

        let worker = Arc::new(Worker::new(
            client,
            extractors,
            publisher,
            instrument,
            config.max_body_bytes,
        ));

        let (submit_tx, submit_rx) = mpsc::channel(config.queue_depth);
        let dispatcher = Dispatcher::start(config.worker_count, submit_rx, worker);

        Ok(Self {
            submit: submit_tx,
            live: Arc::new(DashMap::new()),
            timeout: Duration::from_secs(config.service_timeout_secs),
            dispatcher,
        })
    }

    async fn submit_job(&self, url: &str) -> Result<(Uuid, oneshot::Receiver<CrawlRecord>), Error> {
        let record = CrawlRecord::new(url);
        let id = record.id;

        self.live.insert(
            id,
            LiveCrawl {
                url: record.url.clone(),
                loaded_time: record.loaded_time,
            },
        );

        let (done_tx, done_rx) = oneshot::channel();

        // backpressure: blocks while the submission queue is full
        if self
            .submit
            .send(CrawlJob {
                record,
                done: done_tx,
            })
            .await
            .is_err()
        {
            self.live.remove(&id);
            return Err(Error::ShutdownTimeout);
        }

        Ok((id, done_rx))
    }

    /// Crawl a url and block until the crawl finishes. If the service
    /// deadline elapses first this fails with `Timeout`, but the
    /// in-flight work continues and its result is still published.
    pub async fn crawl(&self, url: &str) -> Result<CrawlRecord, Error> {
        let (id, done) = self.submit_job(url).await?;

        let res = tokio::time::timeout(self.timeout, done).await;
        self.live.remove(&id);

        match res {
            Ok(Ok(record)) => Ok(record),
            Ok(Err(_)) | Err(_) => Err(Error::Timeout),
        }
    }

    /// Crawl a url asynchronously. Returns the server-assigned id
    /// immediately; the callback is invoked exactly once when the crawl
    /// finishes.
    pub async fn crawl_async<F>(&self, url: &str, callback: F) -> Result<Uuid, Error>
    where
        F: FnOnce(CrawlRecord) + Send + 'static,
    {
        let (id, done) = self.submit_job(url).await?;

        let live = Arc::clone(&self.live);
        tokio::spawn(async move {
            let res = done.await;
            live.remove(&id);

            if let Ok(record) = res {
                callback(record);
            }
        });

        Ok(id)
    }

    /// State of an in-flight crawl.
    pub fn crawl_progress(&self, _id: Uuid) -> Result<CrawlRecord, Error> {
        Err(Error::Unimplemented)
    }

    /// Number of crawls currently accepted but not yet completed.
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Stop the worker pool. In-flight jobs are drained first; queued
    /// jobs that were never handed to a worker are abandoned and their
    /// callers observe `Timeout`.
    pub async fn stop(&self, deadline: Duration) -> Result<(), Error> {
        self.dispatcher.stop(deadline).await
    }
}

#[async_trait::async_trait]
impl Client for CrawlService {
    async fn crawl(&self, url: &str) -> Result<CrawlRecord, Error> {
        CrawlService::crawl(self, url).await
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::crawler::ChannelPublisher;
    use crate::metrics::MemInstrument;

    const ARTICLE: &str = r#"
        <html>
            <head>
                <title>A story</title>
                <meta name="description" content="Something happened">
                <meta property="article:tag" content="news">
                <script type="application/ld+json">{"@type": "NewsArticle"}</script>
            </head>
            <body>
                <div itemscope itemtype="https://schema.org/NewsArticle">
                    <span itemprop="headline">A story</span>
                </div>
                <a href="/other">next</a>
                <a href="javascript:void(0)">ignore</a>
            </body>
        </html>
    "#;

    fn test_config(worker_count: usize) -> CrawlerConfig {
        CrawlerConfig {
            worker_count,
            fetch_timeout_secs: 5,
            service_timeout_secs: 10,
            max_body_bytes: 10 * 1024 * 1024,
            user_agent: "trawl-test".to_string(),
            queue_depth: 64,
        }
    }

    fn build_service(
        config: &CrawlerConfig,
        instrument: Arc<MemInstrument>,
    ) -> (CrawlService, crate::crawler::Listener) {
        let (publisher, listener) = ChannelPublisher::new();

        let service = CrawlService::new(
            config,
            Arc::new(ExtractorRegistry::default()),
            Arc::new(publisher),
            instrument,
        )
        .unwrap();

        (service, listener)
    }

    #[tokio::test]
    async fn crawl_end_to_end() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/article"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ARTICLE))
            .mount(&server)
            .await;

        let instrument = Arc::new(MemInstrument::default());
        let (service, mut listener) = build_service(&test_config(2), Arc::clone(&instrument));

        let record = service
            .crawl(&format!("{}/article", server.uri()))
            .await
            .unwrap();

        assert!(!record.is_error());
        assert_eq!(record.title, Some("A story".to_string()));
        assert_eq!(record.description, Some("Something happened".to_string()));
        assert_eq!(record.page_hash.len(), 64);
        assert!(record.page_hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(record.json_data.len(), 1);
        assert_eq!(record.harvested_urls.len(), 1);
        assert!(record.harvested_urls[0].ends_with("/other"));
        assert!(record.micro_data.is_array());

        // timing is monotonic within the crawl
        let start = record.start_time.unwrap();
        let fetch = record.fetch_time.unwrap();
        let extract = record.extract_time.unwrap();
        let end = record.end_time.unwrap();
        assert!(record.loaded_time <= start);
        assert!(start <= fetch && fetch <= extract && extract <= end);

        // the same record was published
        let published = listener.recv().await.unwrap();
        assert_eq!(published.id, record.id);

        assert_eq!(service.live_count(), 0);
        assert_eq!(instrument.counter_value("crawl_url"), 1);

        service.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn identical_bodies_hash_identically() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&server)
            .await;

        let instrument = Arc::new(MemInstrument::default());
        let (service, _listener) = build_service(&test_config(1), instrument);

        let a = service.crawl(&format!("{}/a", server.uri())).await.unwrap();
        let b = service.crawl(&format!("{}/b", server.uri())).await.unwrap();

        assert_eq!(a.page_hash, b.page_hash);
        assert_eq!(
            a.page_hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );

        service.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn fetch_status_recorded_and_emitted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let instrument = Arc::new(MemInstrument::default());
        let (service, mut listener) = build_service(&test_config(1), instrument);

        let record = service
            .crawl(&format!("{}/missing", server.uri()))
            .await
            .unwrap();

        assert_eq!(record.error_code.as_deref(), Some("FetchStatus"));
        assert!(record.end_time.is_some());

        // errors are still emitted to the publisher
        let published = listener.recv().await.unwrap();
        assert_eq!(published.id, record.id);

        service.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn malformed_url_recorded() {
        let instrument = Arc::new(MemInstrument::default());
        let (service, _listener) = build_service(&test_config(1), instrument);

        let record = service.crawl("not a url").await.unwrap();

        assert_eq!(record.error_code.as_deref(), Some("MalformedURL"));

        service.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn deadline_elapses_but_work_is_published() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("slow")
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;

        let mut config = test_config(1);
        config.service_timeout_secs = 0;

        let instrument = Arc::new(MemInstrument::default());
        let (service, mut listener) = build_service(&config, instrument);

        let res = service.crawl(&format!("{}/slow", server.uri())).await;
        assert!(matches!(res, Err(Error::Timeout)));

        // the in-flight crawl still completes and publishes
        let published = listener.recv().await.unwrap();
        assert_eq!(published.page_hash.len(), 64);

        service.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn crawl_async_invokes_callback_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let instrument = Arc::new(MemInstrument::default());
        let (service, _listener) = build_service(&test_config(1), instrument);

        let (cb_tx, mut cb_rx) = mpsc::unbounded_channel();
        let id = service
            .crawl_async(&format!("{}/page", server.uri()), move |record| {
                cb_tx.send(record).unwrap();
            })
            .await
            .unwrap();

        let record = cb_rx.recv().await.unwrap();
        assert_eq!(record.id, id);
        assert!(cb_rx.recv().await.is_none());

        service.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn progress_is_unimplemented() {
        let instrument = Arc::new(MemInstrument::default());
        let (service, _listener) = build_service(&test_config(1), instrument);

        assert!(matches!(
            service.crawl_progress(Uuid::new_v4()),
            Err(Error::Unimplemented)
        ));
    }

    #[tokio::test]
    async fn worker_pool_bounds_concurrent_fetches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("ok")
                    .set_delay(Duration::from_millis(50)),
            )
            .mount(&server)
            .await;

        let instrument = Arc::new(MemInstrument::default());
        let (service, _listener) = build_service(&test_config(2), Arc::clone(&instrument));
        let service = Arc::new(service);

        let mut handles = Vec::new();
        for i in 0..6 {
            let service = Arc::clone(&service);
            let url = format!("{}/page-{i}", server.uri());
            handles.push(tokio::spawn(async move { service.crawl(&url).await }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let high_water = instrument.gauge_high_water("workers_active");
        assert!(high_water >= 1 && high_water <= 2, "high water {high_water}");
        assert_eq!(instrument.counter_value("crawl_url"), 6);

        service.stop(Duration::from_secs(5)).await.unwrap();
    }
}

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

use chrono::Utc;
use sha2::{Digest, Sha256};
use url::Url;

use super::dispatcher::JobRunner;
use super::{CrawlJob, CrawlRecord, Publisher};
use crate::extractor::ExtractorRegistry;
use crate::metrics::Instrument;
use crate::webpage::url_ext::UrlExt;
use crate::webpage::Page;
use crate::Error;

/// Executes one crawl: fetch, parse, extract, emit. Errors never abort
/// the pipeline; they are recorded on the outgoing record so downstream
/// consumers can observe them.
pub(crate) struct Worker {
    client: reqwest::Client,
    extractors: Arc<ExtractorRegistry>,
    publisher: Arc<dyn Publisher>,
    instrument: Arc<dyn Instrument>,
    max_body_bytes: usize,
}

#[async_trait::async_trait]
impl JobRunner for Worker {
    async fn run(&self, job: CrawlJob) {
        let CrawlJob { mut record, done } = job;

        self.execute(&mut record).await;

        if let Err(err) = self.publisher.publish(&record) {
            tracing::error!(url = %record.url, error = %err, "failed to publish crawl");
        }

        if done.send(record).is_err() {
            tracing::debug!("crawl completion receiver dropped");
        }
    }
}

impl Worker {
    pub fn new(
        client: reqwest::Client,
        extractors: Arc<ExtractorRegistry>,
        publisher: Arc<dyn Publisher>,
        instrument: Arc<dyn Instrument>,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            client,
            extractors,
            publisher,
            instrument,
            max_body_bytes,
        }
    }

    async fn execute(&self, record: &mut CrawlRecord) {
        self.instrument.gauge("workers_active", 1);
        record.start_time = Some(Utc::now());

        if let Err(err) = self.crawl(record).await {
            tracing::warn!(url = %record.url, error = %err, "crawl failed");
            record.record_failure(&err);
        }

        record.end_time = Some(Utc::now());

        self.instrument.gauge("workers_active", -1);
        self.instrument.count("crawl_url");
    }

    async fn crawl(&self, record: &mut CrawlRecord) -> Result<(), Error> {
        let url = Url::parse_normalized(&record.url)?;
        record.host = url.host_str().unwrap_or_default().to_string();

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|err| Error::FetchTransport(err.to_string()))?;

        let status = response.status().as_u16();
        if status >= 400 {
            return Err(Error::FetchStatus(status));
        }

        let body = self.read_body(response).await?;
        record.fetch_time = Some(Utc::now());

        record.page_hash = hex::encode(Sha256::digest(&body));

        let html = String::from_utf8_lossy(&body);
        let page = Page::parse(&html, &url);

        record.title = page.title();
        record.description = page.description();
        record.meta_data = page.metadata();
        record.json_data = page.json_ld();
        record.micro_data =
            serde_json::to_value(page.schema_org()).unwrap_or(serde_json::Value::Null);
        record.harvested_urls = page
            .anchor_links()
            .into_iter()
            .map(|url| url.to_string())
            .collect();

        let host = url.host_str().unwrap_or_default();
        let mut harvested = Vec::new();

        for extractor in self.extractors.matches(host) {
            match extractor.extract(&page) {
                Ok(Some(value)) => harvested.push(value),
                Ok(None) => {}
                Err(err) => {
                    // other extractors continue
                    tracing::warn!(host, error = %err, "extractor failed");
                }
            }
        }

        record.harvested_data = harvested;
        record.extract_time = Some(Utc::now());

        Ok(())
    }

    async fn read_body(&self, mut response: reqwest::Response) -> Result<Vec<u8>, Error> {
        if let Some(len) = response.content_length() {
            if len as usize > self.max_body_bytes {
                return Err(Error::BodyRead(format!(
                    "content length {len} exceeds cap of {} bytes",
                    self.max_body_bytes
                )));
            }
        }

        let mut body = Vec::new();

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| Error::BodyRead(err.to_string()))?
        {
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(Error::BodyRead(format!(
                    "body exceeds cap of {} bytes",
                    self.max_body_bytes
                )));
            }

            body.extend_from_slice(&chunk);
        }

        Ok(body)
    }
}

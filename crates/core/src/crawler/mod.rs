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

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::webpage::Meta;
use crate::Error;

mod dispatcher;
mod service;
mod worker;

pub use service::{Client, CrawlService};

/// The output of fetching a webpage and extracting its contents: meta
/// data about the page, timing details and the error if one was
/// encountered. This is the unit flowing from worker to publisher,
/// scheduler and aggregator, serialized as a single json document.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrawlRecord {
    #[serde(rename = "ID")]
    pub id: Uuid,
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "Host", default)]
    pub host: String,
    #[serde(rename = "PageHash", default)]
    pub page_hash: String,

    #[serde(rename = "LoadedTime")]
    pub loaded_time: DateTime<Utc>,
    #[serde(rename = "StartTime", default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(rename = "FetchTime", default, skip_serializing_if = "Option::is_none")]
    pub fetch_time: Option<DateTime<Utc>>,
    #[serde(
        rename = "ExtractTime",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub extract_time: Option<DateTime<Utc>>,
    #[serde(rename = "EndTime", default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    #[serde(rename = "Title", default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(
        rename = "Description",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub description: Option<String>,

    #[serde(rename = "HarvestedURLs", default)]
    pub harvested_urls: Vec<String>,
    #[serde(rename = "HarvestedData", default)]
    pub harvested_data: Vec<serde_json::Value>,
    #[serde(rename = "MicroData", default)]
    pub micro_data: serde_json::Value,
    #[serde(rename = "MetaData", default)]
    pub meta_data: Meta,
    #[serde(rename = "JSONData", default)]
    pub json_data: Vec<serde_json::Value>,
    #[serde(rename = "RawData", default, skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<String>,

    #[serde(rename = "Error", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "ErrorCode", default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl CrawlRecord {
    pub(crate) fn new(url: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            url: url.to_string(),
            host: String::new(),
            page_hash: String::new(),
            loaded_time: Utc::now(),
            start_time: None,
            fetch_time: None,
            extract_time: None,
            end_time: None,
            title: None,
            description: None,
            harvested_urls: Vec::new(),
            harvested_data: Vec::new(),
            micro_data: serde_json::Value::Null,
            meta_data: Meta::new(),
            json_data: Vec::new(),
            raw_data: None,
            error: None,
            error_code: None,
        }
    }

    /// True when the worker recorded a fatal error for this crawl.
    pub fn is_error(&self) -> bool {
        self.error_code.is_some()
    }

    pub(crate) fn record_failure(&mut self, err: &Error) {
        self.error = Some(err.to_string());
        self.error_code = Some(err.code().to_string());
    }
}

/// Request shape used by bus transports to ask the service for a
/// crawl. `reply` names the topic for the completion message of an
/// asynchronous request and stays empty for synchronous ones.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrawlRequest {
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "Reply", default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ProgressRequest {
    #[serde(rename = "GUID")]
    pub id: Uuid,
}

/// Every request is answered with a crawl and an optional error.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrawlReply {
    #[serde(rename = "Crawl")]
    pub crawl: Option<CrawlRecord>,
    #[serde(rename = "Error", default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A crawl record travelling through the dispatcher, together with the
/// one-shot completion signal the worker fires after publishing. The
/// signal never crosses a serialization boundary.
pub(crate) struct CrawlJob {
    pub record: CrawlRecord,
    pub done: oneshot::Sender<CrawlRecord>,
}

/// Emits completed crawls at a boundary. Bus transports implement this
/// outside the core; the in-process [`ChannelPublisher`] covers tests
/// and single-process deployments.
pub trait Publisher: Send + Sync {
    fn publish(&self, crawl: &CrawlRecord) -> Result<(), Error>;
}

/// In-process publisher half of a publisher/listener pair.
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<CrawlRecord>,
}

/// Consumes completed crawls, the other half of [`ChannelPublisher`].
pub struct Listener {
    rx: mpsc::UnboundedReceiver<CrawlRecord>,
}

impl ChannelPublisher {
    pub fn new() -> (Self, Listener) {
        let (tx, rx) = mpsc::unbounded_channel();

        (Self { tx }, Listener { rx })
    }
}

impl Publisher for ChannelPublisher {
    fn publish(&self, crawl: &CrawlRecord) -> Result<(), Error> {
        self.tx
            .send(crawl.clone())
            .map_err(|_| Error::FetchTransport("crawl listener closed".to_string()))
    }
}

impl Listener {
    pub async fn recv(&mut self) -> Option<CrawlRecord> {
        self.rx.recv().await
    }
}

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

pub mod defaults;

use std::collections::HashMap;
use std::path::Path;

use crate::Result;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrawlerConfig {
    #[serde(default = "defaults::Crawler::worker_count")]
    pub worker_count: usize,

    #[serde(default = "defaults::Crawler::fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// How long `crawl` waits for completion before failing with
    /// `Timeout`. The crawl itself is not cancelled.
    #[serde(default = "defaults::Crawler::service_timeout_secs")]
    pub service_timeout_secs: u64,

    #[serde(default = "defaults::Crawler::max_body_bytes")]
    pub max_body_bytes: usize,

    #[serde(default = "defaults::Crawler::user_agent")]
    pub user_agent: String,

    /// Submission queue depth. A full queue blocks schedulers, which is
    /// the backpressure path.
    #[serde(default = "defaults::Crawler::queue_depth")]
    pub queue_depth: usize,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            worker_count: defaults::Crawler::worker_count(),
            fetch_timeout_secs: defaults::Crawler::fetch_timeout_secs(),
            service_timeout_secs: defaults::Crawler::service_timeout_secs(),
            max_body_bytes: defaults::Crawler::max_body_bytes(),
            user_agent: defaults::Crawler::user_agent(),
            queue_depth: defaults::Crawler::queue_depth(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    /// Minimum wall-clock spacing between two crawl starts for the same
    /// host.
    #[serde(default = "defaults::Scheduler::crawl_delay_ms")]
    pub crawl_delay_ms: u64,

    #[serde(default)]
    pub allowed_hosts: Vec<String>,

    #[serde(default = "defaults::Scheduler::shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            crawl_delay_ms: defaults::Scheduler::crawl_delay_ms(),
            allowed_hosts: Vec::new(),
            shutdown_timeout_secs: defaults::Scheduler::shutdown_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FeedConfig {
    #[serde(default = "defaults::Feeds::interval_secs")]
    pub interval_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            interval_secs: defaults::Feeds::interval_secs(),
        }
    }
}

/// Per-host configuration document, one json file per host.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct HostConfig {
    pub host: String,

    #[serde(default)]
    pub alias: Vec<String>,

    #[serde(default, rename = "schedular")]
    pub sources: Vec<SourceConfig>,

    #[serde(default, rename = "extraction")]
    pub extraction: Vec<ExtractionRule>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
pub enum SourceKind {
    #[serde(rename = "RSS")]
    Rss,
    Sitemap,
}

/// One feed-source spec. The shape of `data` depends on the kind, so it
/// stays opaque here and is given a type by the feed source consuming it.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SourceConfig {
    #[serde(rename = "type")]
    pub kind: SourceKind,

    #[serde(default)]
    pub frequency: Option<String>,

    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct RssSourceData {
    pub feeds: Vec<String>,

    #[serde(default)]
    pub allow_insecure: bool,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SitemapSourceData {
    pub sitemaps: Vec<String>,

    #[serde(default)]
    pub exclude: Vec<String>,

    #[serde(default)]
    pub filter: Vec<SitemapFilterData>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SitemapFilterData {
    #[serde(default)]
    pub contains: Vec<String>,
}

/// Rule-driven extraction config: a schema type label, the page-level
/// selectors that activate the rule, and per-field extraction rules.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ExtractionRule {
    #[serde(rename = "@type")]
    pub schema_type: String,

    #[serde(rename = "@pageMatcher")]
    pub page_matcher: Vec<String>,

    #[serde(default)]
    pub fields: HashMap<String, FieldRule>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct FieldRule {
    #[serde(rename = "type")]
    pub kind: String,

    pub matcher: String,

    /// `"innerHTML"` for text content, anything else names an attribute.
    pub content: String,

    #[serde(default, rename = "excludeMatch")]
    pub exclude_match: Vec<String>,
}

/// Load every host configuration document in a directory. Unreadable or
/// invalid documents are logged and skipped so a single bad file does
/// not take the whole host set down.
pub fn load_hosts_from_dir<P: AsRef<Path>>(dir: P) -> Result<Vec<HostConfig>> {
    let mut hosts = Vec::new();

    for entry in std::fs::read_dir(dir.as_ref())? {
        let entry = entry?;

        if !entry.file_type()?.is_file() {
            continue;
        }

        let path = entry.path();
        let host = std::fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|raw| serde_json::from_str::<HostConfig>(&raw).map_err(anyhow::Error::from));

        match host {
            Ok(host) => hosts.push(host),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "skipping invalid host config");
            }
        }
    }

    Ok(hosts)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ABC_HOST: &str = r#"
    {
        "host": "www.abc.net.au",
        "alias": ["abc.net.au"],
        "schedular": [
            {
                "type": "Sitemap",
                "frequency": "15m",
                "data": {
                    "sitemaps": ["https://www.abc.net.au/news/sitemap.xml"],
                    "filter": [{ "contains": ["/news/"] }]
                }
            },
            {
                "type": "RSS",
                "frequency": "15m",
                "data": {
                    "feeds": ["https://www.abc.net.au/news/feed/51120/rss.xml"],
                    "allow_insecure": true
                }
            }
        ],
        "extraction": [
            {
                "@type": "NewsArticle",
                "@pageMatcher": [".news.story_page"],
                "fields": {
                    "title": {
                        "type": "String",
                        "matcher": "h1",
                        "content": "innerHTML"
                    },
                    "published": {
                        "type": "Time",
                        "matcher": "time",
                        "content": "datetime",
                        "excludeMatch": []
                    }
                }
            }
        ]
    }
    "#;

    #[test]
    fn parse_host_document() {
        let host: HostConfig = serde_json::from_str(ABC_HOST).unwrap();

        assert_eq!(host.host, "www.abc.net.au");
        assert_eq!(host.alias, vec!["abc.net.au".to_string()]);
        assert_eq!(host.sources.len(), 2);
        assert_eq!(host.sources[0].kind, SourceKind::Sitemap);
        assert_eq!(host.sources[1].kind, SourceKind::Rss);

        let sitemap: SitemapSourceData =
            serde_json::from_value(host.sources[0].data.clone()).unwrap();
        assert_eq!(sitemap.sitemaps.len(), 1);
        assert_eq!(sitemap.filter[0].contains, vec!["/news/".to_string()]);

        let rss: RssSourceData = serde_json::from_value(host.sources[1].data.clone()).unwrap();
        assert_eq!(rss.feeds.len(), 1);
        assert!(rss.allow_insecure);

        assert_eq!(host.extraction.len(), 1);
        assert_eq!(host.extraction[0].schema_type, "NewsArticle");
        assert_eq!(host.extraction[0].fields["title"].kind, "String");
        assert_eq!(host.extraction[0].fields["title"].content, "innerHTML");
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let config: CrawlerConfig = serde_json::from_str("{}").unwrap();

        assert_eq!(config.worker_count, 40);
        assert_eq!(config.fetch_timeout_secs, 10);
        assert_eq!(config.max_body_bytes, 10 * 1024 * 1024);

        let config: SchedulerConfig = serde_json::from_str(r#"{"crawl_delay_ms": 250}"#).unwrap();
        assert_eq!(config.crawl_delay_ms, 250);
        assert!(config.allowed_hosts.is_empty());
    }

    #[test]
    fn load_hosts_skips_invalid_documents() {
        let dir = crate::gen_temp_path();
        std::fs::create_dir_all(&dir).unwrap();

        std::fs::write(dir.join("abc.json"), ABC_HOST).unwrap();
        std::fs::write(dir.join("broken.json"), "{ not json").unwrap();

        let hosts = load_hosts_from_dir(&dir).unwrap();

        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].host, "www.abc.net.au");

        std::fs::remove_dir_all(&dir).unwrap();
    }
}

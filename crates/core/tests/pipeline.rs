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

use std::sync::{Arc, Mutex};
use std::time::Duration;

use trawl::config::{CrawlerConfig, SchedulerConfig};
use trawl::crawler::{ChannelPublisher, Client, CrawlService};
use trawl::extractor::ExtractorRegistry;
use trawl::metrics::{Instrument, MemInstrument};
use trawl::scheduler::{Harvest, Scheduler};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_page(server: &MockServer, route: &str, body: String) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

/// Seed one url, let the scheduler drain the discovered graph through
/// the real service and worker pool, and check politeness plus
/// exactly-once crawling of every page.
#[tokio::test]
async fn scheduler_drains_discovered_graph() {
    let server = MockServer::start().await;

    mount_page(
        &server,
        "/index",
        format!(
            r#"<html><head><title>Index</title></head>
               <body><a href="{0}/a">a</a><a href="{0}/b">b</a></body></html>"#,
            server.uri()
        ),
    )
    .await;
    mount_page(
        &server,
        "/a",
        format!(
            // links back to the index, which must not be crawled again
            r#"<html><head><title>A</title></head>
               <body><a href="{0}/index">back</a></body></html>"#,
            server.uri()
        ),
    )
    .await;
    mount_page(
        &server,
        "/b",
        "<html><head><title>B</title></head><body></body></html>".to_string(),
    )
    .await;

    let instrument = Arc::new(MemInstrument::default());
    let (publisher, _listener) = ChannelPublisher::new();

    let crawler_config = CrawlerConfig {
        worker_count: 2,
        fetch_timeout_secs: 5,
        service_timeout_secs: 10,
        user_agent: "trawl-test".to_string(),
        ..CrawlerConfig::default()
    };

    let service = Arc::new(
        CrawlService::new(
            &crawler_config,
            Arc::new(ExtractorRegistry::default()),
            Arc::new(publisher),
            Arc::clone(&instrument) as Arc<dyn Instrument>,
        )
        .unwrap(),
    );

    let scheduler_config = SchedulerConfig {
        crawl_delay_ms: 50,
        allowed_hosts: vec!["127.0.0.1".to_string()],
        shutdown_timeout_secs: 5,
    };

    let scheduler = Arc::new(Scheduler::new(
        &scheduler_config,
        Arc::clone(&service) as Arc<dyn Client>,
        Arc::clone(&instrument) as Arc<dyn Instrument>,
    ));

    let harvested = Arc::new(Mutex::new(Vec::new()));
    let harvested_cb = Arc::clone(&harvested);
    scheduler.on_harvest(move |record| {
        harvested_cb.lock().unwrap().push(record.url.clone());
        Harvest::Continue
    });

    scheduler.schedule(&format!("{}/index", server.uri())).unwrap();
    scheduler.start();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if harvested.lock().unwrap().len() >= 3 {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("pipeline did not drain in time");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // give the cycle a chance to re-crawl if deduplication were broken
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut seen = harvested.lock().unwrap().clone();
    seen.sort();

    let mut expected = vec![
        format!("{}/index", server.uri()),
        format!("{}/a", server.uri()),
        format!("{}/b", server.uri()),
    ];
    expected.sort();

    // every page exactly once, the index link cycle included
    assert_eq!(seen, expected);
    assert_eq!(instrument.counter_value("crawl_url"), 3);
    assert_eq!(instrument.counter_value("scheduler_url_scheduled"), 3);

    scheduler.stop().await.unwrap();
    service.stop(Duration::from_secs(5)).await.unwrap();
}

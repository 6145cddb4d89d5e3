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

use quick_xml::events::Event;
use url::Url;

use crate::dated_url::{parse_datetime, DatedUrl};

/// An entry of a site-index document: either a page url or a child
/// sitemap, both optionally dated so callers can skip stale subtrees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SitemapEntry {
    Url(DatedUrl),
    Sitemap(DatedUrl),
}

pub fn parse_sitemap(s: &str) -> Vec<SitemapEntry> {
    let mut reader = quick_xml::Reader::from_str(s);

    let mut res = vec![];

    let mut in_sitemap = false;
    let mut in_url = false;
    let mut in_loc = false;
    let mut in_lastmod = false;

    let mut current_url: Option<Url> = None;
    let mut current_lastmod = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                if e.name().as_ref() == b"sitemap" {
                    in_sitemap = true;
                } else if e.name().as_ref() == b"url" {
                    in_url = true;
                } else if e.name().as_ref() == b"loc" {
                    in_loc = true;
                } else if e.name().as_ref() == b"lastmod" {
                    in_lastmod = true;
                }
            }
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"sitemap" {
                    in_sitemap = false;
                    let last_modified = current_lastmod.take();
                    if let Some(url) = current_url.take() {
                        res.push(SitemapEntry::Sitemap(DatedUrl { url, last_modified }));
                    }
                } else if e.name().as_ref() == b"url" {
                    in_url = false;
                    let last_modified = current_lastmod.take();
                    if let Some(url) = current_url.take() {
                        res.push(SitemapEntry::Url(DatedUrl { url, last_modified }));
                    }
                } else if e.name().as_ref() == b"loc" {
                    in_loc = false;
                } else if e.name().as_ref() == b"lastmod" {
                    in_lastmod = false;
                }
            }
            Ok(Event::Text(e)) => {
                if let Ok(text) = e.unescape() {
                    if (in_sitemap || in_url) && in_loc {
                        if let Ok(url) = Url::parse(text.trim()) {
                            current_url = Some(url);
                        }
                    } else if (in_sitemap || in_url) && in_lastmod {
                        current_lastmod = parse_datetime(&text);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                tracing::debug!("failed to parse sitemap: {}", e);
                break;
            }
            _ => (),
        }
    }

    res
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::*;

    #[test]
    fn parse_index() {
        let index = r#"<sitemapindex>
        <sitemap>
        <loc>https://www.dr.dk/drtv/sitemap.xml</loc>
        <lastmod>2023-10-18T05:40:04+00:00</lastmod>
        </sitemap>
        <sitemap>
        <loc>https://www.dr.dk/sitemap.tvguide.xml</loc>
        </sitemap>
        <sitemap>
        <loc>
        https://www.dr.dk/sitemap.kommunalvalg.resultater.xml
        </loc>
        </sitemap>
        </sitemapindex>"#;

        let entries = parse_sitemap(index);

        assert_eq!(
            entries,
            vec![
                SitemapEntry::Sitemap(DatedUrl {
                    url: "https://www.dr.dk/drtv/sitemap.xml".parse().unwrap(),
                    last_modified: Some(
                        "2023-10-18T05:40:04+00:00".parse::<DateTime<Utc>>().unwrap()
                    ),
                }),
                SitemapEntry::Sitemap(DatedUrl {
                    url: "https://www.dr.dk/sitemap.tvguide.xml".parse().unwrap(),
                    last_modified: None,
                }),
                SitemapEntry::Sitemap(DatedUrl {
                    url: "https://www.dr.dk/sitemap.kommunalvalg.resultater.xml"
                        .parse()
                        .unwrap(),
                    last_modified: None,
                }),
            ]
        );
    }

    #[test]
    fn parse_urlset() {
        let urlset = r#"<urlset>
        <url>
        <lastmod>2023-10-18T05:40:04.7435930+00:00</lastmod>
        <loc>https://www.dr.dk/drtv/serie/sleepover_6382</loc>
        </url>
        <url>
        <loc>
        https://www.dr.dk/drtv/saeson/sleepover_9673
        </loc>
        </url>
        </urlset>"#;

        let entries = parse_sitemap(urlset);

        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0],
            SitemapEntry::Url(DatedUrl {
                url: "https://www.dr.dk/drtv/serie/sleepover_6382"
                    .parse()
                    .unwrap(),
                last_modified: Some(
                    "2023-10-18T05:40:04.7435930+00:00"
                        .parse::<DateTime<Utc>>()
                        .unwrap()
                ),
            })
        );
        assert_eq!(
            entries[1],
            SitemapEntry::Url(DatedUrl {
                url: "https://www.dr.dk/drtv/saeson/sleepover_9673"
                    .parse()
                    .unwrap(),
                last_modified: None,
            })
        );
    }

    #[test]
    fn date_only_lastmod() {
        let urlset = r#"<urlset>
        <url>
        <loc>https://example.com/page</loc>
        <lastmod>2018-02-23</lastmod>
        </url>
        </urlset>"#;

        let entries = parse_sitemap(urlset);

        assert_eq!(entries.len(), 1);
        match &entries[0] {
            SitemapEntry::Url(dated) => {
                assert!(dated.last_modified.is_some());
            }
            entry => panic!("unexpected entry {entry:?}"),
        }
    }

    #[test]
    fn garbage_input() {
        assert!(parse_sitemap("this is not xml at all").is_empty());
        assert!(parse_sitemap("").is_empty());
    }
}

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

/// One feed item. `orig_link` carries the feedburner `origLink`
/// extension, which points at the canonical article when the main link
/// goes through a redirector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedEntry {
    pub link: Option<Url>,
    pub orig_link: Option<Url>,
}

impl FeedEntry {
    /// The url to crawl for this entry: the original link when present,
    /// the item link otherwise.
    pub fn url(&self) -> Option<&Url> {
        self.orig_link.as_ref().or(self.link.as_ref())
    }
}

/// Parse an rss or atom document into its entry links. The document
/// kind is detected from the root element.
pub fn parse(feed: &str) -> Vec<FeedEntry> {
    match detect_kind(feed) {
        Some(FeedKind::Atom) => parse_atom(feed),
        Some(FeedKind::Rss) => parse_rss(feed),
        None => Vec::new(),
    }
}

enum FeedKind {
    Rss,
    Atom,
}

fn detect_kind(feed: &str) -> Option<FeedKind> {
    let mut reader = quick_xml::Reader::from_str(feed);

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                return match e.name().as_ref() {
                    b"feed" => Some(FeedKind::Atom),
                    b"rss" | b"rdf:RDF" | b"channel" => Some(FeedKind::Rss),
                    _ => None,
                };
            }
            Ok(Event::Eof) => return None,
            Err(_) => return None,
            _ => {}
        }
    }
}

fn parse_rss(feed: &str) -> Vec<FeedEntry> {
    let mut reader = quick_xml::Reader::from_str(feed);

    let mut entries = Vec::new();
    let mut current: Option<FeedEntry> = None;

    let mut in_link = false;
    let mut in_orig_link = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"item" => current = Some(FeedEntry::default()),
                b"link" => in_link = true,
                b"feedburner:origLink" => in_orig_link = true,
                _ => {}
            },
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"item" => {
                    if let Some(entry) = current.take() {
                        entries.push(entry);
                    }
                }
                b"link" => in_link = false,
                b"feedburner:origLink" => in_orig_link = false,
                _ => {}
            },
            Ok(Event::Text(e)) => {
                let Some(entry) = current.as_mut() else {
                    continue;
                };

                if let Ok(text) = e.unescape() {
                    if in_link && entry.link.is_none() {
                        entry.link = Url::parse(text.trim()).ok();
                    } else if in_orig_link && entry.orig_link.is_none() {
                        entry.orig_link = Url::parse(text.trim()).ok();
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                tracing::warn!("error parsing feed: {}", e);
                break;
            }
            _ => {}
        }
    }

    entries
}

fn parse_atom(feed: &str) -> Vec<FeedEntry> {
    let mut reader = quick_xml::Reader::from_str(feed);

    let mut entries = Vec::new();
    let mut current: Option<FeedEntry> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => {
                if e.name().as_ref() == b"entry" {
                    current = Some(FeedEntry::default());
                } else if e.name().as_ref() == b"link" {
                    let Some(entry) = current.as_mut() else {
                        continue;
                    };

                    let href = e
                        .attributes()
                        .filter_map(|attr| attr.ok())
                        .find(|attr| attr.key.as_ref() == b"href")
                        .and_then(|attr| attr.unescape_value().ok())
                        .and_then(|href| Url::parse(href.trim()).ok());

                    if let Some(href) = href {
                        entry.link.get_or_insert(href);
                    }
                }
            }
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"entry" {
                    if let Some(entry) = current.take() {
                        entries.push(entry);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                tracing::warn!("error parsing feed: {}", e);
                break;
            }
            _ => {}
        }
    }

    entries
}

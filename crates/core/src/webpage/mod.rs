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

use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use url::Url;

pub mod schema_org;
pub mod url_ext;

use self::url_ext::UrlExt;

static TITLE_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("title").expect("selector is valid"));
static META_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("meta").expect("selector is valid"));
static ANCHOR_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[href], area[href]").expect("selector is valid"));
static JSON_LD_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"script[type="application/ld+json"]"#).expect("selector is valid")
});

pub type Meta = HashMap<String, MetaValue>;

/// Most meta tags carry a single value. `article:tag` accumulates into a
/// list instead of overwriting.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    One(String),
    Many(Vec<String>),
}

/// A fetched webpage parsed into a dom, with the request url attached.
/// All outgoing urls are resolved against that url.
pub struct Page {
    url: Url,
    doc: Html,
}

impl Page {
    pub fn parse(html: &str, url: &Url) -> Self {
        let mut url = url.clone();
        url.normalize();

        Self {
            url,
            doc: Html::parse_document(html),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub(crate) fn doc(&self) -> &Html {
        &self.doc
    }

    pub fn title(&self) -> Option<String> {
        let title = self.doc.select(&TITLE_SELECTOR).next()?;
        let title = title.text().collect::<String>().trim().to_string();

        if title.is_empty() {
            None
        } else {
            Some(title)
        }
    }

    pub fn description(&self) -> Option<String> {
        for node in self.doc.select(&META_SELECTOR) {
            let element = node.value();

            if let Some(name) = element.attr("name") {
                if name == "description" || name == "Description" {
                    if let Some(content) = element.attr("content") {
                        return Some(content.to_string());
                    }
                }
            }
        }

        None
    }

    pub fn metadata(&self) -> Meta {
        let mut metadata = Meta::new();

        for node in self.doc.select(&META_SELECTOR) {
            let element = node.value();

            let name = element.attr("name").or_else(|| element.attr("property"));

            let (name, content) = match (name, element.attr("content")) {
                (Some(name), Some(content)) if !name.is_empty() && !content.is_empty() => {
                    (name, content)
                }
                _ => continue,
            };

            if name == "article:tag" {
                let tags = metadata
                    .entry(name.to_string())
                    .or_insert_with(|| MetaValue::Many(Vec::new()));

                if let MetaValue::Many(tags) = tags {
                    tags.push(content.trim().to_string());
                }
            } else {
                metadata.insert(name.to_string(), MetaValue::One(content.to_string()));
            }
        }

        metadata
    }

    /// Urls discovered on the page: every `a[href]` and `area[href]`
    /// resolved against the page url, normalized, deduplicated by
    /// normalized form and with `javascript:` links dropped.
    pub fn anchor_links(&self) -> Vec<Url> {
        let mut seen = HashSet::new();
        let mut links = Vec::new();

        for node in self.doc.select(&ANCHOR_SELECTOR) {
            let href = match node.value().attr("href") {
                Some(href) => href,
                None => continue,
            };

            let url = match Url::parse_with_base_url(&self.url, href) {
                Ok(url) => url,
                Err(_) => continue,
            };

            if url.scheme() == "javascript" {
                continue;
            }

            if seen.insert(url.as_str().to_string()) {
                links.push(url);
            }
        }

        links
    }

    /// Every `<script type="application/ld+json">` block parsed as json.
    /// Blocks that fail to parse are skipped silently.
    pub fn json_ld(&self) -> Vec<serde_json::Value> {
        self.doc
            .select(&JSON_LD_SELECTOR)
            .filter_map(|node| {
                let content: String = node.text().collect();
                serde_json::from_str(&content).ok()
            })
            .collect()
    }

    pub fn schema_org(&self) -> Vec<schema_org::Item> {
        schema_org::parse(&self.doc, &self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple() {
        let raw = r#"
            <html>
                <head>
                    <title>Best website</title>
                    <meta name="meta1" content="value">
                    <meta name="description" content="A test page">
                </head>
                <body>
                    <a href="https://example.com">Link to example</a>
                    <a href="mailto:hello@example.com">Email me</a>
                </body>
            </html>
        "#;

        let page = Page::parse(raw, &Url::parse("https://www.example.com/whatever").unwrap());

        assert_eq!(page.title(), Some("Best website".to_string()));
        assert_eq!(page.description(), Some("A test page".to_string()));
        assert_eq!(
            page.metadata().get("meta1"),
            Some(&MetaValue::One("value".to_string()))
        );
        assert_eq!(
            page.url().as_str(),
            "https://www.example.com/whatever"
        );
    }

    #[test]
    fn empty_title() {
        let raw = r#"<html><head><title></title></head><body></body></html>"#;
        let page = Page::parse(raw, &Url::parse("https://example.com").unwrap());

        assert_eq!(page.title(), None);
    }

    #[test]
    fn meta_property_tags() {
        let raw = r#"
            <html>
                <head>
                    <meta property="og:title" content="Og title">
                    <meta name="author" content="Someone">
                </head>
            </html>
        "#;

        let page = Page::parse(raw, &Url::parse("https://example.com").unwrap());
        let metadata = page.metadata();

        assert_eq!(
            metadata.get("og:title"),
            Some(&MetaValue::One("Og title".to_string()))
        );
        assert_eq!(
            metadata.get("author"),
            Some(&MetaValue::One("Someone".to_string()))
        );
    }

    #[test]
    fn article_tags_accumulate() {
        let raw = r#"
            <html>
                <head>
                    <meta property="article:tag" content=" politics ">
                    <meta property="article:tag" content="economy">
                </head>
            </html>
        "#;

        let page = Page::parse(raw, &Url::parse("https://example.com").unwrap());

        assert_eq!(
            page.metadata().get("article:tag"),
            Some(&MetaValue::Many(vec![
                "politics".to_string(),
                "economy".to_string()
            ]))
        );
    }

    #[test]
    fn links_resolved_normalized_deduped() {
        let raw = r#"
            <html>
                <body>
                    <a href="http://H.EX/?a=1#f">one</a>
                    <a href="http://h.ex/?a=1">two</a>
                    <a href="javascript:alert(1)">three</a>
                </body>
            </html>
        "#;

        let page = Page::parse(raw, &Url::parse("http://h.ex/").unwrap());
        let links = page.anchor_links();

        assert_eq!(links.len(), 1);
        assert_eq!(links[0].as_str(), "http://h.ex/?a=1");
    }

    #[test]
    fn area_links_and_relative_resolution() {
        let raw = r#"
            <html>
                <body>
                    <a href="/article/1">a</a>
                    <map><area href="region.html"></map>
                </body>
            </html>
        "#;

        let page = Page::parse(raw, &Url::parse("https://example.com/news/").unwrap());
        let links: Vec<_> = page
            .anchor_links()
            .into_iter()
            .map(|url| url.to_string())
            .collect();

        assert_eq!(
            links,
            vec![
                "https://example.com/article/1".to_string(),
                "https://example.com/news/region.html".to_string(),
            ]
        );
    }

    #[test]
    fn json_ld_blocks() {
        let raw = r#"
            <html>
                <head>
                    <script type="application/ld+json">
                        {"@type": "NewsArticle", "headline": "A story"}
                    </script>
                    <script type="application/ld+json">
                        this is not json
                    </script>
                </head>
            </html>
        "#;

        let page = Page::parse(raw, &Url::parse("https://example.com").unwrap());
        let blocks = page.json_ld();

        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0]["@type"], "NewsArticle");
        assert_eq!(blocks[0]["headline"], "A story");
    }
}

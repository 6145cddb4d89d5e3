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

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::HostConfig;
use crate::webpage::Page;
use crate::{Error, Result};

mod rules;

pub use rules::RuleExtractor;

/// Extractors are polymorphic over `host` + `extract`. The two concrete
/// shapes are hand-written callbacks for sites whose dom requires
/// imperative selection, and configuration-driven rules.
pub enum Extractor {
    Func(FuncExtractor),
    Rule(RuleExtractor),
}

impl Extractor {
    pub fn host(&self) -> &str {
        match self {
            Extractor::Func(extractor) => &extractor.host,
            Extractor::Rule(extractor) => extractor.host(),
        }
    }

    /// Extract structured data from the page. `None` means the extractor
    /// does not apply to this particular page.
    pub fn extract(&self, page: &Page) -> Result<Option<serde_json::Value>, Error> {
        match self {
            Extractor::Func(extractor) => (extractor.func)(page),
            Extractor::Rule(extractor) => extractor.extract(page),
        }
    }
}

type ExtractFn = dyn Fn(&Page) -> Result<Option<serde_json::Value>, Error> + Send + Sync;

pub struct FuncExtractor {
    pub host: String,
    func: Arc<ExtractFn>,
}

impl FuncExtractor {
    pub fn new<F>(host: &str, func: F) -> Self
    where
        F: Fn(&Page) -> Result<Option<serde_json::Value>, Error> + Send + Sync + 'static,
    {
        Self {
            host: host.to_string(),
            func: Arc::new(func),
        }
    }
}

/// Maps a host to the ordered list of extractors that should run against
/// pages from that host. Adding is append-only; lookup is by exact host
/// match. The registry is built at startup and then shared immutably.
#[derive(Default)]
pub struct ExtractorRegistry {
    by_host: HashMap<String, Vec<Extractor>>,
}

impl ExtractorRegistry {
    pub fn add(&mut self, extractor: Extractor) {
        self.by_host
            .entry(extractor.host().to_string())
            .or_default()
            .push(extractor);
    }

    pub fn matches(&self, host: &str) -> &[Extractor] {
        self.by_host
            .get(host)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Build a registry from host configuration documents. A host's rule
    /// extractors are registered under the host itself and every alias.
    pub fn from_hosts(hosts: &[HostConfig]) -> Result<Self> {
        let mut registry = Self::default();

        for host in hosts {
            if host.extraction.is_empty() {
                continue;
            }

            for name in std::iter::once(host.host.as_str())
                .chain(host.alias.iter().map(String::as_str))
            {
                let extractor = RuleExtractor::new(name, &host.extraction)?;
                registry.add(Extractor::Rule(extractor));
            }
        }

        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;

    #[test]
    fn registry_matches_by_exact_host() {
        let mut registry = ExtractorRegistry::default();

        registry.add(Extractor::Func(FuncExtractor::new(
            "www.example.com",
            |_page| Ok(None),
        )));

        assert_eq!(registry.matches("www.example.com").len(), 1);
        assert!(registry.matches("example.com").is_empty());
        assert!(registry.matches("other.org").is_empty());
    }

    #[test]
    fn registry_preserves_order() {
        let mut registry = ExtractorRegistry::default();

        registry.add(Extractor::Func(FuncExtractor::new("h.ex", |_page| {
            Ok(Some(serde_json::json!({"n": 1})))
        })));
        registry.add(Extractor::Func(FuncExtractor::new("h.ex", |_page| {
            Ok(Some(serde_json::json!({"n": 2})))
        })));

        let page = Page::parse("<html></html>", &Url::parse("http://h.ex/").unwrap());

        let harvested: Vec<_> = registry
            .matches("h.ex")
            .iter()
            .filter_map(|e| e.extract(&page).ok().flatten())
            .collect();

        assert_eq!(
            harvested,
            vec![serde_json::json!({"n": 1}), serde_json::json!({"n": 2})]
        );
    }

    #[test]
    fn func_extractor_runs_against_page() {
        let extractor = Extractor::Func(FuncExtractor::new("www.example.com", |page| {
            if page.title().is_none() {
                return Ok(None);
            }

            Ok(Some(serde_json::json!({ "title": page.title() })))
        }));

        let page = Page::parse(
            "<html><head><title>Hello</title></head></html>",
            &Url::parse("https://www.example.com/").unwrap(),
        );

        let res = extractor.extract(&page).unwrap().unwrap();
        assert_eq!(res["title"], "Hello");

        let page = Page::parse(
            "<html></html>",
            &Url::parse("https://www.example.com/").unwrap(),
        );
        assert!(extractor.extract(&page).unwrap().is_none());
    }
}

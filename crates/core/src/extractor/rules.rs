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

use scraper::{ElementRef, Selector};
use serde_json::{Map, Value};

use crate::config::{ExtractionRule, FieldRule};
use crate::dated_url::parse_datetime;
use crate::webpage::Page;
use crate::Error;

/// Configuration-driven extractor. Each rule carries a schema type label,
/// page-level selectors that decide whether the rule applies, and a map
/// of field rules describing how to pull each field out of the dom.
pub struct RuleExtractor {
    host: String,
    rules: Vec<CompiledRule>,
}

struct CompiledRule {
    schema_type: String,
    page_matchers: Vec<Selector>,
    fields: Vec<CompiledField>,
}

struct CompiledField {
    name: String,
    kind: String,
    matcher: Selector,
    content: String,
    exclude: Vec<Selector>,
}

fn parse_selector(selector: &str) -> Result<Selector, Error> {
    Selector::parse(selector).map_err(|_| Error::BadSelector(selector.to_string()))
}

impl RuleExtractor {
    pub fn new(host: &str, rules: &[ExtractionRule]) -> Result<Self, Error> {
        let mut compiled = Vec::with_capacity(rules.len());

        for rule in rules {
            let page_matchers = rule
                .page_matcher
                .iter()
                .map(|s| parse_selector(s))
                .collect::<Result<Vec<_>, _>>()?;

            let mut fields = Vec::with_capacity(rule.fields.len());
            for (name, field) in &rule.fields {
                fields.push(CompiledField::new(name, field)?);
            }

            compiled.push(CompiledRule {
                schema_type: rule.schema_type.clone(),
                page_matchers,
                fields,
            });
        }

        Ok(Self {
            host: host.to_string(),
            rules: compiled,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn extract(&self, page: &Page) -> Result<Option<Value>, Error> {
        let mut harvested = Vec::new();

        for rule in &self.rules {
            if let Some(data) = rule.extract(page) {
                harvested.push(data);
            }
        }

        match harvested.len() {
            0 => Ok(None),
            1 => Ok(harvested.pop()),
            _ => Ok(Some(Value::Array(harvested))),
        }
    }
}

impl CompiledRule {
    fn extract(&self, page: &Page) -> Option<Value> {
        // the rule activates on the first page matcher with a match
        let roots: Vec<ElementRef<'_>> = self
            .page_matchers
            .iter()
            .map(|matcher| page.doc().select(matcher).collect::<Vec<_>>())
            .find(|roots| !roots.is_empty())?;

        let mut data = Map::new();
        data.insert("type".to_string(), Value::String(self.schema_type.clone()));

        for field in &self.fields {
            if let Some(value) = field.extract(&roots) {
                data.insert(field.name.clone(), value);
            }
        }

        Some(Value::Object(data))
    }
}

impl CompiledField {
    fn new(name: &str, rule: &FieldRule) -> Result<Self, Error> {
        Ok(Self {
            name: name.to_string(),
            kind: rule.kind.clone(),
            matcher: parse_selector(&rule.matcher)?,
            content: rule.content.clone(),
            exclude: rule
                .exclude_match
                .iter()
                .map(|s| parse_selector(s))
                .collect::<Result<Vec<_>, _>>()?,
        })
    }

    fn extract(&self, roots: &[ElementRef<'_>]) -> Option<Value> {
        let mut nodes: Vec<ElementRef<'_>> = roots
            .iter()
            .flat_map(|root| root.select(&self.matcher))
            .collect();

        if nodes.is_empty() {
            tracing::debug!(field = %self.name, "no matches for field, skipping");
            return None;
        }

        if !self.exclude.is_empty() {
            nodes = nodes
                .into_iter()
                .flat_map(|node| node.children())
                .filter_map(ElementRef::wrap)
                .filter(|child| !self.exclude.iter().any(|exclude| exclude.matches(child)))
                .collect();
        }

        match self.kind.as_str() {
            "String" => {
                if self.content == "innerHTML" {
                    let text: String = nodes.iter().map(|node| node_text(*node)).collect();
                    Some(Value::String(text))
                } else {
                    let rows: Vec<String> = nodes
                        .iter()
                        .map(|node| {
                            node.value()
                                .attr(&self.content)
                                .unwrap_or_default()
                                .trim()
                                .to_string()
                        })
                        .collect();
                    Some(Value::String(rows.join("\n\n")))
                }
            }
            "[]String" => {
                let rows: Vec<Value> = nodes
                    .iter()
                    .map(|node| {
                        if self.content == "innerHTML" {
                            node_text(*node).trim().to_string()
                        } else {
                            node.value()
                                .attr(&self.content)
                                .unwrap_or_default()
                                .trim()
                                .to_string()
                        }
                    })
                    .map(Value::String)
                    .collect();
                Some(Value::Array(rows))
            }
            "Time" => {
                let first = nodes.first()?;

                let raw = if self.content == "innerHTML" {
                    node_text(*first)
                } else {
                    first
                        .value()
                        .attr(&self.content)
                        .unwrap_or_default()
                        .to_string()
                };

                match parse_datetime(&raw) {
                    Some(datetime) => Some(Value::String(datetime.to_rfc3339())),
                    None => {
                        tracing::warn!(field = %self.name, value = %raw.trim(), "unparsable time value, skipping field");
                        None
                    }
                }
            }
            kind => {
                tracing::warn!(field = %self.name, kind, "unknown field rule kind, skipping field");
                None
            }
        }
    }
}

fn node_text(node: ElementRef<'_>) -> String {
    node.text().collect()
}

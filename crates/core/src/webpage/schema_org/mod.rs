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

use scraper::Html;
use url::Url;

mod microdata;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn one(self) -> Option<T> {
        match self {
            OneOrMany::One(one) => Some(one),
            OneOrMany::Many(many) => many.into_iter().next(),
        }
    }

    pub fn many(self) -> Vec<T> {
        match self {
            OneOrMany::One(one) => vec![one],
            OneOrMany::Many(many) => many,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Property {
    String(String),
    Item(Item),
}

impl Property {
    pub fn try_into_string(&self) -> Option<String> {
        match self {
            Property::String(s) => Some(s.clone()),
            Property::Item(_) => None,
        }
    }

    pub fn try_into_item(&self) -> Option<Item> {
        match self {
            Property::String(_) => None,
            Property::Item(item) => Some(item.clone()),
        }
    }
}

/// A microdata item. Serializes to the json shape commonly used for
/// schema.org data (`@type` plus flattened properties).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Item {
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub itemtype: Option<OneOrMany<String>>,
    #[serde(flatten)]
    pub properties: HashMap<String, OneOrMany<Property>>,
}

impl Item {
    pub fn types_contains(&self, itemtype: &str) -> bool {
        match &self.itemtype {
            Some(tt) => match tt {
                OneOrMany::One(this_type) => itemtype == this_type,
                OneOrMany::Many(itemtypes) => itemtypes.iter().any(|t| t == itemtype),
            },
            None => false,
        }
    }
}

/// Parse all top-level microdata items from the document, relative to the
/// page url.
pub fn parse(doc: &Html, base: &Url) -> Vec<Item> {
    microdata::parse_schema(doc, base)
}

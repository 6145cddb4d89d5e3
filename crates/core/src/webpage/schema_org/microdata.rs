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

//! Almost spec compliant microdata parser: https://html.spec.whatwg.org/multipage/microdata.html
//!
//! Itemtypes are shortened to their last path segment so that
//! `https://schema.org/Person` and `http://schema.org/Person` both become
//! `Person`. Url-valued properties are resolved against the page url.

use std::collections::HashMap;

use itertools::Itertools;
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use super::{Item, OneOrMany, Property};

static TOP_LEVEL_ITEM_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("[itemscope]:not([itemprop])").expect("selector is valid"));

fn text_contents(el: ElementRef<'_>) -> String {
    el.text().flat_map(str::split_whitespace).join(" ")
}

fn resolve_url(base: &Url, raw: &str) -> String {
    match Url::parse(raw).or_else(|_| base.join(raw)) {
        Ok(url) => url.to_string(),
        Err(_) => raw.to_string(),
    }
}

/// The value of an `itemprop` element outside nested itemscopes, per
/// https://html.spec.whatwg.org/multipage/microdata.html#values
fn property_value(el: ElementRef<'_>, base: &Url) -> Property {
    let value = el.value();

    let raw = match value.name() {
        "meta" => value.attr("content").unwrap_or_default().to_string(),
        "audio" | "embed" | "iframe" | "img" | "source" | "track" | "video" => value
            .attr("src")
            .map(|src| resolve_url(base, src))
            .unwrap_or_default(),
        "a" | "area" | "link" => value
            .attr("href")
            .map(|href| resolve_url(base, href))
            .unwrap_or_default(),
        "object" => value
            .attr("data")
            .map(|data| resolve_url(base, data))
            .unwrap_or_default(),
        "data" | "meter" => value.attr("value").unwrap_or_default().to_string(),
        "time" => value
            .attr("datetime")
            .map(String::from)
            .unwrap_or_else(|| text_contents(el)),
        _ => text_contents(el),
    };

    Property::String(raw)
}

fn collect_properties(
    el: ElementRef<'_>,
    base: &Url,
    properties: &mut HashMap<String, Vec<Property>>,
) {
    for child in el.children() {
        let child_el = match ElementRef::wrap(child) {
            Some(child_el) => child_el,
            None => continue,
        };

        let value = child_el.value();

        if let Some(itemprop) = value.attr("itemprop") {
            let property = if value.attr("itemscope").is_some() {
                Property::Item(parse_item(child_el, base))
            } else {
                property_value(child_el, base)
            };

            for name in itemprop.split_ascii_whitespace() {
                properties
                    .entry(name.to_string())
                    .or_default()
                    .push(property.clone());
            }
        }

        if value.attr("itemscope").is_none() {
            collect_properties(child_el, base, properties);
        }
    }
}

/// https://html.spec.whatwg.org/multipage/microdata.html#associating-names-with-items
/// TODO: handle itemrefs
fn parse_item(el: ElementRef<'_>, base: &Url) -> Item {
    let itemtype = el.value().attr("itemtype").map(|s| {
        let itemtype: Vec<_> = s
            .split_ascii_whitespace()
            .map(shorten_itemtype)
            .collect();

        if itemtype.len() == 1 {
            OneOrMany::One(itemtype.into_iter().next().unwrap_or_default())
        } else {
            OneOrMany::Many(itemtype)
        }
    });

    let mut properties: HashMap<String, Vec<Property>> = HashMap::new();
    collect_properties(el, base, &mut properties);

    Item {
        itemtype,
        properties: properties
            .into_iter()
            .filter_map(|(name, mut properties)| {
                if properties.is_empty() {
                    None
                } else if properties.len() == 1 {
                    Some((name, OneOrMany::One(properties.remove(0))))
                } else {
                    Some((name, OneOrMany::Many(properties)))
                }
            })
            .collect(),
    }
}

fn shorten_itemtype(itemtype: &str) -> String {
    itemtype
        .rsplit('/')
        .next()
        .unwrap_or(itemtype)
        .to_string()
}

pub fn parse_schema(doc: &Html, base: &Url) -> Vec<Item> {
    doc.select(&TOP_LEVEL_ITEM_SELECTOR)
        .map(|el| parse_item(el, base))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_str(html: &str) -> Vec<Item> {
        let doc = Html::parse_document(html);
        let base = Url::parse("https://www.example.com/").unwrap();
        parse_schema(&doc, &base)
    }

    fn one_string(item: &Item, name: &str) -> String {
        item.properties
            .get(name)
            .cloned()
            .and_then(|p| p.one())
            .and_then(|p| p.try_into_string())
            .unwrap()
    }

    #[test]
    fn single_simple_item() {
        let res = parse_str(
            r#"
  <figure itemscope itemtype="http://n.whatwg.org/work">
   <img itemprop="work" src="images/house.jpeg" alt="A white house, boarded up, sits in a forest.">
   <figcaption itemprop="title">The <span>house</span> I found.</figcaption>
  </figure>
        "#,
        );

        assert_eq!(res.len(), 1);
        assert_eq!(res[0].itemtype, Some(OneOrMany::One("work".to_string())));
        assert_eq!(
            one_string(&res[0], "work"),
            "https://www.example.com/images/house.jpeg"
        );
        assert_eq!(one_string(&res[0], "title"), "The house I found.");
    }

    #[test]
    fn nested_items() {
        let res = parse_str(
            r##"
<article itemscope itemtype="http://schema.org/BlogPosting">
 <section>
  <h1>Comments</h1>
  <article itemprop="comment" itemscope itemtype="http://schema.org/UserComments" id="c1">
   <link itemprop="url" href="#c1">
   <footer>
    <p>Posted by: <span itemprop="creator" itemscope itemtype="http://schema.org/Person">
     <span itemprop="name">Greg</span>
    </span></p>
    <p><time itemprop="commentTime" datetime="2013-08-29">15 minutes ago</time></p>
   </footer>
   <p>Ha!</p>
  </article>
 </section>
</article>
        "##,
        );

        assert_eq!(res.len(), 1);
        assert!(res[0].types_contains("BlogPosting"));

        let comment = res[0]
            .properties
            .get("comment")
            .cloned()
            .and_then(|p| p.one())
            .and_then(|p| p.try_into_item())
            .unwrap();

        assert!(comment.types_contains("UserComments"));
        assert_eq!(one_string(&comment, "commentTime"), "2013-08-29");

        let creator = comment
            .properties
            .get("creator")
            .cloned()
            .and_then(|p| p.one())
            .and_then(|p| p.try_into_item())
            .unwrap();

        assert!(creator.types_contains("Person"));
        assert_eq!(one_string(&creator, "name"), "Greg");
    }

    #[test]
    fn repeated_property_becomes_many() {
        let res = parse_str(
            r##"
            <div itemscope itemtype="https://schema.org/Person">
                <a href="http://www.xyz.edu/students/alicejones.html" itemprop="colleague">Alice</a>
                <a href="http://www.xyz.edu/students/bobsmith.html" itemprop="colleague">Bob</a>
            </div>
            "##,
        );

        assert_eq!(res.len(), 1);
        assert_eq!(
            res[0].properties.get("colleague").cloned().map(|p| p
                .many()
                .into_iter()
                .filter_map(|p| p.try_into_string())
                .collect::<Vec<_>>()),
            Some(vec![
                "http://www.xyz.edu/students/alicejones.html".to_string(),
                "http://www.xyz.edu/students/bobsmith.html".to_string(),
            ])
        );
    }

    #[test]
    fn schema_image_object_example() {
        // example taken from https://schema.org/ImageObject
        let res = parse_str(
            r##"
            <html>
                <div itemscope itemtype="https://schema.org/ImageObject">
                <h2 itemprop="name">Beach in Mexico</h2>
                <img src="mexico-beach.jpg"
                alt="Sunny, sandy beach."
                itemprop="contentUrl" />

                By <span itemprop="author">Jane Doe</span>
                Photographed in
                <span itemprop="contentLocation">Puerto Vallarta, Mexico</span>
                Date uploaded:
                <meta itemprop="datePublished" content="2008-01-25">Jan 25, 2008

                <span itemprop="description">I took this picture while on vacation last year.</span>
                </div>
            </html>
            "##,
        );

        assert_eq!(res.len(), 1);
        assert_eq!(
            res[0].itemtype,
            Some(OneOrMany::One("ImageObject".to_string()))
        );
        assert_eq!(one_string(&res[0], "name"), "Beach in Mexico");
        assert_eq!(one_string(&res[0], "author"), "Jane Doe");
        assert_eq!(one_string(&res[0], "datePublished"), "2008-01-25");
        assert_eq!(
            one_string(&res[0], "contentUrl"),
            "https://www.example.com/mexico-beach.jpg"
        );
    }

    #[test]
    fn website_without_microdata() {
        let res = parse_str(
            r#"
            <html>
                <title>My Blog</title>
                <article>
                    <h1>Progress report</h1>
                    <p><time datetime="2013-08-29">today</time></p>
                </article>
            </html>
            "#,
        );

        assert!(res.is_empty());
    }

    #[test]
    fn serializes_to_schema_json() {
        let res = parse_str(
            r##"
            <div itemscope itemtype="https://schema.org/Person">
                <span itemprop="name">Jane Doe</span>
                <span itemprop="jobTitle">Professor</span>
            </div>
            "##,
        );

        let json = serde_json::to_value(&res[0]).unwrap();
        assert_eq!(json["@type"], "Person");
        assert_eq!(json["name"], "Jane Doe");
        assert_eq!(json["jobTitle"], "Professor");
    }
}

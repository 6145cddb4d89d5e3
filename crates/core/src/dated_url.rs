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

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DatedUrl {
    pub url: Url,
    pub last_modified: Option<DateTime<Utc>>,
}

impl From<Url> for DatedUrl {
    fn from(url: Url) -> Self {
        Self {
            url,
            last_modified: None,
        }
    }
}

const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%z",
    "%Y-%m-%dT%H:%M%:z",
    "%Y-%m-%d %H:%M:%S%z",
    "%d %B %Y %H:%M:%S%z",
];

const NAIVE_DATETIME_FORMATS: [&str; 3] = [
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
];

const NAIVE_DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%Y/%m/%d", "%B %d, %Y", "%d %B %Y"];

/// Lastmod timestamps and `Time` extraction fields appear in the wild in
/// many spellings. Try the rfc formats first, then a tolerant format
/// list; naive values are taken as utc.
pub fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();

    if s.is_empty() {
        return None;
    }

    if let Ok(datetime) = DateTime::parse_from_rfc3339(s) {
        return Some(datetime.with_timezone(&Utc));
    }

    if let Ok(datetime) = DateTime::parse_from_rfc2822(s) {
        return Some(datetime.with_timezone(&Utc));
    }

    for format in DATETIME_FORMATS {
        if let Ok(datetime) = DateTime::parse_from_str(s, format) {
            return Some(datetime.with_timezone(&Utc));
        }
    }

    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(s, format) {
            return Some(datetime.and_utc());
        }
    }

    for format in NAIVE_DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(s, format) {
            return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc3339() {
        let parsed = parse_datetime("2023-10-18T05:40:04.7435930+00:00").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2023-10-18T05:40:04.743593+00:00");

        let parsed = parse_datetime("2023-10-18T05:40:04Z").unwrap();
        assert_eq!(
            parsed,
            DateTime::parse_from_rfc3339("2023-10-18T05:40:04+00:00").unwrap()
        );
    }

    #[test]
    fn rfc2822() {
        assert!(parse_datetime("Mon, 30 Oct 2023 08:55:00 GMT").is_some());
    }

    #[test]
    fn date_only() {
        let parsed = parse_datetime("2018-02-23").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2018-02-23T00:00:00+00:00");

        assert!(parse_datetime("March 7, 2018").is_some());
    }

    #[test]
    fn offset_without_colon() {
        assert!(parse_datetime("2018-02-23T10:00:00+1100").is_some());
    }

    #[test]
    fn garbage() {
        assert!(parse_datetime("").is_none());
        assert!(parse_datetime("yesterday-ish").is_none());
        assert!(parse_datetime("2ss022-06-22T19:37:34+00:00").is_none());
    }
}

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

pub struct Crawler;

impl Crawler {
    pub fn worker_count() -> usize {
        40
    }

    pub fn fetch_timeout_secs() -> u64 {
        10
    }

    pub fn service_timeout_secs() -> u64 {
        60
    }

    pub fn max_body_bytes() -> usize {
        10 * 1024 * 1024
    }

    pub fn user_agent() -> String {
        "Mozilla/5.0 (compatible; TrawlBot/0.1; +https://trawl.dev/bot)".to_string()
    }

    pub fn queue_depth() -> usize {
        128
    }
}

pub struct Scheduler;

impl Scheduler {
    pub fn crawl_delay_ms() -> u64 {
        1_000
    }

    pub fn shutdown_timeout_secs() -> u64 {
        10
    }
}

pub struct Feeds;

impl Feeds {
    pub fn interval_secs() -> u64 {
        15 * 60
    }
}

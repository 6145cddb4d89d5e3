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

//! Main library for Trawl.
//!
//! The crawl service ([`crawler`]) executes fetches through a bounded worker
//! pool, the per-host scheduler ([`scheduler`]) owns admission and
//! politeness, feed sources ([`feeds`]) inject urls on a periodic cadence,
//! and the extraction pipeline ([`webpage`], [`extractor`]) turns fetched
//! pages into structured crawl records.

use std::path::PathBuf;

use thiserror::Error;

pub mod config;
pub mod crawler;
pub mod dated_url;
pub mod extractor;
pub mod feeds;
pub mod metrics;
pub mod scheduler;
pub mod sitemap;
pub mod store;
pub mod webpage;

#[derive(Error, Debug)]
pub enum Error {
    #[error("malformed url: {0}")]
    MalformedUrl(String),

    #[error("fetch transport: {0}")]
    FetchTransport(String),

    #[error("fetch failed with status {0}")]
    FetchStatus(u16),

    #[error("failed to read response body: {0}")]
    BodyRead(String),

    #[error("failed to parse document: {0}")]
    DomParse(String),

    #[error("extractor failed: {0}")]
    ExtractorFailed(String),

    #[error("invalid selector: {0}")]
    BadSelector(String),

    #[error("deadline exceeded")]
    Timeout,

    #[error("shutdown deadline exceeded")]
    ShutdownTimeout,

    #[error("store backend: {0}")]
    StoreIo(String),

    #[error("not implemented")]
    Unimplemented,
}

impl Error {
    /// Short kind tag used as `ErrorCode` on the crawl record wire format.
    pub fn code(&self) -> &'static str {
        match self {
            Error::MalformedUrl(_) => "MalformedURL",
            Error::FetchTransport(_) => "FetchTransport",
            Error::FetchStatus(_) => "FetchStatus",
            Error::BodyRead(_) => "BodyRead",
            Error::DomParse(_) => "DOMParse",
            Error::ExtractorFailed(_) => "ExtractorFailed",
            Error::BadSelector(_) => "BadSelector",
            Error::Timeout => "Timeout",
            Error::ShutdownTimeout => "ShutdownTimeout",
            Error::StoreIo(_) => "StoreIO",
            Error::Unimplemented => "Unimplemented",
        }
    }
}

pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;

// taken from https://docs.rs/sled/0.34.7/src/sled/config.rs.html#445
#[doc(hidden)]
pub fn gen_temp_path() -> PathBuf {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::SystemTime;

    static SALT_COUNTER: AtomicUsize = AtomicUsize::new(0);

    let seed = SALT_COUNTER.fetch_add(1, Ordering::SeqCst) as u128;

    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap()
        .as_nanos()
        << 48;

    let pid = u128::from(std::process::id());

    let salt = (pid << 16) + now + seed;

    if cfg!(target_os = "linux") {
        // use shared memory for temporary linux files
        format!("/dev/shm/trawl.tmp.{salt}").into()
    } else {
        std::env::temp_dir().join(format!("trawl.tmp.{salt}"))
    }
}

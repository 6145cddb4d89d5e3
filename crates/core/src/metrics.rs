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
use std::sync::Mutex;

/// Fire-and-forget instrumentation used by workers, the service and the
/// scheduler. Callers never observe errors and no operation blocks beyond
/// a short mutex hold, so implementations must not perform i/o inline.
pub trait Instrument: Send + Sync {
    fn count(&self, metric: &str);
    fn gauge(&self, metric: &str, delta: i64);
    fn histogram(&self, metric: &str, value: &str);
}

/// In-memory instrumentation. Counters and gauges are integer totals,
/// histograms map each observed value to its number of occurrences.
/// Each metric family is protected by its own lock.
#[derive(Default)]
pub struct MemInstrument {
    counts: Mutex<HashMap<String, i64>>,
    gauges: Mutex<HashMap<String, Gauge>>,
    histograms: Mutex<HashMap<String, HashMap<String, i64>>>,
}

#[derive(Default, Clone, Copy)]
struct Gauge {
    value: i64,
    high: i64,
}

impl MemInstrument {
    pub fn counter_value(&self, metric: &str) -> i64 {
        self.counts
            .lock()
            .unwrap()
            .get(metric)
            .copied()
            .unwrap_or_default()
    }

    pub fn gauge_value(&self, metric: &str) -> i64 {
        self.gauges
            .lock()
            .unwrap()
            .get(metric)
            .map(|g| g.value)
            .unwrap_or_default()
    }

    /// Highest value the gauge has reached.
    pub fn gauge_high_water(&self, metric: &str) -> i64 {
        self.gauges
            .lock()
            .unwrap()
            .get(metric)
            .map(|g| g.high)
            .unwrap_or_default()
    }

    pub fn histogram_value(&self, metric: &str, value: &str) -> i64 {
        self.histograms
            .lock()
            .unwrap()
            .get(metric)
            .and_then(|hist| hist.get(value))
            .copied()
            .unwrap_or_default()
    }
}

impl Instrument for MemInstrument {
    fn count(&self, metric: &str) {
        let mut counts = self.counts.lock().unwrap();
        *counts.entry(metric.to_string()).or_default() += 1;
    }

    fn gauge(&self, metric: &str, delta: i64) {
        let mut gauges = self.gauges.lock().unwrap();
        let gauge = gauges.entry(metric.to_string()).or_default();
        gauge.value += delta;
        gauge.high = gauge.high.max(gauge.value);
    }

    fn histogram(&self, metric: &str, value: &str) {
        let mut histograms = self.histograms.lock().unwrap();
        *histograms
            .entry(metric.to_string())
            .or_default()
            .entry(value.to_string())
            .or_default() += 1;
    }
}

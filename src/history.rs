/// Bounded per-station reading history.
///
/// Each station keeps its most recent readings in arrival order, capped
/// at a fixed count; the oldest entry is evicted first. There is no
/// age-based eviction: an idle station can hold readings far older than
/// the bootstrap window until new arrivals push them out, and a busy one
/// can cycle through its whole capacity in minutes.
///
/// The table is a `DashMap`, so mutations of one station are serialized
/// under its shard lock while other stations proceed in parallel.

use std::collections::{BTreeMap, VecDeque};

use dashmap::DashMap;
use serde::Serialize;

use crate::model::{HISTORY_CAPACITY, HistoryEntry, HistorySnapshot, Trend};

/// Everything the service knows about one station.
#[derive(Debug, Clone)]
struct StationState {
    entries: VecDeque<HistoryEntry>,
    last_location: Option<(f64, f64)>,
    last_trend: Trend,
}

impl StationState {
    fn new(capacity: usize) -> Self {
        StationState {
            entries: VecDeque::with_capacity(capacity),
            last_location: None,
            last_trend: Trend::Stable,
        }
    }

    fn status(&self) -> StationStatus {
        StationStatus {
            readings: self.entries.len(),
            trend: self.last_trend,
            location: self.last_location,
        }
    }
}

/// Summary of one station for health reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StationStatus {
    pub readings: usize,
    pub trend: Trend,
    /// Last resolved (latitude, longitude).
    pub location: Option<(f64, f64)>,
}

/// Outcome of an append: the trend against the previous entry and the
/// station's sequence after the append.
#[derive(Debug, Clone, PartialEq)]
pub struct Appended {
    pub trend: Trend,
    pub history: Vec<HistoryEntry>,
}

pub struct HistoryStore {
    capacity: usize,
    stations: DashMap<String, StationState>,
}

impl Default for HistoryStore {
    fn default() -> Self {
        HistoryStore::new(HISTORY_CAPACITY)
    }
}

impl HistoryStore {
    /// A capacity of zero is bumped to one; a station always remembers
    /// its latest reading.
    pub fn new(capacity: usize) -> Self {
        HistoryStore {
            capacity: capacity.max(1),
            stations: DashMap::new(),
        }
    }

    /// Appends `entry` and returns the trend against the entry appended
    /// immediately before it. The first entry for a station is `Stable`.
    pub fn append(&self, station_id: &str, entry: HistoryEntry) -> Trend {
        self.append_located(station_id, entry, None).trend
    }

    /// Like `append`, also recording the resolved location and returning
    /// the post-append sequence under the same lock.
    pub fn append_located(
        &self,
        station_id: &str,
        entry: HistoryEntry,
        location: Option<(f64, f64)>,
    ) -> Appended {
        let mut state = self
            .stations
            .entry(station_id.to_string())
            .or_insert_with(|| StationState::new(self.capacity));

        let trend = match state.entries.back() {
            Some(previous) => Trend::between(previous.water_level, entry.water_level),
            None => Trend::Stable,
        };

        state.entries.push_back(entry);
        while state.entries.len() > self.capacity {
            state.entries.pop_front();
        }
        state.last_trend = trend;
        if location.is_some() {
            state.last_location = location;
        }

        Appended {
            trend,
            history: state.entries.iter().cloned().collect(),
        }
    }

    /// Replaces a station's entries with `entries`, keeping only the most
    /// recent `capacity` of them. Location and trend are left as they were.
    pub fn seed(&self, station_id: &str, entries: Vec<HistoryEntry>) {
        let skip = entries.len().saturating_sub(self.capacity);
        let mut state = self
            .stations
            .entry(station_id.to_string())
            .or_insert_with(|| StationState::new(self.capacity));
        state.entries = entries.into_iter().skip(skip).collect();
    }

    /// Read-only dump of every station's sequence.
    pub fn snapshot(&self) -> HistorySnapshot {
        self.stations
            .iter()
            .map(|item| (item.key().clone(), item.value().entries.iter().cloned().collect()))
            .collect()
    }

    /// Every station's status, ordered by station id.
    pub fn statuses(&self) -> BTreeMap<String, StationStatus> {
        self.stations
            .iter()
            .map(|item| (item.key().clone(), item.value().status()))
            .collect()
    }
}

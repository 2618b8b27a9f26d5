//! Bounded in-memory log of rewritten references, served at `/history`.

use crate::hls::rewrite::RewriteRecord;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub recorded_at: DateTime<Utc>,
    /// Playlist the reference was found in
    pub manifest: String,
    pub original: String,
    pub rewritten: String,
}

/// Oldest entries are dropped once `capacity` is reached.
#[derive(Clone, Debug)]
pub struct RouteHistory {
    entries: Arc<Mutex<VecDeque<HistoryEntry>>>,
    capacity: usize,
}

impl RouteHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(1024)))),
            capacity,
        }
    }

    /// Append one entry per rewritten reference of `manifest`.
    pub fn record(&self, manifest: &str, records: &[RewriteRecord]) {
        if self.capacity == 0 || records.is_empty() {
            return;
        }

        let now = Utc::now();
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        for record in records {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(HistoryEntry {
                recorded_at: now,
                manifest: manifest.to_string(),
                original: record.original.clone(),
                rewritten: record.rewritten.clone(),
            });
        }
    }

    /// Most recent entries first, at most `limit` of them.
    pub fn recent(&self, limit: usize) -> Vec<HistoryEntry> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: usize) -> RewriteRecord {
        RewriteRecord {
            original: format!("https://origin.example/seg{n}.ts"),
            rewritten: format!("http://relay/proxy?url=seg{n}"),
        }
    }

    #[test]
    fn records_in_order_newest_first() {
        let history = RouteHistory::new(10);
        history.record("https://origin.example/index.m3u8", &[record(0), record(1)]);

        let recent = history.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].original, "https://origin.example/seg1.ts");
        assert_eq!(recent[1].original, "https://origin.example/seg0.ts");
        assert_eq!(recent[0].manifest, "https://origin.example/index.m3u8");
    }

    #[test]
    fn drops_oldest_at_capacity() {
        let history = RouteHistory::new(3);
        let records: Vec<_> = (0..5).map(record).collect();
        history.record("m", &records);

        assert_eq!(history.len(), 3);
        let originals: Vec<_> = history.recent(10).into_iter().map(|e| e.original).collect();
        assert_eq!(
            originals,
            vec![
                "https://origin.example/seg4.ts",
                "https://origin.example/seg3.ts",
                "https://origin.example/seg2.ts",
            ]
        );
    }

    #[test]
    fn limit_truncates() {
        let history = RouteHistory::new(10);
        history.record("m", &[record(0), record(1), record(2)]);
        assert_eq!(history.recent(1).len(), 1);
    }

    #[test]
    fn zero_capacity_records_nothing() {
        let history = RouteHistory::new(0);
        history.record("m", &[record(0)]);
        assert!(history.is_empty());
    }

    #[test]
    fn serializes_with_rfc3339_timestamp() {
        let history = RouteHistory::new(1);
        history.record("m", &[record(0)]);
        let json = serde_json::to_value(history.recent(1)).unwrap();
        let ts = json[0]["recorded_at"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());
    }
}

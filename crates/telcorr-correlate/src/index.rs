//! Derived lookup structures over summary history
//!
//! Every mapping is rebuilt from the summaries themselves and can be dropped
//! at any time. Queries return a [`SummaryQuery`]: a snapshot of matching ids
//! that resolves summaries lazily and can be iterated any number of times.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use telcorr_core::config::IndexSettings;
use telcorr_core::timewindow::bucket_start;
use telcorr_core::{CorrelationKey, CorrelationSummary};
use tracing::{debug, warn};

type TimeSlot = (DateTime<Utc>, String);

#[derive(Default)]
struct IndexInner {
    summaries: HashMap<String, Arc<CorrelationSummary>>,
    by_time: BTreeSet<TimeSlot>,
    by_key: HashMap<CorrelationKey, BTreeSet<TimeSlot>>,
    by_service: HashMap<String, BTreeSet<TimeSlot>>,
    by_bucket: BTreeMap<DateTime<Utc>, BTreeSet<TimeSlot>>,
}

impl IndexInner {
    fn remove(&mut self, bucket_width: Duration, summary_id: &str) -> bool {
        let Some(summary) = self.summaries.remove(summary_id) else {
            return false;
        };
        let slot = (summary.start_time, summary.summary_id.clone());

        self.by_time.remove(&slot);
        remove_slot(&mut self.by_key, &summary.primary_key, &slot);
        for service in &summary.services {
            remove_slot(&mut self.by_service, service, &slot);
        }
        if let Ok(bucket) = bucket_start(summary.start_time, bucket_width) {
            if let Some(slots) = self.by_bucket.get_mut(&bucket) {
                slots.remove(&slot);
                if slots.is_empty() {
                    self.by_bucket.remove(&bucket);
                }
            }
        }
        true
    }
}

fn remove_slot<K: std::hash::Hash + Eq>(
    map: &mut HashMap<K, BTreeSet<TimeSlot>>,
    key: &K,
    slot: &TimeSlot,
) {
    if let Some(slots) = map.get_mut(key) {
        slots.remove(slot);
        if slots.is_empty() {
            map.remove(key);
        }
    }
}

/// Index of summaries by key, service, time bucket and start time
#[derive(Clone)]
pub struct SummaryIndex {
    inner: Arc<RwLock<IndexInner>>,
    max_entries: usize,
    max_age: Duration,
    bucket_width: Duration,
}

impl SummaryIndex {
    pub fn new(settings: &IndexSettings) -> Self {
        let bucket_secs = i64::try_from(settings.bucket_secs.max(1)).unwrap_or(i64::MAX);
        let max_age_secs = i64::try_from(settings.max_age_secs).unwrap_or(i64::MAX);
        Self {
            inner: Arc::new(RwLock::new(IndexInner::default())),
            max_entries: settings.max_entries,
            max_age: Duration::try_seconds(max_age_secs).unwrap_or(Duration::MAX),
            bucket_width: Duration::try_seconds(bucket_secs).unwrap_or(Duration::MAX),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().summaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, summary_id: &str) -> bool {
        self.inner.read().summaries.contains_key(summary_id)
    }

    pub fn get(&self, summary_id: &str) -> Option<Arc<CorrelationSummary>> {
        self.inner.read().summaries.get(summary_id).cloned()
    }

    /// Add a summary; indexing the same summary id again is a no-op
    pub fn index(&self, summary: CorrelationSummary) -> bool {
        let bucket = match bucket_start(summary.start_time, self.bucket_width) {
            Ok(bucket) => bucket,
            Err(e) => {
                warn!(summary_id = %summary.summary_id, "Cannot bucket summary: {}", e);
                return false;
            }
        };

        let mut inner = self.inner.write();
        if inner.summaries.contains_key(&summary.summary_id) {
            return false;
        }

        let slot = (summary.start_time, summary.summary_id.clone());
        inner.by_time.insert(slot.clone());
        inner
            .by_key
            .entry(summary.primary_key.clone())
            .or_default()
            .insert(slot.clone());
        for service in &summary.services {
            inner
                .by_service
                .entry(service.clone())
                .or_default()
                .insert(slot.clone());
        }
        inner.by_bucket.entry(bucket).or_default().insert(slot);
        inner
            .summaries
            .insert(summary.summary_id.clone(), Arc::new(summary));
        true
    }

    /// Index many summaries, then apply retention relative to `now`
    pub fn index_all(
        &self,
        summaries: impl IntoIterator<Item = CorrelationSummary>,
        now: DateTime<Utc>,
    ) -> usize {
        let added = summaries
            .into_iter()
            .map(|s| self.index(s))
            .filter(|added| *added)
            .count();
        self.enforce_retention(now);
        added
    }

    /// Evict oldest-first until within the size and age bounds
    pub fn enforce_retention(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now.checked_sub_signed(self.max_age);
        let mut inner = self.inner.write();
        let mut evicted = 0;

        loop {
            let Some((start, id)) = inner.by_time.first().cloned() else {
                break;
            };
            let too_many = inner.summaries.len() > self.max_entries;
            let too_old = cutoff.is_some_and(|cutoff| start < cutoff);
            if !too_many && !too_old {
                break;
            }
            if inner.remove(self.bucket_width, &id) {
                evicted += 1;
            } else {
                inner.by_time.remove(&(start, id));
            }
        }

        if evicted > 0 {
            debug!(evicted, remaining = inner.summaries.len(), "Index retention applied");
        }
        evicted
    }

    /// Summaries whose start time falls in `[from, to]`, oldest first
    ///
    /// Visits only the occupied buckets of the range.
    pub fn range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> SummaryQuery {
        if to < from {
            return self.query(Vec::new());
        }
        let first_bucket = bucket_start(from, self.bucket_width).unwrap_or(from);
        let ids: Vec<String> = self
            .inner
            .read()
            .by_bucket
            .range(first_bucket..=to)
            .flat_map(|(_, slots)| slots.iter())
            .filter(|(start, _)| *start >= from && *start <= to)
            .map(|(_, id)| id.clone())
            .collect();
        self.query(ids)
    }

    /// Every summary of a correlation key, oldest first
    pub fn by_key(&self, key: &CorrelationKey) -> SummaryQuery {
        let ids: Vec<String> = self
            .inner
            .read()
            .by_key
            .get(key)
            .map(|slots| slots.iter().map(|(_, id)| id.clone()).collect())
            .unwrap_or_default();
        self.query(ids)
    }

    /// Every summary that observed a service, oldest first
    pub fn by_service(&self, service: &str) -> SummaryQuery {
        let ids: Vec<String> = self
            .inner
            .read()
            .by_service
            .get(service)
            .map(|slots| slots.iter().map(|(_, id)| id.clone()).collect())
            .unwrap_or_default();
        self.query(ids)
    }

    /// Every indexed summary, oldest first
    pub fn all(&self) -> SummaryQuery {
        let ids: Vec<String> = self
            .inner
            .read()
            .by_time
            .iter()
            .map(|(_, id)| id.clone())
            .collect();
        self.query(ids)
    }

    fn query(&self, ids: Vec<String>) -> SummaryQuery {
        SummaryQuery {
            inner: self.inner.clone(),
            ids: Arc::new(ids),
        }
    }
}

/// Finite, restartable result of an index query
///
/// Holds matching ids only; summaries are looked up while iterating, and ones
/// evicted since the query was made are skipped.
#[derive(Clone)]
pub struct SummaryQuery {
    inner: Arc<RwLock<IndexInner>>,
    ids: Arc<Vec<String>>,
}

impl SummaryQuery {
    /// Number of ids captured by the query
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> SummaryIter<'_> {
        SummaryIter {
            query: self,
            position: 0,
        }
    }

    pub fn to_vec(&self) -> Vec<Arc<CorrelationSummary>> {
        self.iter().collect()
    }
}

impl<'a> IntoIterator for &'a SummaryQuery {
    type Item = Arc<CorrelationSummary>;
    type IntoIter = SummaryIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over a [`SummaryQuery`]
pub struct SummaryIter<'a> {
    query: &'a SummaryQuery,
    position: usize,
}

impl Iterator for SummaryIter<'_> {
    type Item = Arc<CorrelationSummary>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(id) = self.query.ids.get(self.position) {
            self.position += 1;
            if let Some(summary) = self.query.inner.read().summaries.get(id) {
                return Some(summary.clone());
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use telcorr_core::KeyKind;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn settings() -> IndexSettings {
        IndexSettings {
            max_entries: 100,
            max_age_secs: 3600,
            bucket_secs: 60,
        }
    }

    fn summary(id: &str, key: CorrelationKey, service: &str, start_secs: i64) -> CorrelationSummary {
        let start = t0() + Duration::seconds(start_secs);
        CorrelationSummary {
            summary_id: id.to_string(),
            correlation_id: key.correlation_id(),
            primary_key: key,
            window_start: start,
            log_count: 1,
            span_count: 0,
            severity_counts: BTreeMap::new(),
            services: BTreeSet::from([service.to_string()]),
            start_time: start,
            end_time: start,
            confidence_score: 1.0,
            parent: None,
            windows_seen: 1,
        }
    }

    fn ids(query: &SummaryQuery) -> Vec<String> {
        query.iter().map(|s| s.summary_id.clone()).collect()
    }

    #[test]
    fn test_reindex_is_idempotent() {
        let index = SummaryIndex::new(&settings());
        let s = summary("s-1", CorrelationKey::trace("t-1"), "checkout", 10);

        assert!(index.index(s.clone()));
        assert!(!index.index(s));

        let results = index.range(t0(), t0() + Duration::minutes(5));
        assert_eq!(ids(&results), vec!["s-1"]);
        assert_eq!(index.by_service("checkout").len(), 1);
    }

    #[test]
    fn test_range_spans_buckets() {
        let index = SummaryIndex::new(&settings());
        index.index(summary("a", CorrelationKey::trace("t-1"), "checkout", 30));
        index.index(summary("b", CorrelationKey::trace("t-2"), "checkout", 90));
        index.index(summary("c", CorrelationKey::trace("t-3"), "checkout", 200));

        let results = index.range(t0() + Duration::seconds(30), t0() + Duration::seconds(120));
        assert_eq!(ids(&results), vec!["a", "b"]);

        let empty = index.range(t0() + Duration::seconds(120), t0());
        assert!(empty.is_empty());
    }

    #[test]
    fn test_wide_range_over_sparse_buckets() {
        let index = SummaryIndex::new(&IndexSettings {
            bucket_secs: 1,
            ..settings()
        });
        index.index(summary("early", CorrelationKey::trace("t-1"), "checkout", 0));
        index.index(summary("late", CorrelationKey::trace("t-2"), "checkout", 3_000));

        let from = t0() - Duration::days(365);
        let to = t0() + Duration::days(365);
        assert_eq!(ids(&index.range(from, to)), vec!["early", "late"]);

        // Lower bound inside an occupied bucket still filters by start time
        let results = index.range(t0() + Duration::milliseconds(500), to);
        assert_eq!(ids(&results), vec!["late"]);
        assert!(SummaryIndex::new(&settings()).range(from, to).is_empty());
    }

    #[test]
    fn test_by_key_and_service() {
        let index = SummaryIndex::new(&settings());
        let circuit = CorrelationKey::new(KeyKind::CircuitId, "C-1");
        index.index(summary("a", circuit.clone(), "noc", 0));
        index.index(summary("b", circuit.clone(), "billing", 70));
        index.index(summary("c", CorrelationKey::trace("t-1"), "noc", 5));

        assert_eq!(ids(&index.by_key(&circuit)), vec!["a", "b"]);
        assert_eq!(ids(&index.by_service("noc")), vec!["a", "c"]);
        assert!(index.by_service("unknown").is_empty());
    }

    #[test]
    fn test_query_is_restartable() {
        let index = SummaryIndex::new(&settings());
        index.index(summary("a", CorrelationKey::trace("t-1"), "checkout", 0));
        index.index(summary("b", CorrelationKey::trace("t-2"), "checkout", 1));

        let query = index.all();
        assert_eq!(query.iter().count(), 2);
        assert_eq!(query.iter().count(), 2);

        let mut seen = 0;
        for summary in &query {
            assert!(!summary.summary_id.is_empty());
            seen += 1;
        }
        assert_eq!(seen, 2);
    }

    #[test]
    fn test_retention_by_size_is_oldest_first() {
        let index = SummaryIndex::new(&IndexSettings {
            max_entries: 2,
            ..settings()
        });
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            index.index(summary(id, CorrelationKey::trace(*id), "checkout", i as i64));
        }

        let query_before = index.by_service("checkout");
        assert_eq!(index.enforce_retention(t0()), 1);

        assert!(!index.contains("a"));
        assert!(index.by_key(&CorrelationKey::trace("a")).is_empty());
        assert_eq!(ids(&index.by_service("checkout")), vec!["b", "c"]);
        // Snapshots skip evicted summaries
        assert_eq!(ids(&query_before), vec!["b", "c"]);
    }

    #[test]
    fn test_retention_by_age() {
        let index = SummaryIndex::new(&settings());
        index.index(summary("old", CorrelationKey::trace("t-1"), "checkout", 0));
        index.index(summary("new", CorrelationKey::trace("t-2"), "checkout", 3000));

        let evicted = index.enforce_retention(t0() + Duration::seconds(3700));
        assert_eq!(evicted, 1);
        assert_eq!(ids(&index.all()), vec!["new"]);
        assert!(index.range(t0(), t0() + Duration::seconds(60)).is_empty());
    }
}

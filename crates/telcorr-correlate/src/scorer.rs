//! Parent inference between trace segments
//!
//! A segment is the TraceId or SpanId bucket of a closed window. When no
//! explicit key joins two segments, the scorer looks for a plausible parent:
//!
//! - a dangling `parent_span_id` of the child found among the parent's span ids
//! - business keys shared by both segments
//! - how close the parent started before the child
//! - whether the parent declares the child's root service as downstream
//!
//! Segments live in a [`SegmentArena`] and refer to their parent by
//! [`SegmentId`]; the arena is dropped with the window.

use crate::window::CorrelationWindow;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use telcorr_core::config::{CorrelationSettings, ScoringWeights};
use telcorr_core::{CorrelationKey, CorrelationSummary, NormalizedEvent, ParentLink};
use tracing::debug;

/// Opaque handle of a segment within its arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(usize);

/// One explicitly keyed group of events
#[derive(Debug, Clone)]
pub struct Segment {
    pub key: CorrelationKey,

    /// Earliest event time in the segment
    pub start: DateTime<Utc>,

    /// Service of the segment's root span, or of its earliest event
    pub root_service: String,

    pub span_ids: BTreeSet<String>,

    /// Parent span ids that point outside the segment
    pub dangling_parents: BTreeSet<String>,

    /// Downstream services declared by the segment's spans
    pub peer_services: BTreeSet<String>,

    pub business_keys: BTreeSet<CorrelationKey>,

    parent: Option<(SegmentId, f64)>,
}

impl Segment {
    fn from_events(key: &CorrelationKey, events: &[Arc<NormalizedEvent>]) -> Option<Self> {
        let earliest = events.iter().min_by_key(|e| e.timestamp)?;

        let mut span_ids = BTreeSet::new();
        let mut parent_ids = BTreeSet::new();
        let mut peer_services = BTreeSet::new();
        let mut business_keys = BTreeSet::new();

        for event in events {
            if let Some(span) = event.span() {
                span_ids.extend(span.span_id.iter().cloned());
                parent_ids.extend(span.parent_span_id.iter().cloned());
                peer_services.extend(span.peer_service.iter().cloned());
            }
            business_keys.extend(event.keys.iter().filter(|k| k.kind.is_business()).cloned());
        }

        let dangling_parents: BTreeSet<String> =
            parent_ids.difference(&span_ids).cloned().collect();

        // Root span: a span without an in-segment parent, earliest first
        let root_service = events
            .iter()
            .filter(|e| {
                e.span().is_some_and(|s| {
                    s.parent_span_id
                        .as_ref()
                        .map_or(true, |p| !span_ids.contains(p))
                })
            })
            .min_by_key(|e| e.timestamp)
            .unwrap_or(earliest)
            .service
            .clone();

        Some(Self {
            key: key.clone(),
            start: earliest.timestamp,
            root_service,
            span_ids,
            dangling_parents,
            peer_services,
            business_keys,
            parent: None,
        })
    }

    /// Accepted parent and its normalized score
    pub fn parent(&self) -> Option<(SegmentId, f64)> {
        self.parent
    }
}

/// Segments of one window
#[derive(Debug, Default)]
pub struct SegmentArena {
    segments: Vec<Segment>,
}

impl SegmentArena {
    /// Collect the TraceId and SpanId buckets of a summarized window
    pub fn from_window(window: &CorrelationWindow) -> Self {
        let segments = window
            .buckets()
            .filter(|(key, _)| key.kind.is_explicit())
            .filter_map(|(key, events)| Segment::from_events(key, events))
            .collect();
        Self { segments }
    }

    pub fn push(&mut self, segment: Segment) -> SegmentId {
        self.segments.push(segment);
        SegmentId(self.segments.len() - 1)
    }

    pub fn get(&self, id: SegmentId) -> Option<&Segment> {
        self.segments.get(id.0)
    }

    pub fn ids(&self) -> impl Iterator<Item = SegmentId> {
        (0..self.segments.len()).map(SegmentId)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Whether `ancestor` is reachable from `id` by following parents
    fn is_ancestor(&self, ancestor: SegmentId, mut id: SegmentId) -> bool {
        let mut steps = 0;
        while let Some((parent, _)) = self.get(id).and_then(Segment::parent) {
            if parent == ancestor {
                return true;
            }
            id = parent;
            steps += 1;
            if steps > self.segments.len() {
                return true;
            }
        }
        false
    }
}

fn links_span(child: &Segment, parent: &Segment) -> bool {
    child
        .dangling_parents
        .iter()
        .any(|p| parent.span_ids.contains(p))
}

/// An accepted parent assignment
#[derive(Debug, Clone, PartialEq)]
pub struct Inference {
    pub child: SegmentId,
    pub parent: SegmentId,
    pub confidence: f64,
}

/// Scores candidate parents and accepts those at or above the threshold
#[derive(Debug, Clone)]
pub struct TraceScorer {
    weights: ScoringWeights,
    threshold: f64,
    max_lookback_ms: u64,
}

impl TraceScorer {
    pub fn new(weights: ScoringWeights, threshold: f64, max_lookback_ms: u64) -> Self {
        Self {
            weights,
            threshold,
            max_lookback_ms,
        }
    }

    pub fn from_settings(settings: &CorrelationSettings) -> Self {
        Self::new(
            settings.weights.clone(),
            settings.confidence_threshold,
            settings.max_lookback_ms,
        )
    }

    /// Highest score the child could reach against any parent
    pub fn max_score(&self, child: &Segment) -> f64 {
        let explicit = if child.dangling_parents.is_empty() {
            0.0
        } else {
            self.weights.span_id
        };
        let business: f64 = child
            .business_keys
            .iter()
            .map(|k| self.weights.for_kind(k.kind))
            .sum();
        explicit + business + self.weights.temporal + self.weights.downstream_service
    }

    /// Whether the two segments share a span link, a business key or a
    /// downstream call; proximity in time alone never makes a parent
    pub fn shares_evidence(&self, child: &Segment, parent: &Segment) -> bool {
        links_span(child, parent)
            || !child.business_keys.is_disjoint(&parent.business_keys)
            || parent.peer_services.contains(&child.root_service)
    }

    /// Raw score of `parent` as the parent of `child`
    pub fn raw_score(&self, child: &Segment, parent: &Segment) -> f64 {
        let mut score = 0.0;

        if links_span(child, parent) {
            score += self.weights.span_id;
        }

        score += child
            .business_keys
            .intersection(&parent.business_keys)
            .map(|k| self.weights.for_kind(k.kind))
            .sum::<f64>();

        score += self.temporal_bonus(child.start, parent.start);

        if parent.peer_services.contains(&child.root_service) {
            score += self.weights.downstream_service;
        }

        score
    }

    /// Normalized score in [0, 1], or `None` when the pair is not a candidate
    pub fn normalized_score(&self, child: &Segment, parent: &Segment) -> Option<f64> {
        if !self.shares_evidence(child, parent) {
            return None;
        }
        let max = self.max_score(child);
        if max <= 0.0 {
            return None;
        }
        Some((self.raw_score(child, parent) / max).clamp(0.0, 1.0))
    }

    fn temporal_bonus(&self, child_start: DateTime<Utc>, parent_start: DateTime<Utc>) -> f64 {
        if self.max_lookback_ms == 0 {
            return 0.0;
        }
        let delta = (child_start - parent_start).num_milliseconds();
        let lookback = self.max_lookback_ms as f64;
        if delta < 0 || delta as f64 >= lookback {
            return 0.0;
        }
        self.weights.temporal * (1.0 - delta as f64 / lookback)
    }

    /// Best acceptable parent for `child` among the arena's segments
    pub fn best_parent(&self, arena: &SegmentArena, child: SegmentId) -> Option<(SegmentId, f64)> {
        let child_seg = arena.get(child)?;
        let mut best: Option<(SegmentId, f64)> = None;

        for candidate in arena.ids() {
            if candidate == child {
                continue;
            }
            let Some(parent_seg) = arena.get(candidate) else {
                continue;
            };
            if parent_seg.start > child_seg.start || arena.is_ancestor(child, candidate) {
                continue;
            }
            let Some(score) = self.normalized_score(child_seg, parent_seg) else {
                continue;
            };

            best = match best {
                None => Some((candidate, score)),
                Some((current, best_score)) => {
                    let current_start = arena.get(current).map(|s| s.start);
                    if score > best_score
                        || (score == best_score && Some(parent_seg.start) < current_start)
                    {
                        Some((candidate, score))
                    } else {
                        Some((current, best_score))
                    }
                }
            };
        }

        best.filter(|(_, score)| *score >= self.threshold)
    }

    /// Assign parents to every segment that has an acceptable one
    ///
    /// Children are visited in start order so earlier assignments are visible
    /// to the cycle check of later ones.
    pub fn infer_parents(&self, arena: &mut SegmentArena) -> Vec<Inference> {
        let mut order: Vec<SegmentId> = arena.ids().collect();
        order.sort_by_key(|id| (arena.get(*id).map(|s| s.start), *id));

        let mut inferences = Vec::new();
        for child in order {
            if let Some((parent, confidence)) = self.best_parent(arena, child) {
                if let Some(seg) = arena.segments.get_mut(child.0) {
                    seg.parent = Some((parent, confidence));
                }
                inferences.push(Inference {
                    child,
                    parent,
                    confidence,
                });
            }
        }
        inferences
    }

    /// Score a summarized window and attach parent links to its summaries
    ///
    /// Returns the number of summaries that received a parent.
    pub fn apply(&self, window: &CorrelationWindow, summaries: &mut [CorrelationSummary]) -> usize {
        let mut arena = SegmentArena::from_window(window);
        if arena.len() < 2 {
            return 0;
        }

        let inferences = self.infer_parents(&mut arena);
        let by_key: HashMap<&CorrelationKey, usize> = summaries
            .iter()
            .enumerate()
            .map(|(i, s)| (&s.primary_key, i))
            .collect::<HashMap<_, _>>();

        let mut links = Vec::new();
        for inference in &inferences {
            let (Some(child), Some(parent)) =
                (arena.get(inference.child), arena.get(inference.parent))
            else {
                continue;
            };
            if let Some(&index) = by_key.get(&child.key) {
                links.push((
                    index,
                    ParentLink {
                        correlation_id: parent.key.correlation_id(),
                        primary_key: parent.key.clone(),
                        confidence: inference.confidence,
                    },
                ));
            }
        }

        let applied = links.len();
        for (index, link) in links {
            debug!(
                child = %summaries[index].primary_key,
                parent = %link.primary_key,
                confidence = link.confidence,
                "Inferred parent"
            );
            summaries[index].parent = Some(link);
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{Normalizer, RawRecord};
    use chrono::{Duration, TimeZone};
    use serde_json::json;
    use telcorr_core::{KeyKind, RawLogRecord, RawSpan, ResourceContext};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn segment(trace: &str, start_ms: i64) -> Segment {
        Segment {
            key: CorrelationKey::trace(trace),
            start: t0() + Duration::milliseconds(start_ms),
            root_service: format!("{}-svc", trace),
            span_ids: BTreeSet::new(),
            dangling_parents: BTreeSet::new(),
            peer_services: BTreeSet::new(),
            business_keys: BTreeSet::new(),
            parent: None,
        }
    }

    fn order_key() -> CorrelationKey {
        CorrelationKey::new(KeyKind::ResourceId, "order-1")
    }

    /// Business weight 2, temporal 1, downstream 1
    fn threshold_scorer() -> TraceScorer {
        let weights = ScoringWeights {
            resource_id: 2.0,
            temporal: 1.0,
            downstream_service: 1.0,
            ..ScoringWeights::default()
        };
        TraceScorer::new(weights, 0.5, 10_000)
    }

    #[test]
    fn test_score_exactly_at_threshold_is_accepted() {
        let scorer = threshold_scorer();
        let mut arena = SegmentArena::default();

        let mut parent = segment("a", 0);
        parent.business_keys.insert(order_key());
        let parent_id = arena.push(parent);

        // Outside the lookback: only the shared key scores, 2 of a possible 4
        let mut child = segment("b", 20_000);
        child.business_keys.insert(order_key());
        let child_id = arena.push(child);

        let (chosen, score) = scorer.best_parent(&arena, child_id).unwrap();
        assert_eq!(chosen, parent_id);
        assert_eq!(score, 0.5);
    }

    #[test]
    fn test_score_below_threshold_leaves_unparented() {
        let scorer = threshold_scorer();
        let mut arena = SegmentArena::default();

        let mut parent = segment("a", 0);
        parent.peer_services.insert("b-svc".to_string());
        arena.push(parent);

        // Downstream bonus only: 1 of a possible 4
        let mut child = segment("b", 20_000);
        child.business_keys.insert(order_key());
        let child_id = arena.push(child);

        assert_eq!(scorer.best_parent(&arena, child_id), None);
        assert!(scorer.infer_parents(&mut arena).is_empty());
    }

    #[test]
    fn test_dangling_parent_span_links_segments() {
        let scorer = TraceScorer::from_settings(&CorrelationSettings::default());
        let mut arena = SegmentArena::default();

        let mut parent = segment("gateway", 0);
        parent.span_ids.insert("span-1".to_string());
        parent.peer_services.insert("orders-svc".to_string());
        let parent_id = arena.push(parent);

        let mut child = segment("orders", 2_000);
        child.dangling_parents.insert("span-1".to_string());
        let child_id = arena.push(child);

        // span 1.0 + temporal 0.5 * 0.8 + downstream 0.5 over a max of 2.0
        let (chosen, score) = scorer.best_parent(&arena, child_id).unwrap();
        assert_eq!(chosen, parent_id);
        assert!((score - 0.95).abs() < 1e-9);
    }

    #[test]
    fn test_tie_breaks_on_earliest_parent() {
        let scorer = threshold_scorer();
        let mut arena = SegmentArena::default();

        let mut later = segment("later", 5_000);
        later.business_keys.insert(order_key());
        arena.push(later);

        let mut earlier = segment("earlier", 1_000);
        earlier.business_keys.insert(order_key());
        let earlier_id = arena.push(earlier);

        let mut child = segment("child", 60_000);
        child.business_keys.insert(order_key());
        let child_id = arena.push(child);

        let (chosen, _) = scorer.best_parent(&arena, child_id).unwrap();
        assert_eq!(chosen, earlier_id);
    }

    #[test]
    fn test_parent_must_not_start_after_child() {
        let scorer = threshold_scorer();
        let mut arena = SegmentArena::default();

        let mut child = segment("child", 0);
        child.business_keys.insert(order_key());
        let child_id = arena.push(child);

        let mut later = segment("later", 1_000);
        later.business_keys.insert(order_key());
        arena.push(later);

        assert_eq!(scorer.best_parent(&arena, child_id), None);
    }

    #[test]
    fn test_no_cycles_between_simultaneous_segments() {
        let scorer = threshold_scorer();
        let mut arena = SegmentArena::default();

        for name in ["x", "y"] {
            let mut seg = segment(name, 0);
            seg.business_keys.insert(order_key());
            arena.push(seg);
        }

        let inferences = scorer.infer_parents(&mut arena);
        assert_eq!(inferences.len(), 1);
        let only = &inferences[0];
        let parent = arena.get(only.parent).unwrap();
        assert_eq!(parent.parent(), None);
    }

    #[test]
    fn test_timing_alone_never_makes_a_parent() {
        let scorer = TraceScorer::from_settings(&CorrelationSettings::default());
        let mut arena = SegmentArena::default();
        arena.push(segment("a", 0));
        let child_id = arena.push(segment("b", 0));

        let child = arena.get(child_id).unwrap();
        let candidate = arena.get(SegmentId(0)).unwrap();
        assert!(!scorer.shares_evidence(child, candidate));
        assert_eq!(scorer.normalized_score(child, candidate), None);
        assert_eq!(scorer.best_parent(&arena, child_id), None);
    }

    fn window() -> CorrelationWindow {
        CorrelationWindow::new(t0(), Duration::seconds(60), ScoringWeights::default())
    }

    fn normalizer() -> Normalizer {
        Normalizer::from_settings(&CorrelationSettings::default())
    }

    fn log_event(trace: &str, service: &str, at_ms: i64) -> Arc<NormalizedEvent> {
        let record = RawLogRecord {
            trace_id: Some(trace.to_string()),
            body: Some("processed".to_string()),
            ..Default::default()
        };
        let resource = ResourceContext::new(service, "host-a", "prod");
        Arc::new(normalizer().normalize(
            RawRecord::Log(&record),
            &resource,
            "logs#0",
            t0() + Duration::milliseconds(at_ms),
        ))
    }

    fn span_event(raw: RawSpan, service: &str, at_ms: i64) -> Arc<NormalizedEvent> {
        let resource = ResourceContext::new(service, "host-b", "prod");
        Arc::new(normalizer().normalize(
            RawRecord::Span(&raw),
            &resource,
            "spans#0",
            t0() + Duration::milliseconds(at_ms),
        ))
    }

    fn close(window: &mut CorrelationWindow) -> Vec<CorrelationSummary> {
        window.close_and_summarize(t0() + Duration::seconds(60)).unwrap()
    }

    fn summary_for<'a>(summaries: &'a [CorrelationSummary], trace: &str) -> &'a CorrelationSummary {
        summaries
            .iter()
            .find(|s| s.primary_key == CorrelationKey::trace(trace))
            .unwrap()
    }

    #[test]
    fn test_apply_leaves_unrelated_traces_unparented() {
        let mut window = window();
        window.add_event(log_event("trace-A", "billing", 0)).unwrap();
        window.add_event(log_event("trace-B", "inventory", 0)).unwrap();
        let mut summaries = close(&mut window);

        let scorer = TraceScorer::from_settings(&CorrelationSettings::default());
        assert_eq!(scorer.apply(&window, &mut summaries), 0);
        assert!(summaries.iter().all(|s| s.parent.is_none()));
    }

    #[test]
    fn test_apply_links_downstream_call() {
        let mut window = window();
        let checkout = RawSpan {
            trace_id: Some("trace-A".to_string()),
            span_id: Some("checkout-root".to_string()),
            name: "POST /checkout".to_string(),
            peer_service: Some("payment".to_string()),
            ..Default::default()
        };
        let charge = RawSpan {
            trace_id: Some("trace-B".to_string()),
            span_id: Some("charge-root".to_string()),
            name: "charge".to_string(),
            ..Default::default()
        };
        window.add_event(span_event(checkout, "checkout", 0)).unwrap();
        window.add_event(span_event(charge, "payment", 1_000)).unwrap();
        let mut summaries = close(&mut window);

        let scorer = TraceScorer::from_settings(&CorrelationSettings::default());
        assert_eq!(scorer.apply(&window, &mut summaries), 1);

        // temporal 0.5 * 0.9 + downstream 0.5 over a max of 1.0
        let link = summary_for(&summaries, "trace-B").parent.clone().unwrap();
        assert_eq!(link.primary_key, CorrelationKey::trace("trace-A"));
        assert!((link.confidence - 0.95).abs() < 1e-9);
        assert!(summary_for(&summaries, "trace-A").parent.is_none());
    }

    #[test]
    fn test_apply_links_traces_sharing_a_business_key() {
        let mut window = window();
        let mut attributes = std::collections::HashMap::new();
        attributes.insert("resource_id".to_string(), json!("order-7"));
        for (trace, service, at_ms) in [("trace-A", "orders", 0), ("trace-B", "shipping", 2_000)] {
            let raw = RawSpan {
                trace_id: Some(trace.to_string()),
                span_id: Some(format!("{}-root", service)),
                name: "handle".to_string(),
                attributes: attributes.clone(),
                ..Default::default()
            };
            window.add_event(span_event(raw, service, at_ms)).unwrap();
        }
        let mut summaries = close(&mut window);

        let scorer = TraceScorer::from_settings(&CorrelationSettings::default());
        assert_eq!(scorer.apply(&window, &mut summaries), 1);

        // resource 0.6 + temporal 0.5 * 0.8 over 0.6 + temporal 0.5 + downstream 0.5
        let link = summary_for(&summaries, "trace-B").parent.clone().unwrap();
        assert_eq!(link.primary_key, CorrelationKey::trace("trace-A"));
        assert!((link.confidence - 0.625).abs() < 1e-9);
    }
}

//! Sustain analyzer: rate reconstruction from completion spans
//!
//! Workers stream batched completion spans out of band; this analyzer
//! rebuilds the instantaneous aggregate IOPS over time and integrates how
//! long each rate level was sustained. Batches arrive out of order across
//! workers, so events are only committed up to the safe horizon: the
//! minimum of every worker's promised earliest future start time.

use super::Point;
use crate::engine::TraceMsg;
use crossbeam_channel::Receiver;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

/// Rate changes are processed Ends-before-Starts at equal timestamps to
/// avoid transient overshoot spikes when spans abut exactly; the variant
/// order encodes that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum EventKind {
    End,
    Start,
}

#[derive(Debug, Clone, Copy)]
struct Event {
    time: u64,
    kind: EventKind,
    /// IOPS contribution of the span (1e9 / duration_ns)
    rate: f64,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.kind == other.kind
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.time.cmp(&other.time).then(self.kind.cmp(&other.kind))
    }
}

/// Event-driven reconstruction of sustained IOPS levels
pub struct SustainAnalyzer {
    rx: Receiver<TraceMsg>,
    expected_workers: usize,
    worker_min_starts: HashMap<usize, u64>,

    events: BinaryHeap<Reverse<Event>>,
    current_rate: f64,
    /// Timestamp of the last committed event; seeded from the first one so
    /// the leading idle interval is not credited to the zero bin.
    last_time: Option<u64>,

    /// IOPS level -> nanoseconds spent at that level
    histogram: HashMap<u64, u64>,
}

impl SustainAnalyzer {
    pub fn new(rx: Receiver<TraceMsg>, expected_workers: usize) -> Self {
        Self {
            rx,
            expected_workers,
            worker_min_starts: HashMap::new(),
            events: BinaryHeap::new(),
            current_rate: 0.0,
            last_time: None,
            histogram: HashMap::new(),
        }
    }

    /// Consume trace messages until the channel closes, then drain the
    /// event queue.
    pub fn run(&mut self) {
        while let Ok(msg) = self.rx.recv() {
            self.ingest(msg);
        }
        self.finish();
    }

    /// Fold one trace batch in and process whatever became safe
    pub fn ingest(&mut self, msg: TraceMsg) {
        self.worker_min_starts.insert(msg.worker_id, msg.min_start_ns);

        for span in &msg.spans {
            if span.end_ns <= span.start_ns {
                continue;
            }
            let rate = 1e9 / (span.end_ns - span.start_ns) as f64;
            self.events.push(Reverse(Event {
                time: span.start_ns,
                kind: EventKind::Start,
                rate,
            }));
            self.events.push(Reverse(Event {
                time: span.end_ns,
                kind: EventKind::End,
                rate,
            }));
        }

        // A worker that has not reported yet may still produce arbitrarily
        // early spans; no horizon exists until everyone has promised one.
        if self.worker_min_starts.len() < self.expected_workers {
            return;
        }

        let horizon = self
            .worker_min_starts
            .values()
            .copied()
            .min()
            .unwrap_or(u64::MAX);
        self.process_until(horizon);
    }

    /// Drain all remaining events (call after the producers are done)
    pub fn finish(&mut self) {
        self.process_until(u64::MAX);
    }

    fn process_until(&mut self, limit: u64) {
        while let Some(Reverse(event)) = self.events.peek().copied() {
            if event.time > limit {
                break;
            }
            self.events.pop();

            match self.last_time {
                None => self.last_time = Some(event.time),
                Some(last) if event.time > last => {
                    let bin = self.current_rate.round() as u64;
                    *self.histogram.entry(bin).or_insert(0) += event.time - last;
                    self.last_time = Some(event.time);
                }
                _ => {}
            }

            match event.kind {
                EventKind::Start => self.current_rate += event.rate,
                EventKind::End => self.current_rate -= event.rate,
            }
            // Absorb floating point drift near zero.
            if self.current_rate < 1e-3 {
                self.current_rate = 0.0;
            }
        }
    }

    /// Nanoseconds spent at each integrated IOPS level
    pub fn histogram(&self) -> &HashMap<u64, u64> {
        &self.histogram
    }

    /// The stability curve: X = cumulative seconds, Y = IOPS level, meaning
    /// "we sustained at least Y IOPS for X seconds" (the inverse CDF of the
    /// rate distribution).
    pub fn profile(&self) -> Vec<Point> {
        let mut bins: Vec<u64> = self.histogram.keys().copied().collect();
        bins.sort_unstable_by(|a, b| b.cmp(a));

        let mut points = Vec::with_capacity(bins.len());
        let mut accumulated_ns = 0u64;
        for bin in bins {
            accumulated_ns += self.histogram[&bin];
            points.push(Point {
                x: accumulated_ns as f64 / 1e9,
                y: bin as f64,
            });
        }
        points
    }
}

/// Downsample a profile to a time resolution, averaging Y within each bin
pub fn downsample(points: &[Point], resolution: Duration) -> Vec<Point> {
    let res_sec = resolution.as_secs_f64();
    if res_sec <= 0.0 || points.is_empty() {
        return points.to_vec();
    }

    let mut result = Vec::new();
    let mut current_bin: i64 = -1;
    let mut sum_y = 0.0;
    let mut count = 0usize;

    for p in points {
        let bin = (p.x / res_sec) as i64;
        if bin != current_bin {
            if count > 0 {
                result.push(Point {
                    x: (current_bin + 1) as f64 * res_sec,
                    y: sum_y / count as f64,
                });
            }
            current_bin = bin;
            sum_y = 0.0;
            count = 0;
        }
        sum_y += p.y;
        count += 1;
    }

    if count > 0 {
        result.push(Point {
            x: (current_bin + 1) as f64 * res_sec,
            y: sum_y / count as f64,
        });
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Span, TraceMsg, FRONTIER_DRAINED};
    use crossbeam_channel::unbounded;

    fn msg(worker_id: usize, spans: &[(u64, u64)], min_start_ns: u64) -> TraceMsg {
        TraceMsg {
            worker_id,
            spans: spans
                .iter()
                .map(|&(start_ns, end_ns)| Span { start_ns, end_ns })
                .collect(),
            min_start_ns,
        }
    }

    fn analyzer(expected: usize) -> SustainAnalyzer {
        let (_tx, rx) = unbounded();
        SustainAnalyzer::new(rx, expected)
    }

    #[test]
    fn test_two_overlapping_workers() {
        let mut a = analyzer(2);
        // Both spans run at rate 10; they overlap in [5e7, 1e8].
        a.ingest(msg(0, &[(0, 100_000_000)], FRONTIER_DRAINED));
        a.ingest(msg(1, &[(50_000_000, 150_000_000)], FRONTIER_DRAINED));
        a.finish();

        let hist = a.histogram();
        assert_eq!(hist.get(&20), Some(&50_000_000));
        assert_eq!(hist.get(&10), Some(&100_000_000));

        let profile = a.profile();
        assert!(profile.windows(2).all(|w| w[0].y > w[1].y));
        assert!(profile.windows(2).all(|w| w[0].x < w[1].x));
        assert_eq!(profile[0], Point { x: 0.05, y: 20.0 });
        assert_eq!(profile[1], Point { x: 0.15, y: 10.0 });
    }

    #[test]
    fn test_first_event_seeds_clock() {
        let mut a = analyzer(1);
        // Activity starts a full second in; the leading idle gap must not
        // land in the zero bin.
        a.ingest(msg(0, &[(1_000_000_000, 1_100_000_000)], FRONTIER_DRAINED));
        a.finish();

        let hist = a.histogram();
        assert!(!hist.contains_key(&0));
        assert_eq!(hist.get(&10), Some(&100_000_000));
    }

    #[test]
    fn test_abutting_spans_do_not_spike() {
        let mut a = analyzer(1);
        // Back-to-back spans at rate 1: the shared timestamp must process
        // the End before the Start, so rate 2 never appears.
        a.ingest(msg(
            0,
            &[(0, 1_000_000_000), (1_000_000_000, 2_000_000_000)],
            FRONTIER_DRAINED,
        ));
        a.finish();

        let hist = a.histogram();
        assert_eq!(hist.get(&1), Some(&2_000_000_000));
        assert!(!hist.contains_key(&2));
    }

    #[test]
    fn test_holds_events_until_all_workers_report() {
        let mut a = analyzer(2);
        a.ingest(msg(0, &[(0, 10_000_000)], 20_000_000));
        // Worker 1 has not reported: nothing may be committed yet.
        assert!(a.histogram().is_empty());

        a.ingest(msg(1, &[(5_000_000, 15_000_000)], 20_000_000));
        // Both promised starts >= 2e7, so everything up to there is safe.
        assert!(!a.histogram().is_empty());
    }

    #[test]
    fn test_horizon_is_minimum_across_workers() {
        let mut a = analyzer(2);
        a.ingest(msg(0, &[(0, 10_000_000)], 4_000_000));
        a.ingest(msg(1, &[(0, 20_000_000)], 6_000_000));

        // Horizon is 4e6: both Start events commit, neither End does, and
        // integration has only advanced to the horizon events seen so far.
        let committed: u64 = a.histogram().values().sum();
        assert!(committed <= 4_000_000);

        a.finish();
        let total: u64 = a.histogram().values().sum();
        assert_eq!(total, 20_000_000);
    }

    #[test]
    fn test_run_consumes_channel() {
        let (tx, rx) = unbounded();
        let mut a = SustainAnalyzer::new(rx, 1);
        tx.send(msg(0, &[(0, 1_000_000)], FRONTIER_DRAINED)).unwrap();
        drop(tx);
        a.run();
        assert_eq!(a.histogram().get(&1000), Some(&1_000_000));
    }

    #[test]
    fn test_zero_length_spans_ignored() {
        let mut a = analyzer(1);
        a.ingest(msg(0, &[(5, 5), (10, 4)], FRONTIER_DRAINED));
        a.finish();
        assert!(a.histogram().is_empty());
    }

    #[test]
    fn test_downsample_averages_within_bins() {
        let points = vec![
            Point { x: 0.1, y: 100.0 },
            Point { x: 0.4, y: 200.0 },
            Point { x: 1.2, y: 50.0 },
            Point { x: 1.8, y: 70.0 },
            Point { x: 2.5, y: 10.0 },
        ];
        let out = downsample(&points, Duration::from_secs(1));
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], Point { x: 1.0, y: 150.0 });
        assert_eq!(out[1], Point { x: 2.0, y: 60.0 });
        assert_eq!(out[2], Point { x: 3.0, y: 10.0 });
    }

    #[test]
    fn test_downsample_zero_resolution_passthrough() {
        let points = vec![Point { x: 0.5, y: 1.0 }];
        assert_eq!(downsample(&points, Duration::ZERO), points);
    }
}

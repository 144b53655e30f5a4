//! Per-kernel timing collection.
//!
//! The drivers hand every enqueue's event to the profiler unconditionally;
//! the disabled variant drops them without any bookkeeping. On teardown
//! the enabled profiler aggregates spans into per-name totals and pairs
//! concurrent start/end instants to subtract double-counted time, giving
//! an overlap-adjusted wall figure for the whole run.

use crate::device::event::Event;
use crate::error::Error;
use crate::error::Result;
use std::collections::BTreeMap;
use std::io::Write;

/// Aggregate figures for one event name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Aggregate {
    pub count: usize,
    pub total_ns: u64,
}

/// Result of a profiling analysis.
#[derive(Debug, Default)]
pub struct ProfileReport {
    /// Per-name totals, sorted by descending total time.
    pub aggregates: Vec<(String, Aggregate)>,
    /// Sum of all event durations.
    pub total_ns: u64,
    /// Time counted more than once because events overlapped.
    pub overlap_ns: u64,
    /// Pairwise overlap between event names.
    pub overmat: BTreeMap<(String, String), u64>,
}

impl ProfileReport {
    /// Total with pairwise-overlapped time subtracted.
    pub fn effective_ns(&self) -> u64 {
        self.total_ns.saturating_sub(self.overlap_ns)
    }
}

pub enum Profiler {
    Off,
    On { events: Vec<Event> },
}

impl Profiler {
    pub fn new(enabled: bool) -> Self {
        if enabled {
            Profiler::On { events: Vec::new() }
        } else {
            Profiler::Off
        }
    }

    pub fn enabled(&self) -> bool {
        matches!(self, Profiler::On { .. })
    }

    /// Record an event for later analysis. A no-op when disabled.
    pub fn track(&mut self, event: &Event) {
        if let Profiler::On { events } = self {
            events.push(event.clone());
        }
    }

    /// Aggregate all tracked events. Every event must have completed.
    pub fn analyze(&self) -> Result<ProfileReport> {
        let Profiler::On { events } = self else {
            return Ok(ProfileReport::default());
        };
        let mut spans = Vec::with_capacity(events.len());
        for event in events {
            let (start, end) = event.span().ok_or_else(|| {
                Error::Library(format!("profiling incomplete event '{}'", event.name()))
            })?;
            spans.push((event.name().to_string(), start, end));
        }

        let mut totals: BTreeMap<String, Aggregate> = BTreeMap::new();
        for (name, start, end) in &spans {
            let agg = totals.entry(name.clone()).or_default();
            agg.count += 1;
            agg.total_ns += end - start;
        }
        let total_ns = totals.values().map(|a| a.total_ns).sum();

        // Sweep all instants in time order, keeping the set of running
        // spans. When a span ends, each still-running span shares the
        // interval from the later of the two starts to this end; each pair
        // is charged exactly once, at the first of its two ends.
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
        enum Edge {
            End,
            Start,
        }
        let mut instants = Vec::with_capacity(spans.len() * 2);
        for (id, (_, start, end)) in spans.iter().enumerate() {
            if start < end {
                instants.push((*start, Edge::Start, id));
                instants.push((*end, Edge::End, id));
            }
        }
        // Ends sort before starts at the same instant so touching spans
        // do not count as overlapping.
        instants.sort();

        let mut running: Vec<(usize, u64)> = Vec::new();
        let mut overmat: BTreeMap<(String, String), u64> = BTreeMap::new();
        let mut overlap_ns = 0u64;
        for (instant, edge, id) in instants {
            match edge {
                Edge::Start => running.push((id, instant)),
                Edge::End => {
                    running.retain(|(other, _)| *other != id);
                    let own_start = spans[id].1;
                    for (other, other_start) in &running {
                        let length = instant - own_start.max(*other_start);
                        if length == 0 {
                            continue;
                        }
                        let mut pair = [spans[id].0.clone(), spans[*other].0.clone()];
                        pair.sort();
                        let [a, b] = pair;
                        *overmat.entry((a, b)).or_default() += length;
                        overlap_ns += length;
                    }
                }
            }
        }

        let mut aggregates = totals.into_iter().collect::<Vec<_>>();
        aggregates.sort_by(|a, b| b.1.total_ns.cmp(&a.1.total_ns));
        Ok(ProfileReport {
            aggregates,
            total_ns,
            overlap_ns,
            overmat,
        })
    }

    /// Export the aggregate table, one `name count total_ns` row per
    /// event name.
    pub fn export_aggregates(&self, path: &str) -> Result<()> {
        let report = self.analyze()?;
        let mut file = std::fs::File::create(path)
            .map_err(|e| Error::Library(format!("unable to open file \"{}\": {}", path, e)))?;
        for (name, agg) in &report.aggregates {
            writeln!(file, "{}\t{}\t{}", name, agg.count, agg.total_ns)
                .map_err(|e| Error::Library(format!("writing \"{}\": {}", path, e)))?;
        }
        Ok(())
    }

    /// Log the profiling summary.
    pub fn print_summary(&self) -> Result<()> {
        let report = self.analyze()?;
        if report.aggregates.is_empty() {
            return Ok(());
        }
        log::info!(
            "profiling: {} event names, total {:.4}ms, effective {:.4}ms ({:.4}ms overlapped)",
            report.aggregates.len(),
            report.total_ns as f64 / 1e6,
            report.effective_ns() as f64 / 1e6,
            report.overlap_ns as f64 / 1e6,
        );
        for (name, agg) in &report.aggregates {
            log::info!(
                "  {:<24} x{:<6} {:.4}ms",
                name,
                agg.count,
                agg.total_ns as f64 / 1e6
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span_event(name: &str, start: u64, end: u64) -> Event {
        // Fabricate an event with a known span by completing it and
        // rewriting its instants through the test-only hook.
        let evt = Event::new(name);
        evt.begin();
        evt.complete();
        evt.force_span(start, end);
        evt
    }

    #[test]
    fn disabled_profiler_tracks_nothing() {
        let mut profiler = Profiler::new(false);
        let evt = Event::new("K: x");
        evt.begin();
        evt.complete();
        profiler.track(&evt);
        let report = profiler.analyze().unwrap();
        assert!(report.aggregates.is_empty());
        assert_eq!(report.total_ns, 0);
    }

    #[test]
    fn aggregates_sum_per_name() {
        let mut profiler = Profiler::new(true);
        profiler.track(&span_event("K: a", 0, 10));
        profiler.track(&span_event("K: a", 20, 50));
        profiler.track(&span_event("K: b", 100, 130));
        let report = profiler.analyze().unwrap();
        assert_eq!(report.total_ns, 70);
        assert_eq!(report.overlap_ns, 0);
        let a = report
            .aggregates
            .iter()
            .find(|(n, _)| n == "K: a")
            .unwrap();
        assert_eq!(a.1, Aggregate { count: 2, total_ns: 40 });
    }

    #[test]
    fn overlapping_spans_are_subtracted_once() {
        let mut profiler = Profiler::new(true);
        profiler.track(&span_event("K: a", 0, 100));
        profiler.track(&span_event("K: b", 40, 140));
        let report = profiler.analyze().unwrap();
        assert_eq!(report.total_ns, 200);
        assert_eq!(report.overlap_ns, 60);
        assert_eq!(report.effective_ns(), 140);
        assert_eq!(
            report.overmat[&("K: a".to_string(), "K: b".to_string())],
            60
        );
    }

    #[test]
    fn nested_and_chained_overlaps() {
        let mut profiler = Profiler::new(true);
        profiler.track(&span_event("K: a", 0, 100));
        profiler.track(&span_event("K: b", 10, 30));
        profiler.track(&span_event("K: c", 20, 120));
        let report = profiler.analyze().unwrap();
        // a/b overlap 20, b/c overlap 10, a/c overlap 80.
        assert_eq!(report.overlap_ns, 110);
        assert_eq!(
            report.overmat[&("K: a".to_string(), "K: c".to_string())],
            80
        );
    }

    #[test]
    fn touching_spans_do_not_overlap() {
        let mut profiler = Profiler::new(true);
        profiler.track(&span_event("K: a", 0, 50));
        profiler.track(&span_event("K: b", 50, 100));
        let report = profiler.analyze().unwrap();
        assert_eq!(report.overlap_ns, 0);
    }
}

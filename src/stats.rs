//! Real-time stat aggregation (C6): a bounded ring of per-interval values
//! per named tracker, with sum-vs-average aggregation mode settled by
//! whichever sample arrives first and reference counting down to cleanup.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::{CoreError, CoreResult};
use crate::wire::message::StatType;

/// Aggregation mode, locked in by the first sample a series ever receives
/// (§4.6: "sum vs. average aggregation... locked on first update").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationMode {
    Sum,
    Average,
}

/// One named stat's bounded time series. `maxIntervals` bounds memory use
/// under a job that runs far longer than any client expects the collector
/// to actually hold history for.
#[derive(Debug)]
pub struct StatSeries {
    max_intervals: usize,
    mode: Option<AggregationMode>,
    /// Interval number of `values[0]`. `None` until the first sample.
    first_interval: Option<i64>,
    values: Vec<f64>,
    counts: Vec<u32>,
    refs: u32,
}

impl StatSeries {
    pub fn new(max_intervals: usize) -> Self {
        Self {
            max_intervals,
            mode: None,
            first_interval: None,
            values: Vec::new(),
            counts: Vec::new(),
            refs: 1,
        }
    }

    pub fn add_ref(&mut self) {
        self.refs += 1;
    }

    /// Returns the post-decrement count; the caller removes the series from
    /// the store once this reaches zero.
    pub fn release(&mut self) -> u32 {
        self.refs = self.refs.saturating_sub(1);
        self.refs
    }

    pub fn first_interval(&self) -> Option<i64> {
        self.first_interval
    }

    /// The current window, oldest first. `AggregationMode::Average` values
    /// are already divided by their sample count.
    pub fn values(&self) -> Vec<f64> {
        match self.mode {
            Some(AggregationMode::Average) => self
                .values
                .iter()
                .zip(&self.counts)
                .map(|(sum, count)| if *count == 0 { 0.0 } else { sum / *count as f64 })
                .collect(),
            _ => self.values.clone(),
        }
    }

    /// The interval number of the newest slot currently held, if any.
    fn last_interval(&self) -> Option<i64> {
        self.first_interval
            .map(|first| first + self.values.len() as i64 - 1)
    }

    /// Applies one ADD/AVERAGE sample. DONE samples never reach this method
    /// — §4.6 requires a DONE to decrement the series' reference count and
    /// remove it at zero, which `JobStats::record` handles before a series
    /// is even looked up (see below).
    ///
    /// Ring invariant (§3, §8 property 6): an interval less than
    /// `firstInterval` is silently discarded; one greater than
    /// `lastInterval + 1` is silently discarded; `lastInterval + 1`
    /// advances the window, evicting the oldest slot once it is full;
    /// anything in between updates the corresponding slot in place.
    pub fn record(&mut self, stat_type: StatType, interval: Option<i64>, value: f64) -> CoreResult<()> {
        let interval = interval
            .ok_or_else(|| CoreError::Protocol("ADD/AVERAGE sample missing interval".into()))?;

        let mode = match stat_type {
            StatType::Add => AggregationMode::Sum,
            StatType::Average => AggregationMode::Average,
            StatType::Done => unreachable!(),
        };
        match self.mode {
            None => self.mode = Some(mode),
            Some(existing) if existing != mode => {
                return Err(CoreError::Protocol(format!(
                    "stat series locked to {existing:?}, got {mode:?}"
                )))
            }
            _ => {}
        }

        let first = match self.first_interval {
            None => {
                self.first_interval = Some(interval);
                self.values.push(value);
                self.counts.push(1);
                return Ok(());
            }
            Some(first) => first,
        };
        let last = self.last_interval().unwrap();

        if interval < first {
            // Stale: older than the window's start. Dropped per §4.6.
            return Ok(());
        }
        if interval > last + 1 {
            // Too far ahead of the window to be contiguous. Dropped.
            return Ok(());
        }

        if interval == last + 1 {
            if self.values.len() >= self.max_intervals {
                self.values.remove(0);
                self.counts.remove(0);
                self.first_interval = Some(first + 1);
            }
            self.values.push(value);
            self.counts.push(1);
            return Ok(());
        }

        // Within [first, last]: update the existing slot in place.
        let idx = (interval - first) as usize;
        self.values[idx] += value;
        self.counts[idx] += 1;
        Ok(())
    }
}

/// All stat series registered for one job, keyed by tracker name.
#[derive(Debug, Default)]
pub struct JobStats {
    series: HashMap<String, StatSeries>,
}

impl JobStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, max_intervals: usize) {
        self.series
            .entry(name.to_string())
            .and_modify(StatSeries::add_ref)
            .or_insert_with(|| StatSeries::new(max_intervals));
    }

    pub fn unregister(&mut self, name: &str) {
        let remove = match self.series.get_mut(name) {
            Some(series) => series.release() == 0,
            None => return,
        };
        if remove {
            self.series.remove(name);
        }
    }

    /// §4.6: a DONE sample carries no value — it "decrements the series
    /// reference count; if zero, remove the series" — rather than being
    /// recorded into the series itself.
    pub fn record(
        &mut self,
        name: &str,
        stat_type: StatType,
        interval: Option<i64>,
        value: f64,
    ) -> CoreResult<()> {
        if !self.series.contains_key(name) {
            return Err(CoreError::Protocol(format!("stat '{name}' was never registered")));
        }
        if stat_type == StatType::Done {
            self.unregister(name);
            return Ok(());
        }
        self.series.get_mut(name).unwrap().record(stat_type, interval, value)
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn stat_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.series.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn first_interval(&self, name: &str) -> Option<i64> {
        self.series.get(name).and_then(StatSeries::first_interval)
    }

    pub fn values(&self, name: &str) -> Option<Vec<f64>> {
        self.series.get(name).map(StatSeries::values)
    }
}

/// All jobs' stats, shared read-mostly across stat-client connections that
/// poll and load-client connections that report (§4.6 locking rule: a
/// single writer lock guards updates, readers never block a reporter for
/// long).
#[derive(Debug, Default)]
pub struct StatStore {
    jobs: RwLock<HashMap<String, JobStats>>,
}

impl StatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job_id: &str, stat_names: &[String], max_intervals: usize) {
        let mut jobs = self.jobs.write();
        let entry = jobs.entry(job_id.to_string()).or_default();
        for name in stat_names {
            entry.register(name, max_intervals);
        }
    }

    /// §4.6: a DONE sample decrements the named series' reference count,
    /// removing the series at zero; once a `JobStats` has no series left
    /// it is removed from the store entirely.
    pub fn report(
        &self,
        job_id: &str,
        name: &str,
        stat_type: StatType,
        interval: Option<i64>,
        value: f64,
    ) -> CoreResult<()> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| CoreError::Protocol(format!("no such job '{job_id}'")))?;
        job.record(name, stat_type, interval, value)?;
        if job.is_empty() {
            jobs.remove(job_id);
        }
        Ok(())
    }

    pub fn stat_names(&self, job_id: &str) -> Vec<String> {
        self.jobs
            .read()
            .get(job_id)
            .map(JobStats::stat_names)
            .unwrap_or_default()
    }

    pub fn first_interval(&self, job_id: &str, name: &str) -> Option<i64> {
        self.jobs.read().get(job_id).and_then(|j| j.first_interval(name))
    }

    pub fn values(&self, job_id: &str, name: &str) -> Option<Vec<f64>> {
        self.jobs.read().get(job_id).and_then(|j| j.values(name))
    }

    pub fn drop_job(&self, job_id: &str) {
        self.jobs.write().remove(job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_mode_accumulates_across_reports() {
        let mut series = StatSeries::new(10);
        series.record(StatType::Add, Some(1), 2.0).unwrap();
        series.record(StatType::Add, Some(1), 3.0).unwrap();
        series.record(StatType::Add, Some(2), 1.0).unwrap();
        assert_eq!(series.values(), vec![5.0, 1.0]);
    }

    #[test]
    fn average_mode_divides_by_sample_count() {
        let mut series = StatSeries::new(10);
        series.record(StatType::Average, Some(1), 4.0).unwrap();
        series.record(StatType::Average, Some(1), 8.0).unwrap();
        assert_eq!(series.values(), vec![6.0]);
    }

    #[test]
    fn mixing_sum_and_average_is_a_protocol_error() {
        let mut series = StatSeries::new(10);
        series.record(StatType::Add, Some(1), 1.0).unwrap();
        assert!(series.record(StatType::Average, Some(2), 1.0).is_err());
    }

    #[test]
    fn ring_evicts_oldest_interval_on_overflow() {
        let mut series = StatSeries::new(3);
        for i in 0..5 {
            series.record(StatType::Add, Some(i), i as f64).unwrap();
        }
        assert_eq!(series.first_interval(), Some(2));
        assert_eq!(series.values(), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn stale_interval_before_window_start_is_dropped() {
        let mut series = StatSeries::new(10);
        series.record(StatType::Add, Some(5), 1.0).unwrap();
        series.record(StatType::Add, Some(1), 99.0).unwrap();
        assert_eq!(series.first_interval(), Some(5));
        assert_eq!(series.values(), vec![1.0]);
    }

    #[test]
    fn done_sample_decrements_refcount_and_removes_series_at_zero() {
        let mut stats = JobStats::new();
        stats.register("searches", 10);
        stats.record("searches", StatType::Add, Some(1), 1.0).unwrap();

        stats.record("searches", StatType::Done, None, 0.0).unwrap();
        assert!(!stats.stat_names().contains(&"searches".to_string()));
    }

    #[test]
    fn done_sample_only_removes_series_once_every_reporter_is_done() {
        let mut stats = JobStats::new();
        stats.register("searches", 10);
        stats.register("searches", 10); // second stat client joins

        stats.record("searches", StatType::Done, None, 0.0).unwrap();
        assert!(stats.stat_names().contains(&"searches".to_string()), "one reporter is still live");

        stats.record("searches", StatType::Done, None, 0.0).unwrap();
        assert!(!stats.stat_names().contains(&"searches".to_string()));
    }

    #[test]
    fn last_series_done_removes_the_job_from_the_store() {
        let store = StatStore::new();
        store.register("job-1", &["searches".to_string()], 10);
        store
            .report("job-1", "searches", StatType::Add, Some(1), 1.0)
            .unwrap();

        store.report("job-1", "searches", StatType::Done, None, 0.0).unwrap();

        assert!(store.stat_names("job-1").is_empty());
    }

    #[test]
    fn reference_counting_removes_series_only_at_zero() {
        let mut stats = JobStats::new();
        stats.register("searches", 10);
        stats.register("searches", 10); // second stat client joins
        stats.unregister("searches");
        assert!(stats.stat_names().contains(&"searches".to_string()));
        stats.unregister("searches");
        assert!(!stats.stat_names().contains(&"searches".to_string()));
    }

    #[test]
    fn reporting_to_unregistered_stat_is_an_error() {
        let mut stats = JobStats::new();
        assert!(stats.record("searches", StatType::Add, Some(1), 1.0).is_err());
    }

    #[test]
    fn done_on_unregistered_stat_is_an_error() {
        let mut stats = JobStats::new();
        assert!(stats.record("searches", StatType::Done, None, 0.0).is_err());
    }
}

//! Sequential, named row exclusions with an audit report.
//!
//! Every exclusion of expected data-quality noise goes through [`apply_filters`]
//! so that nothing is dropped without a matching [`FilterStepStats`] entry.
//! Rows are identified by their position in the dataset handed to the filter
//! run, never by value.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Statistics for one filter step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterStepStats {
    /// Pipeline stage the filter ran in (e.g. "Pre-processing").
    pub stage: String,
    /// Dataset the filter ran against (e.g. "payments").
    pub dataset: String,
    /// 1-based position of the step within its filter run.
    pub step: usize,
    /// Human readable filter name.
    pub bad_data: String,
    /// Rows excluded by this filter as a fraction of the unfiltered dataset.
    pub pct_of_unfiltered: f64,
    /// Rows surviving all prior steps of the run.
    pub rows_applied_to: usize,
    /// Fraction of `rows_applied_to` removed at this step.
    pub pct_filtered_at_step: f64,
}

/// Append-only audit trail of filter steps, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterReport {
    steps: Vec<FilterStepStats>,
}

impl FilterReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn steps(&self) -> &[FilterStepStats] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, bad_data: &str) -> Option<&FilterStepStats> {
        self.steps.iter().find(|s| s.bad_data == bad_data)
    }

    pub fn push(&mut self, stats: FilterStepStats) {
        self.steps.push(stats);
    }

    pub fn append(&mut self, other: FilterReport) {
        self.steps.extend(other.steps);
    }

    /// Stamps every step with the given stage and dataset labels.
    pub fn labeled(mut self, stage: &str, dataset: &str) -> Self {
        for step in &mut self.steps {
            step.stage = stage.to_string();
            step.dataset = dataset.to_string();
        }
        self
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.steps)
    }
}

/// Removes, in order, each named set of excluded row positions from `data`.
///
/// Surviving rows keep their original order. An exclusion set matching no
/// surviving rows is reported with 0% filtered.
pub fn apply_filters<T>(
    filters: Vec<(String, BTreeSet<usize>)>,
    data: Vec<T>,
) -> (Vec<T>, FilterReport) {
    let original_len = data.len();
    let mut keep = vec![true; original_len];
    let mut remaining = original_len;
    let mut report = FilterReport::new();

    for (idx, (name, excluded)) in filters.into_iter().enumerate() {
        let rows_applied_to = remaining;
        let mut excluded_in_range = 0;

        for &row in excluded.range(..original_len) {
            excluded_in_range += 1;
            if keep[row] {
                keep[row] = false;
                remaining -= 1;
            }
        }

        let stats = FilterStepStats {
            stage: String::new(),
            dataset: String::new(),
            step: idx + 1,
            bad_data: name,
            pct_of_unfiltered: fraction(excluded_in_range, original_len),
            rows_applied_to,
            pct_filtered_at_step: fraction(rows_applied_to - remaining, rows_applied_to),
        };

        debug!(
            "Filter step {} '{}': {} of {} rows removed ({:.2}% at step, {:.2}% of unfiltered)",
            stats.step,
            stats.bad_data,
            rows_applied_to - remaining,
            rows_applied_to,
            stats.pct_filtered_at_step * 100.0,
            stats.pct_of_unfiltered * 100.0
        );

        report.push(stats);
    }

    let filtered = data
        .into_iter()
        .zip(keep)
        .filter_map(|(row, kept)| kept.then_some(row))
        .collect();

    (filtered, report)
}

fn fraction(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

enum Exclusion<'a, T> {
    Predicate(Box<dyn Fn(&T) -> bool + 'a>),
    Rows(BTreeSet<usize>),
}

/// Ordered list of labelled exclusions, evaluated against the full input and
/// applied sequentially through [`apply_filters`].
pub struct FilterSet<'a, T> {
    stage: String,
    dataset: String,
    exclusions: Vec<(String, Exclusion<'a, T>)>,
}

impl<'a, T> FilterSet<'a, T> {
    pub fn new(stage: &str, dataset: &str) -> Self {
        Self {
            stage: stage.to_string(),
            dataset: dataset.to_string(),
            exclusions: Vec::new(),
        }
    }

    /// Excludes every row for which `predicate` returns true.
    pub fn exclude<F>(mut self, name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + 'a,
    {
        self.exclusions
            .push((name.into(), Exclusion::Predicate(Box::new(predicate))));
        self
    }

    /// Excludes rows by position, for exclusions that depend on neighbouring rows.
    pub fn exclude_rows(mut self, name: impl Into<String>, rows: BTreeSet<usize>) -> Self {
        self.exclusions.push((name.into(), Exclusion::Rows(rows)));
        self
    }

    pub fn apply(self, data: Vec<T>) -> (Vec<T>, FilterReport) {
        let resolved = self
            .exclusions
            .into_iter()
            .map(|(name, exclusion)| {
                let rows = match exclusion {
                    Exclusion::Predicate(predicate) => data
                        .iter()
                        .enumerate()
                        .filter(|(_, row)| predicate(row))
                        .map(|(idx, _)| idx)
                        .collect(),
                    Exclusion::Rows(rows) => rows,
                };
                (name, rows)
            })
            .collect();

        let (filtered, report) = apply_filters(resolved, data);
        (filtered, report.labeled(&self.stage, &self.dataset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(set: &[usize]) -> BTreeSet<usize> {
        set.iter().copied().collect()
    }

    #[test]
    fn test_no_filters_is_a_no_op() {
        let data = vec![10, 20, 30];
        let (filtered, report) = apply_filters(Vec::new(), data.clone());

        assert_eq!(filtered, data);
        assert!(report.is_empty());
    }

    #[test]
    fn test_filter_matching_everything() {
        let data = vec!["a", "b", "c", "d"];
        let (filtered, report) =
            apply_filters(vec![("All".to_string(), rows(&[0, 1, 2, 3]))], data);

        assert!(filtered.is_empty());
        let step = report.step("All").unwrap();
        assert_eq!(step.pct_of_unfiltered, 1.0);
        assert_eq!(step.pct_filtered_at_step, 1.0);
        assert_eq!(step.rows_applied_to, 4);
    }

    #[test]
    fn test_sequential_percentages() {
        let data: Vec<usize> = (0..10).collect();
        let filters = vec![
            ("First".to_string(), rows(&[0, 1, 2, 3, 4])),
            // rows 3 and 4 were already removed by the first step
            ("Second".to_string(), rows(&[3, 4, 5, 6, 7])),
            ("Nothing".to_string(), BTreeSet::new()),
        ];

        let (filtered, report) = apply_filters(filters, data);

        assert_eq!(filtered, vec![8, 9]);
        assert_eq!(report.len(), 3);

        let first = &report.steps()[0];
        assert_eq!(first.step, 1);
        assert_eq!(first.rows_applied_to, 10);
        assert!((first.pct_of_unfiltered - 0.5).abs() < 1e-12);
        assert!((first.pct_filtered_at_step - 0.5).abs() < 1e-12);

        let second = &report.steps()[1];
        assert_eq!(second.rows_applied_to, 5);
        assert!((second.pct_of_unfiltered - 0.5).abs() < 1e-12);
        assert!((second.pct_filtered_at_step - 0.6).abs() < 1e-12);

        let nothing = &report.steps()[2];
        assert_eq!(nothing.rows_applied_to, 2);
        assert_eq!(nothing.pct_of_unfiltered, 0.0);
        assert_eq!(nothing.pct_filtered_at_step, 0.0);
    }

    #[test]
    fn test_filters_are_idempotent() {
        let data = vec![1, 2, 3, 4, 5];
        let filters = || vec![("Odd".to_string(), rows(&[0, 2, 4]))];

        let first = apply_filters(filters(), data.clone());
        let second = apply_filters(filters(), data);
        assert_eq!(first, second);
    }

    #[test]
    fn test_filter_set_labels_report() {
        let data = vec![-2, 5, 0, 7, -1];
        let (filtered, report) = FilterSet::new("Filtering", "numbers")
            .exclude("Negative", |v: &i32| *v < 0)
            .exclude("Zero", |v: &i32| *v == 0)
            .exclude_rows("Last", rows(&[4]))
            .apply(data);

        assert_eq!(filtered, vec![5, 7]);
        assert!(report
            .steps()
            .iter()
            .all(|s| s.stage == "Filtering" && s.dataset == "numbers"));

        let last = report.step("Last").unwrap();
        assert_eq!(last.rows_applied_to, 2);
        assert_eq!(last.pct_filtered_at_step, 0.0);
        assert!((last.pct_of_unfiltered - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_empty_dataset() {
        let (filtered, report) = FilterSet::new("Filtering", "empty")
            .exclude("Anything", |_: &u8| true)
            .apply(Vec::new());

        assert!(filtered.is_empty());
        assert_eq!(report.steps()[0].pct_of_unfiltered, 0.0);
        assert_eq!(report.steps()[0].pct_filtered_at_step, 0.0);
    }
}

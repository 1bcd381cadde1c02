//! Time-ordered train/test/validation allocation and company-balanced row
//! weights.
//!
//! Rows are ranked by forecast date and the percentile rank is scaled into
//! `fold_buckets` buckets. Low buckets train, the next bucket tests and the
//! most recent rows validate, so evaluation always looks forward in time.

use crate::config::PipelineConfig;
use crate::error::{ForecastError, Result};
use crate::features::{normalize_company_amounts, TrainingRow};
use crate::utils::{round_half_even, round_to};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Per-company share sums must land within this distance of 1.
const SHARE_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSplits {
    pub train: Vec<TrainingRow>,
    pub test: Vec<TrainingRow>,
    pub validation: Vec<TrainingRow>,
}

impl DataSplits {
    pub fn len(&self) -> usize {
        self.train.len() + self.test.len() + self.validation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrainingRow> {
        self.train.iter().chain(&self.test).chain(&self.validation)
    }
}

/// Average-method percentile ranks: tied values share the mean of the
/// 1-based ranks they span, divided by the row count.
pub fn percentile_ranks<K: Ord>(keys: &[K]) -> Vec<f64> {
    let n = keys.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|a, b| keys[*a].cmp(&keys[*b]));

    let mut ranks = vec![0.0; n];
    let mut start = 0;
    while start < n {
        let mut end = start + 1;
        while end < n && keys[order[end]] == keys[order[start]] {
            end += 1;
        }
        // positions start..end hold ranks start+1..=end
        let average = (start + 1 + end) as f64 / 2.0;
        for &idx in &order[start..end] {
            ranks[idx] = average / n as f64;
        }
        start = end;
    }
    ranks
}

/// Scales percentile ranks into `buckets` buckets, ties to even.
pub fn fold_assignments(ranks: &[f64], buckets: u32) -> Vec<u32> {
    ranks
        .iter()
        // snap float noise so exact halves such as 5/12 * 6 tie correctly
        .map(|pct| round_half_even(round_to(pct * f64::from(buckets), 9)) as u32)
        .collect()
}

/// Sets `inv_company_weight` so every company carries the same total weight
/// (`n_invoices / n_companies`) regardless of its invoice count or size.
pub fn assign_company_weights(rows: &mut [TrainingRow]) -> Result<()> {
    let mut sums: BTreeMap<&str, f64> = BTreeMap::new();
    for row in rows.iter() {
        *sums.entry(row.company_id()).or_default() += row.row.features.inv_pct_of_company_total;
    }
    if let Some((company, sum)) = sums
        .iter()
        .find(|(_, sum)| (**sum - 1.0).abs() > SHARE_TOLERANCE)
    {
        return Err(ForecastError::CompanyNormalization {
            company_id: company.to_string(),
            sum: *sum,
        });
    }

    let n_companies = sums.len();
    let n_invoices = rows.iter().map(|r| r.invoice_id()).collect::<BTreeSet<_>>().len();
    if n_companies == 0 {
        return Ok(());
    }
    let scale = n_invoices as f64 / n_companies as f64;

    for row in rows.iter_mut() {
        row.inv_company_weight = row.row.features.inv_pct_of_company_total * scale;
    }
    Ok(())
}

/// Normalizes company shares over `rows`, weights them and allocates each
/// row to exactly one split by forecast-date rank.
pub fn split(mut rows: Vec<TrainingRow>, config: &PipelineConfig) -> Result<DataSplits> {
    let expected = rows.len();

    normalize_company_amounts(rows.iter_mut().map(|r| &mut r.row));
    assign_company_weights(&mut rows)?;

    let dates: Vec<_> = rows.iter().map(|r| r.forecast_date()).collect();
    let folds = fold_assignments(&percentile_ranks(&dates), config.fold_buckets);

    let mut splits = DataSplits::default();
    for (mut row, fold) in rows.into_iter().zip(folds) {
        row.forecast_date_fold = fold;
        if fold <= config.train_max_fold {
            splits.train.push(row);
        } else if fold <= config.test_max_fold {
            splits.test.push(row);
        } else {
            splits.validation.push(row);
        }
    }

    if splits.len() != expected {
        return Err(ForecastError::SplitCoverage {
            expected,
            allocated: splits.len(),
        });
    }

    for (name, part) in [
        ("train", &splits.train),
        ("test", &splits.test),
        ("validation", &splits.validation),
    ] {
        if part.is_empty() {
            warn!("The {} split is empty", name);
        }
    }

    info!(
        "Split {} rows into {} train, {} test and {} validation",
        expected,
        splits.train.len(),
        splits.test.len(),
        splits.validation.len()
    );
    Ok(splits)
}

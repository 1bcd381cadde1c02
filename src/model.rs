//! Hand-off to external model collaborators.
//!
//! The crate never fits or stores models itself. It builds [`FeatureTable`]s,
//! hands them to a [`Trainer`] or [`Predictor`] implementation and ranks the
//! resulting versions through a [`ModelRegistry`].

use crate::config::{Distribution, ModelSettings};
use crate::error::{ForecastError, Result};
use crate::features::{FeatureRow, FeatureValue, TrainingRow};
use crate::split::DataSplits;
use crate::utils::round_half_even;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Row-major table of named feature columns, one row per invoice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureTable {
    columns: Vec<String>,
    invoice_ids: Vec<String>,
    rows: Vec<Vec<FeatureValue>>,
}

impl FeatureTable {
    /// Table of `columns` for serving-time rows.
    pub fn from_feature_rows(rows: &[FeatureRow], columns: &[String]) -> Result<Self> {
        Self::build(rows, columns, FeatureRow::invoice_id, FeatureRow::feature)
    }

    /// Table of `columns` for training rows, including label and weight columns.
    pub fn from_training_rows(rows: &[TrainingRow], columns: &[String]) -> Result<Self> {
        Self::build(rows, columns, TrainingRow::invoice_id, TrainingRow::column)
    }

    fn build<R>(
        rows: &[R],
        columns: &[String],
        invoice_id: impl Fn(&R) -> &str,
        lookup: impl Fn(&R, &str) -> Option<FeatureValue>,
    ) -> Result<Self> {
        let mut table = FeatureTable {
            columns: columns.to_vec(),
            invoice_ids: Vec::with_capacity(rows.len()),
            rows: Vec::with_capacity(rows.len()),
        };

        for row in rows {
            let values = columns
                .iter()
                .map(|column| {
                    lookup(row, column).ok_or_else(|| {
                        ForecastError::InvalidConfig(format!("Unknown feature column '{}'", column))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            table.invoice_ids.push(invoice_id(row).to_string());
            table.rows.push(values);
        }

        Ok(table)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn invoice_ids(&self) -> &[String] {
        &self.invoice_ids
    }

    pub fn rows(&self) -> &[Vec<FeatureValue>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    /// Values of a numeric column in row order.
    pub fn numeric_column(&self, column: &str) -> Result<Vec<f64>> {
        let idx = self
            .column_index(column)
            .ok_or_else(|| {
                ForecastError::Model(format!("Column '{}' is not in the table", column))
            })?;

        self.rows
            .iter()
            .map(|row| {
                row[idx]
                    .as_f64()
                    .ok_or_else(|| {
                        ForecastError::Model(format!("Column '{}' is not numeric", column))
                    })
            })
            .collect()
    }
}

/// Everything a trainer needs to fit one model version. The three tables are
/// time ordered: `train` oldest, `validation` most recent.
#[derive(Debug, Clone)]
pub struct TrainingRequest {
    pub train: FeatureTable,
    /// Used by trainers that blend or early-stop between train and validation.
    pub test: FeatureTable,
    pub validation: FeatureTable,
    pub predictors: Vec<String>,
    pub label_column: String,
    pub weight_column: String,
    pub distribution: Distribution,
    pub time_budget: Duration,
}

/// External model fitting backend.
pub trait Trainer {
    type Model;

    fn fit(&self, request: &TrainingRequest) -> Result<Self::Model>;
}

/// External inference backend. Returns one value per table row, in row order.
pub trait Predictor<M> {
    fn predict(&self, table: &FeatureTable, model: &M) -> Result<Vec<f64>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMetric {
    Mae,
    MonthlyForecastError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetrics {
    pub mae: f64,
    /// `None` when no collection-month bucket is shared by actuals and predictions.
    pub monthly_forecast_error: Option<f64>,
}

impl ModelMetrics {
    /// Value for ranking; lower is better.
    pub fn value(&self, metric: SelectionMetric) -> Option<f64> {
        match metric {
            SelectionMetric::Mae => Some(self.mae),
            SelectionMetric::MonthlyForecastError => self.monthly_forecast_error,
        }
    }
}

/// Store of trained model versions and their metrics.
pub trait ModelRegistry {
    type Model;

    /// Stores a version and returns its id.
    fn save(&mut self, model: Self::Model, metrics: &ModelMetrics) -> Result<String>;

    /// The version with the lowest value of `selection_metric`.
    fn best(&self, selection_metric: SelectionMetric) -> Result<Self::Model>;
}

/// Builds the split tables and fits one model with the configured predictors,
/// label, weight, distribution and time budget.
pub fn train_collection_model<T: Trainer>(
    trainer: &T,
    splits: &DataSplits,
    settings: &ModelSettings,
) -> Result<T::Model> {
    let mut columns = settings.predictors.clone();
    for extra in [&settings.label_column, &settings.weight_column] {
        if !columns.contains(extra) {
            columns.push(extra.clone());
        }
    }

    let request = TrainingRequest {
        train: FeatureTable::from_training_rows(&splits.train, &columns)?,
        test: FeatureTable::from_training_rows(&splits.test, &columns)?,
        validation: FeatureTable::from_training_rows(&splits.validation, &columns)?,
        predictors: settings.predictors.clone(),
        label_column: settings.label_column.clone(),
        weight_column: settings.weight_column.clone(),
        distribution: settings.distribution,
        time_budget: Duration::from_secs(settings.time_budget_secs),
    };

    info!(
        "Training collection model on {} rows ({} test, {} validation) with {} predictors",
        request.train.len(),
        request.test.len(),
        request.validation.len(),
        request.predictors.len()
    );

    trainer.fit(&request)
}

/// Months-to-collect bucket of a collection rate; `None` for a zero or
/// non-finite rate.
fn collection_month_bucket(rate: f64) -> Option<i64> {
    let inverse = 1.0 / rate;
    inverse.is_finite().then(|| round_half_even(inverse) as i64)
}

fn bucket_weights(rates: &[f64], weights: &[f64]) -> BTreeMap<i64, f64> {
    let mut buckets = BTreeMap::new();
    for (rate, weight) in rates.iter().zip(weights) {
        if let Some(bucket) = collection_month_bucket(*rate) {
            *buckets.entry(bucket).or_insert(0.0) += weight;
        }
    }
    buckets
}

/// Weighted mismatch between the actual and predicted distribution of
/// invoice weight over collection months.
///
/// Rates are bucketed by `round(1 / rate)`, weights summed per bucket, and
/// over the buckets present on both sides the result is
/// `Σ |actual - predicted| / Σ predicted`. Returns `None` when actual rates
/// fall outside `[0, 1]` or no bucket is shared.
pub fn monthly_forecast_error(
    actual: &[f64],
    predicted: &[f64],
    weights: &[f64],
) -> Result<Option<f64>> {
    if actual.len() != predicted.len() || actual.len() != weights.len() {
        return Err(ForecastError::Model(format!(
            "Length mismatch: {} actual, {} predicted, {} weights",
            actual.len(),
            predicted.len(),
            weights.len()
        )));
    }

    if !actual.iter().all(|rate| (0.0..=1.0).contains(rate)) {
        debug!("Actual collection rates outside [0, 1]; monthly error undefined");
        return Ok(None);
    }

    let actual_buckets = bucket_weights(actual, weights);
    let predicted_buckets = bucket_weights(predicted, weights);

    let mut abs_diff = 0.0;
    let mut predicted_total = 0.0;
    for (bucket, predicted_weight) in &predicted_buckets {
        if let Some(actual_weight) = actual_buckets.get(bucket) {
            abs_diff += (actual_weight - predicted_weight).abs();
            predicted_total += predicted_weight;
        }
    }

    Ok((predicted_total != 0.0).then(|| abs_diff / predicted_total))
}

/// Scores `model` on `table` against the actual collection rates.
pub fn evaluate_model<M, P: Predictor<M>>(
    predictor: &P,
    model: &M,
    table: &FeatureTable,
    actual: &[f64],
    weights: &[f64],
) -> Result<ModelMetrics> {
    let predicted = predictor.predict(table, model)?;
    if predicted.len() != table.len() || actual.len() != table.len() {
        return Err(ForecastError::Model(format!(
            "Expected {} predictions and actuals, got {} and {}",
            table.len(),
            predicted.len(),
            actual.len()
        )));
    }

    let mae = if predicted.is_empty() {
        0.0
    } else {
        predicted
            .iter()
            .zip(actual)
            .map(|(p, a)| (p - a).abs())
            .sum::<f64>()
            / predicted.len() as f64
    };

    let metrics = ModelMetrics {
        mae,
        monthly_forecast_error: monthly_forecast_error(actual, &predicted, weights)?,
    };
    debug!("Model metrics: {:?}", metrics);
    Ok(metrics)
}

//! End-to-end training and serving runs.
//!
//! A run either returns its complete output together with the full filter
//! audit trail, or fails on the first integrity violation. Nothing partial is
//! handed back.

use crate::config::{ModelSettings, PipelineConfig};
use crate::error::{ForecastError, Result};
use crate::features::{featurize, featurize_labeled, FeatureRow};
use crate::filters::{FilterReport, FilterSet};
use crate::labeling::label;
use crate::model::{FeatureTable, Predictor};
use crate::point_in_time::resolve;
use crate::preprocessing::{preprocess, ConsolidatedRow};
use crate::schema::{InvoiceStatus, RawInvoice, RawPayment};
use crate::split::{split, DataSplits};
use chrono::NaiveDate;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Output of a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingData {
    pub splits: DataSplits,
    /// Every filter step of the run, in execution order.
    pub report: FilterReport,
}

/// Features of the currently open invoices, all as of one forecast date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenInvoiceFeatures {
    pub forecast_date: NaiveDate,
    pub rows: Vec<FeatureRow>,
    pub report: FilterReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoicePrediction {
    pub invoice_id: String,
    pub forecast_date: NaiveDate,
    pub collected_per_month: f64,
}

/// Drops payments on or after `cutoff`. The last month of an export is
/// usually incomplete and not representative for training.
pub fn apply_payments_cutoff(
    payments: &[RawPayment],
    cutoff: Option<NaiveDate>,
) -> (Vec<RawPayment>, FilterReport) {
    let Some(cutoff) = cutoff else {
        return (payments.to_vec(), FilterReport::new());
    };

    FilterSet::new("Filtering", "payments")
        .exclude(
            format!("Incomplete month ({})", cutoff.format("%Y-%m")),
            move |p: &RawPayment| p.transaction_date.is_some_and(|d| d >= cutoff),
        )
        .apply(payments.to_vec())
}

pub struct TrainingPipeline {
    config: PipelineConfig,
}

impl TrainingPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Payments cutoff, pre-processing, labelling, feature engineering and
    /// split allocation.
    pub fn run(&self, invoices: &[RawInvoice], payments: &[RawPayment]) -> Result<TrainingData> {
        self.config.validate()?;
        info!(
            "Building training data from {} invoices and {} payments",
            invoices.len(),
            payments.len()
        );

        let (payments, mut report) = apply_payments_cutoff(payments, self.config.payments_cutoff);

        let (consolidated, preprocess_report) = preprocess(invoices, &payments, &self.config)?;
        report.append(preprocess_report);

        let (labeled, label_report) = label(&consolidated, self.config.collected_threshold)?;
        report.append(label_report);

        let rows = featurize_labeled(labeled, self.config.month_clip_upper)?;
        info!("Derived features for {} labelled invoices", rows.len());

        let splits = split(rows, &self.config)?;

        for step in report.steps() {
            debug!(
                "{} / {} step {}: '{}' removed {:.2}% of {} rows",
                step.stage,
                step.dataset,
                step.step,
                step.bad_data,
                step.pct_filtered_at_step * 100.0,
                step.rows_applied_to
            );
        }

        Ok(TrainingData { splits, report })
    }
}

/// Serving-time features for every open invoice as of the latest payment in
/// `payments`.
pub fn prepare_open_invoices(
    invoices: &[RawInvoice],
    payments: &[RawPayment],
    config: &PipelineConfig,
) -> Result<OpenInvoiceFeatures> {
    config.validate()?;

    let (consolidated, mut report) = preprocess(invoices, payments, config)?;

    let forecast_date = payments
        .iter()
        .filter_map(|p| p.transaction_date)
        .max()
        .or_else(|| consolidated.iter().map(|r| r.invoice.invoice_date).max());
    let Some(forecast_date) = forecast_date else {
        return Err(ForecastError::InvoicesDropped {
            stage: "open invoice preparation",
            expected: invoices.len(),
            actual: 0,
        });
    };

    let open: Vec<ConsolidatedRow> = consolidated
        .into_iter()
        .filter(|r| r.invoice.status == InvoiceStatus::Open)
        .collect();

    let (open, open_report) = FilterSet::new("Filtering", "open invoices")
        .exclude("Opened after forecast date", move |r: &ConsolidatedRow| {
            r.invoice.invoice_date > forecast_date
        })
        .apply(open);
    report.append(open_report);

    let expected: BTreeSet<&str> = open.iter().map(|r| r.invoice_id()).collect();
    let rows = featurize(resolve(&open, forecast_date)?, config.month_clip_upper)?;

    let mut seen = BTreeSet::new();
    if let Some(duplicate) = rows.iter().find(|r| !seen.insert(r.invoice_id())) {
        return Err(ForecastError::DuplicateRows {
            stage: "open invoice preparation",
            invoice_id: duplicate.invoice_id().to_string(),
        });
    }
    if rows.len() != expected.len() {
        return Err(ForecastError::InvoicesDropped {
            stage: "open invoice preparation",
            expected: expected.len(),
            actual: rows.len(),
        });
    }

    info!("Prepared {} open invoices as of {}", rows.len(), forecast_date);
    Ok(OpenInvoiceFeatures {
        forecast_date,
        rows,
        report,
    })
}

/// Predicted collection rate per open invoice, aligned with `open.rows`.
pub fn predict_open_invoices<M, P: Predictor<M>>(
    predictor: &P,
    model: &M,
    open: &OpenInvoiceFeatures,
    settings: &ModelSettings,
) -> Result<Vec<InvoicePrediction>> {
    let table = FeatureTable::from_feature_rows(&open.rows, &settings.predictors)?;
    let predicted = predictor.predict(&table, model)?;

    if predicted.len() != table.len() {
        return Err(ForecastError::Model(format!(
            "Expected {} predictions, got {}",
            table.len(),
            predicted.len()
        )));
    }

    Ok(table
        .invoice_ids()
        .iter()
        .zip(predicted)
        .map(|(invoice_id, collected_per_month)| InvoicePrediction {
            invoice_id: invoice_id.clone(),
            forecast_date: open.forecast_date,
            collected_per_month,
        })
        .collect())
}

/// Shorthand for `TrainingPipeline::new(config.clone()).run(..)`.
pub fn build_training_data(
    invoices: &[RawInvoice],
    payments: &[RawPayment],
    config: &PipelineConfig,
) -> Result<TrainingData> {
    TrainingPipeline::new(config.clone()).run(invoices, payments)
}

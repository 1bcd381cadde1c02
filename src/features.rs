//! Model-ready features derived from point-in-time snapshots.

use crate::error::{ForecastError, Result};
use crate::labeling::LabeledRow;
use crate::point_in_time::Snapshot;
use crate::utils::months_between;
use chrono::NaiveDate;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Value of one feature column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Numeric(f64),
    Categorical(String),
}

impl FeatureValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FeatureValue::Numeric(v) => Some(*v),
            FeatureValue::Categorical(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceFeatures {
    /// Months since the invoice month, 1-based and clipped to `[1, month_clip_upper]`.
    pub months_open: i32,
    /// Months until the due month, 1-based and clipped to `[1, month_clip_upper]`.
    pub month_due: i32,
    pub due_per_month: f64,
    pub inv_pct_of_company_total: f64,
}

impl InvoiceFeatures {
    pub fn from_snapshot(snapshot: &Snapshot, month_clip_upper: i32) -> Self {
        let invoice = &snapshot.invoice;
        let months_open = (months_between(invoice.invoice_date, snapshot.forecast_date) + 1)
            .clamp(1, month_clip_upper);
        let month_due = (months_between(snapshot.forecast_date, invoice.due_date) + 1)
            .clamp(1, month_clip_upper);

        Self {
            months_open,
            month_due,
            due_per_month: 1.0 / f64::from(month_due.max(1)),
            inv_pct_of_company_total: invoice.inv_pct_of_company_total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub snapshot: Snapshot,
    pub features: InvoiceFeatures,
}

impl FeatureRow {
    pub fn invoice_id(&self) -> &str {
        self.snapshot.invoice_id()
    }

    /// Looks up a feature column by name.
    pub fn feature(&self, column: &str) -> Option<FeatureValue> {
        let invoice = &self.snapshot.invoice;
        let value = match column {
            "currency" => return Some(FeatureValue::Categorical(invoice.currency.clone())),
            "months_allowed" => f64::from(invoice.months_allowed),
            "amount_inv" => invoice.amount,
            "exchange_rate_inv" => invoice.exchange_rate,
            "converted_amount_inv" => invoice.converted_amount,
            "inv_pct_of_company_total" => self.features.inv_pct_of_company_total,
            "months_open" => f64::from(self.features.months_open),
            "month_due" => f64::from(self.features.month_due),
            "due_per_month" => self.features.due_per_month,
            "remaining_inv_pct" => self.snapshot.remaining_inv_pct,
            _ => return None,
        };
        Some(FeatureValue::Numeric(value))
    }
}

/// Derives features for each snapshot. Forecast dates must not precede the
/// month the invoice was opened in.
pub fn featurize(snapshots: Vec<Snapshot>, month_clip_upper: i32) -> Result<Vec<FeatureRow>> {
    let rows = snapshots
        .into_iter()
        .map(|snapshot| {
            if snapshot.forecast_date < snapshot.invoice.invoice_month {
                return Err(ForecastError::ForecastBeforeInvoice {
                    invoice_id: snapshot.invoice_id().to_string(),
                    forecast_date: snapshot.forecast_date,
                });
            }
            let features = InvoiceFeatures::from_snapshot(&snapshot, month_clip_upper);
            Ok(FeatureRow { snapshot, features })
        })
        .collect::<Result<Vec<_>>>()?;

    debug!("Derived features for {} snapshots", rows.len());
    Ok(rows)
}

/// Each entry's share of its company's total converted amount.
pub fn company_amount_shares<'a>(entries: impl IntoIterator<Item = (&'a str, f64)>) -> Vec<f64> {
    let entries: Vec<(&str, f64)> = entries.into_iter().collect();

    let mut totals: HashMap<&str, f64> = HashMap::new();
    for (company, amount) in &entries {
        *totals.entry(company).or_default() += amount;
    }

    entries
        .iter()
        .map(|(company, amount)| match totals.get(company) {
            Some(total) if *total > 0.0 => amount / total,
            _ => 0.0,
        })
        .collect()
}

/// Recomputes `inv_pct_of_company_total` over exactly the given rows, so the
/// shares sum to 1 per company within this row set.
pub fn normalize_company_amounts<'a>(rows: impl IntoIterator<Item = &'a mut FeatureRow>) {
    let mut rows: Vec<&mut FeatureRow> = rows.into_iter().collect();
    let shares = company_amount_shares(rows.iter().map(|r| {
        (
            r.snapshot.invoice.company_id.as_str(),
            r.snapshot.invoice.converted_amount,
        )
    }));
    for (row, share) in rows.iter_mut().zip(shares) {
        row.features.inv_pct_of_company_total = share;
    }
}

/// A labelled, featurized row ready for splitting and training.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRow {
    pub row: FeatureRow,
    pub collected_date: Option<NaiveDate>,
    pub final_remaining_inv_pct: f64,
    pub collected_per_month: f64,
    /// Set by the split allocator.
    pub inv_company_weight: f64,
    /// Set by the split allocator.
    pub forecast_date_fold: u32,
}

impl TrainingRow {
    pub fn invoice_id(&self) -> &str {
        self.row.invoice_id()
    }

    pub fn company_id(&self) -> &str {
        &self.row.snapshot.invoice.company_id
    }

    pub fn forecast_date(&self) -> NaiveDate {
        self.row.snapshot.forecast_date
    }

    /// Feature columns plus the label and weight columns.
    pub fn column(&self, column: &str) -> Option<FeatureValue> {
        match column {
            "collected_per_month" => Some(FeatureValue::Numeric(self.collected_per_month)),
            "final_remaining_inv_pct" => Some(FeatureValue::Numeric(self.final_remaining_inv_pct)),
            "inv_company_weight" => Some(FeatureValue::Numeric(self.inv_company_weight)),
            _ => self.row.feature(column),
        }
    }
}

/// Featurizes labelled rows at their sampled forecast dates.
pub fn featurize_labeled(
    labeled: Vec<LabeledRow>,
    month_clip_upper: i32,
) -> Result<Vec<TrainingRow>> {
    let mut outcomes = Vec::with_capacity(labeled.len());
    let mut snapshots = Vec::with_capacity(labeled.len());
    for row in labeled {
        outcomes.push((row.collected_date, row.final_remaining_inv_pct, row.collected_per_month));
        snapshots.push(row.snapshot);
    }

    let rows = featurize(snapshots, month_clip_upper)?;

    Ok(rows
        .into_iter()
        .zip(outcomes)
        .map(
            |(row, (collected_date, final_remaining_inv_pct, collected_per_month))| TrainingRow {
                row,
                collected_date,
                final_remaining_inv_pct,
                collected_per_month,
                inv_company_weight: 0.0,
                forecast_date_fold: 0,
            },
        )
        .collect())
}

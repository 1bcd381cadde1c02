//! Point-in-time view of each invoice's payment state.

use crate::error::{ForecastError, Result};
use crate::preprocessing::{ConsolidatedRow, PreparedInvoice};
use chrono::NaiveDate;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Payment state of one invoice as of `forecast_date`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub invoice: Arc<PreparedInvoice>,
    pub forecast_date: NaiveDate,
    pub final_date_open: NaiveDate,
    /// Latest payment event strictly before the forecast date, if any.
    pub prior_transaction_date: Option<NaiveDate>,
    pub prior_amount_pmt_pct_cum: Option<f64>,
    pub remaining_inv_pct: f64,
}

impl Snapshot {
    pub fn invoice_id(&self) -> &str {
        &self.invoice.invoice_id
    }
}

/// Resolves every invoice in `rows` at the same forecast date.
pub fn resolve(rows: &[ConsolidatedRow], forecast_date: NaiveDate) -> Result<Vec<Snapshot>> {
    resolve_with(rows, |_| Some(forecast_date))
}

/// Resolves each invoice at its own forecast date. Invoices for which
/// `forecast_date_for` returns `None` are skipped.
pub fn resolve_with<F>(rows: &[ConsolidatedRow], forecast_date_for: F) -> Result<Vec<Snapshot>>
where
    F: Fn(&str) -> Option<NaiveDate>,
{
    let groups = group_by_invoice(rows);
    let mut snapshots = Vec::with_capacity(groups.len());

    // one group per invoice id; resolve_invoice rejects groups whose rows
    // disagree on the invoice attributes
    for (invoice_id, history) in &groups {
        let Some(forecast_date) = forecast_date_for(*invoice_id) else {
            continue;
        };
        snapshots.push(resolve_invoice(history, forecast_date)?);
    }

    debug!("Resolved {} invoice snapshots", snapshots.len());
    Ok(snapshots)
}

/// Rows per invoice id, each group ordered by transaction date.
pub fn group_by_invoice(rows: &[ConsolidatedRow]) -> BTreeMap<&str, Vec<&ConsolidatedRow>> {
    let mut groups: BTreeMap<&str, Vec<&ConsolidatedRow>> = BTreeMap::new();
    for row in rows {
        groups.entry(row.invoice_id()).or_default().push(row);
    }
    for history in groups.values_mut() {
        history.sort_by_key(|r| r.transaction_date);
    }
    groups
}

/// Collapses one invoice's ordered history to its state at `forecast_date`:
/// the last event before the forecast date, or the zero-paid placeholder.
pub fn resolve_invoice(history: &[&ConsolidatedRow], forecast_date: NaiveDate) -> Result<Snapshot> {
    let first = history.first().ok_or(ForecastError::InvoicesDropped {
        stage: "point-in-time resolution",
        expected: 1,
        actual: 0,
    })?;

    if history.iter().any(|r| r.invoice != first.invoice) {
        return Err(ForecastError::DuplicateRows {
            stage: "point-in-time resolution",
            invoice_id: first.invoice_id().to_string(),
        });
    }

    let prior = history
        .iter()
        .filter(|r| r.transaction_date < forecast_date || r.amount_pmt_pct_cum == 0.0)
        .last();

    Ok(Snapshot {
        invoice: Arc::clone(&first.invoice),
        forecast_date,
        final_date_open: first.final_date_open,
        prior_transaction_date: prior.map(|r| r.transaction_date),
        prior_amount_pmt_pct_cum: prior.map(|r| r.amount_pmt_pct_cum),
        remaining_inv_pct: 1.0 - prior.map_or(0.0, |r| r.amount_pmt_pct_cum),
    })
}

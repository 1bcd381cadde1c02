//! Hard data-contract checks on the raw inputs.
//!
//! A failure here means the input schema itself is broken. Unlike the
//! filters, nothing is dropped: the run stops with a [`ForecastError`]
//! naming the violated invariant.

use crate::error::{ForecastError, Result};
use crate::schema::{RawInvoice, RawPayment};
use log::debug;
use std::collections::HashSet;

pub trait Validate {
    fn validate(&self) -> Result<()>;
}

impl Validate for [RawInvoice] {
    fn validate(&self) -> Result<()> {
        validate_invoices(self)
    }
}

impl Validate for [RawPayment] {
    fn validate(&self) -> Result<()> {
        validate_payments(self)
    }
}

pub fn validate_invoices(invoices: &[RawInvoice]) -> Result<()> {
    const DATASET: &str = "invoices";

    require_present(DATASET, "id", invoices, |i| i.id.is_some())?;
    require_present(DATASET, "invoice_date", invoices, |i| i.invoice_date.is_some())?;
    require_present(DATASET, "status", invoices, |i| i.status.is_some())?;
    require_present(DATASET, "amount", invoices, |i| i.amount.is_some())?;
    require_present(DATASET, "exchange_rate", invoices, |i| i.exchange_rate.is_some())?;
    require_present(DATASET, "currency", invoices, |i| i.currency.is_some())?;
    require_present(DATASET, "company_id", invoices, |i| i.company_id.is_some())?;
    require_present(DATASET, "customer_id", invoices, |i| i.customer_id.is_some())?;

    require_positive(DATASET, "exchange_rate", invoices.iter().map(|i| i.exchange_rate))?;
    require_positive(DATASET, "amount", invoices.iter().map(|i| i.amount))?;
    require_unique_ids(invoices)?;

    debug!("Validated {} invoice rows", invoices.len());
    Ok(())
}

/// Each invoice id may appear on one row only.
fn require_unique_ids(invoices: &[RawInvoice]) -> Result<()> {
    let mut seen = HashSet::with_capacity(invoices.len());
    let repeated: Vec<&str> = invoices
        .iter()
        .filter_map(|i| i.id.as_deref())
        .filter(|id| !seen.insert(*id))
        .collect();

    match repeated.first() {
        Some(example) => Err(ForecastError::DuplicateInvoiceIds {
            count: repeated.len(),
            example: example.to_string(),
        }),
        None => Ok(()),
    }
}

pub fn validate_payments(payments: &[RawPayment]) -> Result<()> {
    const DATASET: &str = "payments";

    require_present(DATASET, "invoice_id", payments, |p| p.invoice_id.is_some())?;
    require_present(DATASET, "transaction_date", payments, |p| p.transaction_date.is_some())?;
    require_present(DATASET, "exchange_rate", payments, |p| p.exchange_rate.is_some())?;

    require_positive(DATASET, "exchange_rate", payments.iter().map(|p| p.exchange_rate))?;
    // missing amounts are filtered later, only populated ones must be positive
    require_positive(DATASET, "amount", payments.iter().map(|p| p.amount))?;

    let inconsistent = payments
        .iter()
        .filter(|p| p.amount.is_some() != p.converted_amount.is_some())
        .count();
    if inconsistent > 0 {
        return Err(ForecastError::InconsistentConvertedAmounts {
            count: inconsistent,
        });
    }

    debug!("Validated {} payment rows", payments.len());
    Ok(())
}

/// Every payment must reference an invoice present in `invoices`.
pub fn validate_payment_references(
    invoices: &[RawInvoice],
    payments: &[RawPayment],
) -> Result<()> {
    let known: HashSet<&str> = invoices.iter().filter_map(|i| i.id.as_deref()).collect();

    let unknown: Vec<&str> = payments
        .iter()
        .filter_map(|p| p.invoice_id.as_deref())
        .filter(|id| !known.contains(id))
        .collect();

    match unknown.first() {
        Some(example) => Err(ForecastError::UnknownInvoiceReferences {
            count: unknown.len(),
            example: example.to_string(),
        }),
        None => Ok(()),
    }
}

fn require_present<T>(
    dataset: &'static str,
    field: &'static str,
    rows: &[T],
    is_present: impl Fn(&T) -> bool,
) -> Result<()> {
    let missing = rows.iter().filter(|r| !is_present(r)).count();
    if missing > 0 {
        return Err(ForecastError::MissingValues {
            dataset,
            field,
            missing,
            rows: rows.len(),
        });
    }
    Ok(())
}

fn require_positive(
    dataset: &'static str,
    field: &'static str,
    values: impl Iterator<Item = Option<f64>>,
) -> Result<()> {
    // NaN is not a usable amount either
    let count = values.flatten().filter(|v| !(*v > 0.0)).count();
    if count > 0 {
        return Err(ForecastError::NonPositiveValues {
            dataset,
            field,
            count,
        });
    }
    Ok(())
}

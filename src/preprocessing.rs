//! Cleaning and consolidation of raw invoices and payments.
//!
//! The output is one [`ConsolidatedRow`] per (invoice, payment event), sorted
//! by invoice id and transaction date, with a running cumulative paid
//! fraction that is non-decreasing per invoice and bounded by 1.

use crate::config::PipelineConfig;
use crate::error::{ForecastError, Result};
use crate::features::company_amount_shares;
use crate::filters::{apply_filters, FilterReport, FilterSet};
use crate::schema::{InvoiceStatus, RawInvoice, RawPayment};
use crate::utils::{month_start, months_between, round_to};
use crate::validation::{validate_invoices, validate_payment_references, validate_payments};
use chrono::NaiveDate;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

const STAGE: &str = "Pre-processing";

/// Decimal places of the cumulative paid fraction. Anything at or above
/// 0.99995 rounds to 1.0 and counts as fully collected.
pub const PAID_FRACTION_DECIMALS: i32 = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedPayment {
    pub invoice_id: String,
    pub transaction_date: NaiveDate,
    pub transaction_month: NaiveDate,
    pub amount: f64,
    pub exchange_rate: f64,
}

/// Static invoice attributes after validation and filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedInvoice {
    pub invoice_id: String,
    pub company_id: String,
    pub customer_id: String,
    pub currency: String,
    pub amount: f64,
    pub exchange_rate: f64,
    /// Amount in the company root currency.
    pub converted_amount: f64,
    pub invoice_date: NaiveDate,
    pub due_date: NaiveDate,
    pub cleared_date: Option<NaiveDate>,
    pub status: InvoiceStatus,
    pub invoice_month: NaiveDate,
    pub due_month: NaiveDate,
    pub months_allowed: i32,
    pub inv_pct_of_company_total: f64,
}

/// One invoice/payment event with the running payment state of the invoice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedRow {
    pub invoice: Arc<PreparedInvoice>,
    /// `None` for the placeholder row of an invoice without payments.
    pub amount_pmt: Option<f64>,
    pub exchange_rate_pmt: Option<f64>,
    pub transaction_date: NaiveDate,
    pub transaction_month: NaiveDate,
    pub final_date_open: NaiveDate,
    pub amount_pmt_pct: f64,
    pub amount_pmt_pct_cum: f64,
}

impl ConsolidatedRow {
    pub fn invoice_id(&self) -> &str {
        &self.invoice.invoice_id
    }

    pub fn has_payment(&self) -> bool {
        self.amount_pmt.is_some()
    }
}

/// Validates, cleans and merges invoices with their payments.
pub fn preprocess(
    invoices: &[RawInvoice],
    payments: &[RawPayment],
    config: &PipelineConfig,
) -> Result<(Vec<ConsolidatedRow>, FilterReport)> {
    // invoices must be a superset of payments before anything is filtered
    validate_payment_references(invoices, payments)?;

    let (payments_prepared, payment_report) = prepare_payments(payments)?;
    let (invoices_prepared, invoice_report) =
        prepare_invoices(invoices, config.max_months_allowed)?;
    let (consolidated, consolidation_report) = consolidate(invoices_prepared, &payments_prepared)?;

    let mut report = payment_report;
    report.append(invoice_report);
    report.append(consolidation_report);

    info!(
        "Pre-processed {} invoices and {} payments into {} invoice-payment rows",
        invoices.len(),
        payments.len(),
        consolidated.len()
    );

    Ok((consolidated, report))
}

pub fn prepare_payments(payments: &[RawPayment]) -> Result<(Vec<PreparedPayment>, FilterReport)> {
    validate_payments(payments)?;

    let (kept, report) = FilterSet::new(STAGE, "payments")
        .exclude("Missing Amount", |p: &RawPayment| p.amount.is_none())
        .apply(payments.to_vec());

    let prepared = kept
        .into_iter()
        .map(|p| {
            let transaction_date = required(p.transaction_date, "payments", "transaction_date")?;
            Ok(PreparedPayment {
                invoice_id: required(p.invoice_id, "payments", "invoice_id")?,
                transaction_date,
                transaction_month: month_start(transaction_date),
                amount: required(p.amount, "payments", "amount")?,
                exchange_rate: required(p.exchange_rate, "payments", "exchange_rate")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    debug!("Prepared {} of {} payment rows", prepared.len(), payments.len());
    Ok((prepared, report))
}

pub fn prepare_invoices(
    invoices: &[RawInvoice],
    max_months_allowed: i32,
) -> Result<(Vec<PreparedInvoice>, FilterReport)> {
    validate_invoices(invoices)?;

    let months_allowed = |i: &RawInvoice| match (i.invoice_date, i.due_date) {
        (Some(opened), Some(due)) => Some(months_between(opened, due)),
        _ => None,
    };

    let (kept, report) = FilterSet::new(STAGE, "invoices")
        .exclude("Missing due date", |i: &RawInvoice| i.due_date.is_none())
        .exclude("Due before opened", |i: &RawInvoice| {
            matches!((i.invoice_date, i.due_date), (Some(opened), Some(due)) if due < opened)
        })
        .exclude(
            format!("Due over {} months after opened", max_months_allowed),
            move |i: &RawInvoice| months_allowed(i).is_some_and(|m| m > max_months_allowed),
        )
        .apply(invoices.to_vec());

    let mut prepared = kept
        .into_iter()
        .map(|i| {
            let amount = required(i.amount, "invoices", "amount")?;
            let exchange_rate = required(i.exchange_rate, "invoices", "exchange_rate")?;
            let invoice_date = required(i.invoice_date, "invoices", "invoice_date")?;
            let due_date = required(i.due_date, "invoices", "due_date")?;
            Ok(PreparedInvoice {
                invoice_id: required(i.id, "invoices", "id")?,
                company_id: required(i.company_id, "invoices", "company_id")?,
                customer_id: required(i.customer_id, "invoices", "customer_id")?,
                currency: required(i.currency, "invoices", "currency")?,
                amount,
                exchange_rate,
                converted_amount: amount * exchange_rate,
                invoice_date,
                due_date,
                cleared_date: i.cleared_date,
                status: required(i.status, "invoices", "status")?,
                invoice_month: month_start(invoice_date),
                due_month: month_start(due_date),
                months_allowed: months_between(invoice_date, due_date),
                inv_pct_of_company_total: 0.0,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let shares = company_amount_shares(
        prepared
            .iter()
            .map(|i| (i.company_id.as_str(), i.converted_amount)),
    );
    for (invoice, share) in prepared.iter_mut().zip(shares) {
        invoice.inv_pct_of_company_total = share;
    }

    debug!("Prepared {} of {} invoice rows", prepared.len(), invoices.len());
    Ok((prepared, report))
}

/// Left-merges payments onto invoices and derives the running payment state.
pub fn consolidate(
    invoices: Vec<PreparedInvoice>,
    payments: &[PreparedPayment],
) -> Result<(Vec<ConsolidatedRow>, FilterReport)> {
    // invoices without payments count as zero paid as of the end of the data
    let dataset_end = payments
        .iter()
        .map(|p| p.transaction_date)
        .max()
        .or_else(|| invoices.iter().map(|i| i.invoice_date).max());

    let known: BTreeSet<&str> = invoices.iter().map(|i| i.invoice_id.as_str()).collect();
    let (payments, mut report) = FilterSet::new(STAGE, "payments")
        .exclude("Payments for filtered invoices", move |p: &&PreparedPayment| {
            !known.contains(p.invoice_id.as_str())
        })
        .apply(payments.iter().collect());

    let mut payments_by_invoice: BTreeMap<&str, Vec<&PreparedPayment>> = BTreeMap::new();
    for payment in payments {
        payments_by_invoice
            .entry(payment.invoice_id.as_str())
            .or_default()
            .push(payment);
    }

    let mut invoices = invoices;
    invoices.sort_by(|a, b| a.invoice_id.cmp(&b.invoice_id));

    let mut rows = Vec::new();
    for invoice in invoices {
        let invoice = Arc::new(invoice);
        let mut invoice_payments = payments_by_invoice
            .remove(invoice.invoice_id.as_str())
            .unwrap_or_default();
        invoice_payments.sort_by_key(|p| p.transaction_date);

        if let Some(p) = invoice_payments.iter().find(|p| p.amount > invoice.amount) {
            return Err(ForecastError::PaymentExceedsInvoice {
                invoice_id: invoice.invoice_id.clone(),
                payment_amount: p.amount,
                invoice_amount: invoice.amount,
            });
        }

        let last_transaction_date = match invoice_payments.last() {
            Some(p) => p.transaction_date,
            None => dataset_end.unwrap_or(invoice.invoice_date),
        };
        let final_date_open = invoice
            .cleared_date
            .map_or(last_transaction_date, |cleared| cleared.min(last_transaction_date));

        if invoice_payments.is_empty() {
            rows.push(ConsolidatedRow {
                invoice: Arc::clone(&invoice),
                amount_pmt: None,
                exchange_rate_pmt: None,
                transaction_date: last_transaction_date,
                transaction_month: month_start(last_transaction_date),
                final_date_open,
                amount_pmt_pct: 0.0,
                amount_pmt_pct_cum: 0.0,
            });
            continue;
        }

        let mut running = 0.0;
        for payment in invoice_payments {
            let pct = payment.amount / invoice.amount;
            running += pct;
            rows.push(ConsolidatedRow {
                invoice: Arc::clone(&invoice),
                amount_pmt: Some(payment.amount),
                exchange_rate_pmt: Some(payment.exchange_rate),
                transaction_date: payment.transaction_date,
                transaction_month: payment.transaction_month,
                final_date_open,
                amount_pmt_pct: pct,
                amount_pmt_pct_cum: round_to(running, PAID_FRACTION_DECIMALS),
            });
        }
    }

    let (rows, consolidation_report) = apply_filters(consolidation_exclusions(&rows), rows);
    report.append(consolidation_report.labeled(STAGE, "invoices with payments"));
    Ok((rows, report))
}

/// Overpayment rows, then same-day duplicates (latest state wins), then
/// repeated cumulative fractions (first wins). Each set is computed over the
/// rows surviving the previous ones. Expects rows sorted by invoice and date.
fn consolidation_exclusions(rows: &[ConsolidatedRow]) -> Vec<(String, BTreeSet<usize>)> {
    let overpaid: BTreeSet<usize> = rows
        .iter()
        .enumerate()
        .filter(|(_, r)| r.amount_pmt_pct_cum > 1.0)
        .map(|(idx, _)| idx)
        .collect();

    let survivors: Vec<usize> = (0..rows.len()).filter(|i| !overpaid.contains(i)).collect();
    let same_day: BTreeSet<usize> = survivors
        .windows(2)
        .filter(|pair| {
            let (current, next) = (&rows[pair[0]], &rows[pair[1]]);
            current.invoice_id() == next.invoice_id()
                && current.transaction_date == next.transaction_date
        })
        .map(|pair| pair[0])
        .collect();

    let mut seen: BTreeSet<(&str, u64)> = BTreeSet::new();
    let duplicate_fraction: BTreeSet<usize> = survivors
        .iter()
        .copied()
        .filter(|i| !same_day.contains(i))
        .filter(|&i| !seen.insert((rows[i].invoice_id(), rows[i].amount_pmt_pct_cum.to_bits())))
        .collect();

    vec![
        ("Cumulative payments over invoice amount".to_string(), overpaid),
        ("Multiple transactions on the same day".to_string(), same_day),
        ("Duplicate cumulative payment amount".to_string(), duplicate_fraction),
    ]
}

fn required<T>(value: Option<T>, dataset: &'static str, field: &'static str) -> Result<T> {
    value.ok_or(ForecastError::MissingValues {
        dataset,
        field,
        missing: 1,
        rows: 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn invoice(id: &str, amount: f64, opened: NaiveDate, due: Option<NaiveDate>) -> RawInvoice {
        RawInvoice {
            id: Some(id.to_string()),
            company_id: Some("C1".to_string()),
            customer_id: Some("K1".to_string()),
            currency: Some("USD".to_string()),
            amount: Some(amount),
            exchange_rate: Some(1.0),
            invoice_date: Some(opened),
            due_date: due,
            cleared_date: None,
            status: Some(InvoiceStatus::Open),
        }
    }

    fn payment(invoice_id: &str, on: NaiveDate, amount: Option<f64>) -> RawPayment {
        RawPayment {
            invoice_id: Some(invoice_id.to_string()),
            transaction_date: Some(on),
            amount,
            exchange_rate: Some(1.0),
            converted_amount: amount,
        }
    }

    #[test]
    fn test_invoice_filters() {
        let invoices = vec![
            invoice("A", 100.0, date(2021, 1, 1), Some(date(2021, 2, 1))),
            invoice("B", 100.0, date(2021, 1, 1), None),
            invoice("C", 100.0, date(2021, 3, 1), Some(date(2021, 2, 1))),
            invoice("D", 100.0, date(2021, 1, 31), Some(date(2021, 5, 1))),
            invoice("E", 100.0, date(2021, 1, 31), Some(date(2021, 4, 30))),
        ];

        let (prepared, report) = prepare_invoices(&invoices, 3).unwrap();
        let ids: Vec<&str> = prepared.iter().map(|i| i.invoice_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "E"]);
        assert!(prepared.iter().all(|i| (0..=3).contains(&i.months_allowed)));

        assert_eq!(report.len(), 3);
        assert_eq!(report.steps()[0].bad_data, "Missing due date");
        assert_eq!(report.steps()[1].bad_data, "Due before opened");
        assert_eq!(report.steps()[2].bad_data, "Due over 3 months after opened");
        assert!((report.steps()[2].pct_of_unfiltered - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_company_shares() {
        let invoices = vec![
            invoice("A", 100.0, date(2021, 1, 1), Some(date(2021, 2, 1))),
            invoice("B", 300.0, date(2021, 1, 1), Some(date(2021, 2, 1))),
        ];

        let (prepared, _) = prepare_invoices(&invoices, 3).unwrap();
        assert!((prepared[0].inv_pct_of_company_total - 0.25).abs() < 1e-12);
        assert!((prepared[1].inv_pct_of_company_total - 0.75).abs() < 1e-12);
        let total: f64 = prepared.iter().map(|i| i.inv_pct_of_company_total).sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_missing_payment_amount_is_filtered() {
        let payments = vec![
            payment("A", date(2021, 1, 5), Some(10.0)),
            payment("A", date(2021, 1, 6), None),
        ];

        let (prepared, report) = prepare_payments(&payments).unwrap();
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0].transaction_month, date(2021, 1, 1));
        assert_eq!(report.step("Missing Amount").unwrap().pct_of_unfiltered, 0.5);
    }

    #[test]
    fn test_payments_of_filtered_invoices_are_reported() {
        let invoices = vec![
            invoice("A", 100.0, date(2021, 1, 1), Some(date(2021, 2, 1))),
            invoice("B", 100.0, date(2021, 1, 1), None),
            invoice("C", 100.0, date(2021, 1, 1), Some(date(2021, 2, 1))),
        ];
        let payments = vec![
            payment("A", date(2021, 1, 5), Some(10.0)),
            payment("B", date(2021, 1, 7), Some(20.0)),
            payment("B", date(2021, 2, 1), Some(30.0)),
        ];

        let (rows, report) = preprocess(&invoices, &payments, &PipelineConfig::default()).unwrap();

        let ids: Vec<&str> = rows.iter().map(|r| r.invoice_id()).collect();
        assert_eq!(ids, vec!["A", "C"]);
        // the unpaid placeholder still dates to the last payment seen in the data
        assert_eq!(rows[1].transaction_date, date(2021, 2, 1));

        let orphaned = report.step("Payments for filtered invoices").unwrap();
        assert_eq!(orphaned.stage, "Pre-processing");
        assert_eq!(orphaned.dataset, "payments");
        assert_eq!(orphaned.rows_applied_to, 3);
        assert!((orphaned.pct_filtered_at_step - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_repeated_invoice_id_is_fatal() {
        let a = invoice("A", 100.0, date(2021, 1, 1), Some(date(2021, 2, 1)));
        let invoices = vec![a.clone(), a];
        let payments = vec![payment("A", date(2021, 1, 10), Some(40.0))];

        match preprocess(&invoices, &payments, &PipelineConfig::default()) {
            Err(ForecastError::DuplicateInvoiceIds { count, example }) => {
                assert_eq!(count, 1);
                assert_eq!(example, "A");
            }
            other => panic!("expected DuplicateInvoiceIds, got {:?}", other),
        }
    }

    #[test]
    fn test_cumulative_fraction_is_monotonic_and_bounded() {
        let invoices = vec![invoice("A", 300.0, date(2021, 1, 1), Some(date(2021, 2, 1)))];
        let payments = vec![
            payment("A", date(2021, 2, 10), Some(100.0)),
            payment("A", date(2021, 1, 10), Some(100.0)),
            payment("A", date(2021, 3, 10), Some(100.0)),
        ];

        let (rows, _) = preprocess(&invoices, &payments, &PipelineConfig::default()).unwrap();
        assert_eq!(rows.len(), 3);

        let cum: Vec<f64> = rows.iter().map(|r| r.amount_pmt_pct_cum).collect();
        assert_eq!(cum, vec![0.3333, 0.6667, 1.0]);
        assert!(rows.windows(2).all(|w| w[0].transaction_date <= w[1].transaction_date));
        assert!(rows.iter().all(|r| r.final_date_open == date(2021, 3, 10)));
    }

    #[test]
    fn test_invoice_without_payments_uses_dataset_end() {
        let invoices = vec![
            invoice("A", 100.0, date(2021, 1, 1), Some(date(2021, 2, 1))),
            invoice("B", 100.0, date(2021, 1, 1), Some(date(2021, 2, 1))),
        ];
        let payments = vec![payment("A", date(2021, 4, 20), Some(40.0))];

        let (rows, _) = preprocess(&invoices, &payments, &PipelineConfig::default()).unwrap();
        let b = rows.iter().find(|r| r.invoice_id() == "B").unwrap();

        assert!(!b.has_payment());
        assert_eq!(b.transaction_date, date(2021, 4, 20));
        assert_eq!(b.transaction_month, date(2021, 4, 1));
        assert_eq!(b.amount_pmt_pct_cum, 0.0);
    }

    #[test]
    fn test_final_date_open_uses_earlier_cleared_date() {
        let mut cleared = invoice("A", 100.0, date(2021, 1, 1), Some(date(2021, 2, 1)));
        cleared.status = Some(InvoiceStatus::Cleared);
        cleared.cleared_date = Some(date(2021, 1, 20));
        let payments = vec![payment("A", date(2021, 2, 3), Some(100.0))];

        let (rows, _) = preprocess(&[cleared], &payments, &PipelineConfig::default()).unwrap();
        assert_eq!(rows[0].final_date_open, date(2021, 1, 20));
    }

    #[test]
    fn test_payment_exceeding_invoice_is_fatal() {
        let invoices = vec![invoice("A", 100.0, date(2021, 1, 1), Some(date(2021, 2, 1)))];
        let payments = vec![payment("A", date(2021, 1, 5), Some(150.0))];

        let err = preprocess(&invoices, &payments, &PipelineConfig::default()).unwrap_err();
        assert!(matches!(err, ForecastError::PaymentExceedsInvoice { .. }));
    }

    #[test]
    fn test_overpayment_and_duplicates_are_filtered() {
        let invoices = vec![invoice("A", 100.0, date(2021, 1, 1), Some(date(2021, 2, 1)))];
        let payments = vec![
            payment("A", date(2021, 1, 5), Some(30.0)),
            payment("A", date(2021, 1, 5), Some(20.0)),
            payment("A", date(2021, 1, 9), Some(0.001)),
            payment("A", date(2021, 1, 12), Some(50.0)),
            payment("A", date(2021, 1, 15), Some(10.0)),
        ];

        let (rows, report) = preprocess(&invoices, &payments, &PipelineConfig::default()).unwrap();

        let states: Vec<(NaiveDate, f64)> = rows
            .iter()
            .map(|r| (r.transaction_date, r.amount_pmt_pct_cum))
            .collect();
        assert_eq!(
            states,
            vec![(date(2021, 1, 5), 0.5), (date(2021, 1, 12), 1.0)]
        );

        let overpaid = report.step("Cumulative payments over invoice amount").unwrap();
        assert_eq!(overpaid.rows_applied_to, 5);
        assert!((overpaid.pct_filtered_at_step - 0.2).abs() < 1e-12);
        assert_eq!(
            report.step("Multiple transactions on the same day").unwrap().rows_applied_to,
            4
        );
        assert_eq!(
            report.step("Duplicate cumulative payment amount").unwrap().rows_applied_to,
            3
        );
    }

    #[test]
    fn test_unknown_payment_reference_is_fatal() {
        let invoices = vec![invoice("A", 100.0, date(2021, 1, 1), Some(date(2021, 2, 1)))];
        let payments = vec![payment("B", date(2021, 1, 5), Some(10.0))];

        assert!(matches!(
            preprocess(&invoices, &payments, &PipelineConfig::default()),
            Err(ForecastError::UnknownInvoiceReferences { .. })
        ));
    }
}

//! Training labels: collection outcome, sampled forecast date and the
//! collection rate per month from that date to resolution.
//!
//! The forecast date of an invoice is drawn from the months it was open,
//! with a generator seeded only by the invoice id. Repeated runs therefore
//! pick the same month for the same invoice regardless of row order, and
//! invoices can be labelled independently of each other.

use crate::error::{ForecastError, Result};
use crate::filters::{FilterReport, FilterSet};
use crate::point_in_time::{group_by_invoice, resolve_invoice, Snapshot};
use crate::preprocessing::ConsolidatedRow;
use crate::schema::InvoiceStatus;
use crate::utils::{month_range, months_between, stable_hash};
use chrono::NaiveDate;
use log::{debug, info};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabeledRow {
    /// State of the invoice at its sampled forecast date.
    pub snapshot: Snapshot,
    /// First transaction date at which the invoice was fully paid.
    pub collected_date: Option<NaiveDate>,
    /// Remaining fraction at the end of the observed history.
    pub final_remaining_inv_pct: f64,
    /// Fraction of the invoice collected per month between the forecast
    /// date and resolution. The regression target.
    pub collected_per_month: f64,
}

impl LabeledRow {
    pub fn invoice_id(&self) -> &str {
        self.snapshot.invoice_id()
    }

    pub fn forecast_date(&self) -> NaiveDate {
        self.snapshot.forecast_date
    }

    /// Collection date, or the last date the invoice was seen open.
    pub fn resolution_date(&self) -> NaiveDate {
        self.collected_date.unwrap_or(self.snapshot.final_date_open)
    }
}

/// Month starts from `max(invoice_date, first_transaction_date)` through
/// `max_forecast_date`, inclusive at month granularity.
pub fn forecast_window(
    invoice_date: NaiveDate,
    max_forecast_date: Option<NaiveDate>,
    first_transaction_date: Option<NaiveDate>,
) -> Vec<NaiveDate> {
    let Some(end) = max_forecast_date else {
        return Vec::new();
    };
    // the window opens once the invoice exists and payment history is complete
    let start = first_transaction_date.map_or(invoice_date, |first| first.max(invoice_date));
    month_range(start, end)
}

/// Picks one month of `window`, deterministically for a given invoice id.
///
/// ChaCha8 keeps the stream fixed across `rand` releases, so a given id and
/// window map to the same month on every build.
pub fn select_forecast_date(invoice_id: &str, window: &[NaiveDate]) -> Option<NaiveDate> {
    let mut rng = ChaCha8Rng::seed_from_u64(stable_hash(invoice_id));
    window.choose(&mut rng).copied()
}

struct Outcome<'r> {
    history: Vec<&'r ConsolidatedRow>,
    collected_date: Option<NaiveDate>,
    forecast_date: Option<NaiveDate>,
    final_remaining_inv_pct: f64,
}

impl Outcome<'_> {
    fn invoice_date(&self) -> Option<NaiveDate> {
        self.history.first().map(|r| r.invoice.invoice_date)
    }
}

/// Labels every invoice in the consolidated rows.
///
/// Rows whose outcome is inconsistent with the invoice record are excluded
/// through named filters; a missing label on a surviving row is fatal.
pub fn label(
    rows: &[ConsolidatedRow],
    collected_threshold: f64,
) -> Result<(Vec<LabeledRow>, FilterReport)> {
    let first_transaction_date = rows
        .iter()
        .filter(|r| r.has_payment())
        .map(|r| r.transaction_date)
        .min();

    let outcomes = group_by_invoice(rows)
        .into_values()
        .map(|history| assign_outcome(history, collected_threshold, first_transaction_date))
        .collect::<Result<Vec<_>>>()?;
    let invoice_count = outcomes.len();

    let collected_dates = outcomes.iter().filter_map(|o| o.collected_date);
    let collected_range = collected_dates
        .clone()
        .min()
        .zip(collected_dates.max());

    let (outcomes, report) = FilterSet::new("Filtering", "preprocessed invoices")
        .exclude("No forecast date in observed window", |o: &Outcome| {
            o.forecast_date.is_none()
        })
        .exclude("Collected < opened", |o: &Outcome| {
            matches!((o.collected_date, o.invoice_date()), (Some(c), Some(i)) if c < i)
        })
        .exclude("Collected, not cleared", |o: &Outcome| {
            o.collected_date.is_some()
                && o.history
                    .first()
                    .is_some_and(|r| r.invoice.status != InvoiceStatus::Cleared)
        })
        .exclude("Cleared < collected", |o: &Outcome| {
            let cleared = o.history.first().and_then(|r| r.invoice.cleared_date);
            matches!((cleared, o.collected_date), (Some(cl), Some(co)) if cl < co)
        })
        .exclude(
            "Opened outside of collections date range: could be missing payments",
            move |o: &Outcome| match (collected_range, o.invoice_date()) {
                (Some((first, last)), Some(opened)) => opened < first || opened > last,
                _ => false,
            },
        )
        .apply(outcomes);

    let mut labeled = Vec::with_capacity(outcomes.len());
    let mut missing_labels = 0;
    for outcome in outcomes {
        match label_outcome(&outcome)? {
            Some(row) => labeled.push(row),
            None => missing_labels += 1,
        }
    }

    if missing_labels > 0 {
        return Err(ForecastError::LabelNotPopulated {
            count: missing_labels,
        });
    }

    info!(
        "Labeled {} of {} invoices ({} collected)",
        labeled.len(),
        invoice_count,
        labeled.iter().filter(|r| r.collected_date.is_some()).count()
    );

    Ok((labeled, report))
}

fn assign_outcome<'r>(
    history: Vec<&'r ConsolidatedRow>,
    collected_threshold: f64,
    first_transaction_date: Option<NaiveDate>,
) -> Result<Outcome<'r>> {
    let (Some(first), Some(last)) = (history.first(), history.last()) else {
        return Err(ForecastError::InvoicesDropped {
            stage: "labeling",
            expected: 1,
            actual: 0,
        });
    };

    let invoice_id = first.invoice_id();
    let invoice_date = first.invoice.invoice_date;

    let collected_date = history
        .iter()
        .find(|r| r.amount_pmt_pct_cum >= collected_threshold)
        .map(|r| r.transaction_date);

    // a collected invoice samples up to its collection, an uncollected one
    // up to the last date it was seen open
    let collected_window = forecast_window(invoice_date, collected_date, first_transaction_date);
    let uncollected_window =
        forecast_window(invoice_date, Some(first.final_date_open), first_transaction_date);

    check_sampling_windows(
        invoice_id,
        collected_date,
        first.final_date_open,
        &collected_window,
        &uncollected_window,
    )?;

    let forecast_date = select_forecast_date(invoice_id, &collected_window)
        .or_else(|| select_forecast_date(invoice_id, &uncollected_window));

    debug!(
        "Invoice '{}': collected {:?}, forecast date {:?}",
        invoice_id, collected_date, forecast_date
    );

    let final_remaining_inv_pct = 1.0 - last.amount_pmt_pct_cum;

    Ok(Outcome {
        history,
        collected_date,
        forecast_date,
        final_remaining_inv_pct,
    })
}

/// An invoice collected while still open samples from a leading run of the
/// months it was open.
fn check_sampling_windows(
    invoice_id: &str,
    collected_date: Option<NaiveDate>,
    final_date_open: NaiveDate,
    collected_window: &[NaiveDate],
    uncollected_window: &[NaiveDate],
) -> Result<()> {
    let Some(collected_date) = collected_date else {
        return Ok(());
    };
    if collected_date <= final_date_open && !uncollected_window.starts_with(collected_window) {
        return Err(ForecastError::SamplingInconsistency(format!(
            "invoice '{}' collected window {:?} is not a prefix of its open window {:?}",
            invoice_id, collected_window, uncollected_window
        )));
    }
    Ok(())
}

fn label_outcome(outcome: &Outcome) -> Result<Option<LabeledRow>> {
    let Some(forecast_date) = outcome.forecast_date else {
        return Ok(None);
    };

    let snapshot = resolve_invoice(&outcome.history, forecast_date)?;
    let resolution_date = outcome.collected_date.unwrap_or(snapshot.final_date_open);
    let months_to_final_state = months_between(forecast_date, resolution_date) + 1;
    if months_to_final_state < 1 {
        return Ok(None);
    }

    let collected_per_month = (snapshot.remaining_inv_pct - outcome.final_remaining_inv_pct)
        / f64::from(months_to_final_state);
    if !collected_per_month.is_finite() {
        return Ok(None);
    }

    Ok(Some(LabeledRow {
        snapshot,
        collected_date: outcome.collected_date,
        final_remaining_inv_pct: outcome.final_remaining_inv_pct,
        collected_per_month,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocessing::PreparedInvoice;
    use std::sync::Arc;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn invoice(
        id: &str,
        opened: NaiveDate,
        status: InvoiceStatus,
        cleared: Option<NaiveDate>,
    ) -> Arc<PreparedInvoice> {
        Arc::new(PreparedInvoice {
            invoice_id: id.to_string(),
            company_id: "C1".to_string(),
            customer_id: "K1".to_string(),
            currency: "USD".to_string(),
            amount: 100.0,
            exchange_rate: 1.0,
            converted_amount: 100.0,
            invoice_date: opened,
            due_date: opened + chrono::Days::new(31),
            cleared_date: cleared,
            status,
            invoice_month: crate::utils::month_start(opened),
            due_month: crate::utils::month_start(opened + chrono::Days::new(31)),
            months_allowed: 1,
            inv_pct_of_company_total: 1.0,
        })
    }

    fn row(
        invoice: &Arc<PreparedInvoice>,
        on: NaiveDate,
        cum: f64,
        final_date_open: NaiveDate,
    ) -> ConsolidatedRow {
        ConsolidatedRow {
            invoice: Arc::clone(invoice),
            amount_pmt: (cum > 0.0).then_some(cum * 100.0),
            exchange_rate_pmt: (cum > 0.0).then_some(1.0),
            transaction_date: on,
            transaction_month: crate::utils::month_start(on),
            final_date_open,
            amount_pmt_pct: cum,
            amount_pmt_pct_cum: cum,
        }
    }

    #[test]
    fn test_sampler_is_deterministic() {
        let window = month_range(date(2020, 1, 1), date(2020, 12, 31));
        for id in ["INV-1", "INV-2", "a-much-longer-invoice-identifier"] {
            let first = select_forecast_date(id, &window);
            let second = select_forecast_date(id, &window);
            assert_eq!(first, second);
            assert!(window.contains(&first.unwrap()));
        }
    }

    #[test]
    fn test_sampler_output_is_pinned() {
        let window = month_range(date(2020, 1, 1), date(2020, 12, 31));
        assert_eq!(window.len(), 12);
        assert_eq!(select_forecast_date("INV-1", &window), Some(date(2020, 6, 1)));
        assert_eq!(select_forecast_date("INV-2", &window), Some(date(2020, 12, 1)));
        assert_eq!(select_forecast_date("INV-001", &window), Some(date(2020, 4, 1)));
    }

    #[test]
    fn test_sampling_windows_must_share_a_prefix() {
        let jan_to_mar = month_range(date(2021, 1, 1), date(2021, 3, 1));
        let jan_to_feb = month_range(date(2021, 1, 1), date(2021, 2, 1));
        let feb_to_mar = month_range(date(2021, 2, 1), date(2021, 3, 1));

        assert!(check_sampling_windows(
            "A",
            Some(date(2021, 2, 10)),
            date(2021, 3, 5),
            &jan_to_feb,
            &jan_to_mar,
        )
        .is_ok());
        assert!(
            check_sampling_windows("A", None, date(2021, 3, 5), &feb_to_mar, &jan_to_mar).is_ok()
        );
        // collected after it was last seen open: filtered later, not a sampling fault
        assert!(check_sampling_windows(
            "A",
            Some(date(2021, 3, 10)),
            date(2021, 2, 5),
            &jan_to_mar,
            &jan_to_feb,
        )
        .is_ok());

        let err = check_sampling_windows(
            "A",
            Some(date(2021, 3, 1)),
            date(2021, 3, 5),
            &feb_to_mar,
            &jan_to_mar,
        )
        .unwrap_err();
        assert!(matches!(err, ForecastError::SamplingInconsistency(_)));
        assert!(err.is_integrity_violation());
    }

    #[test]
    fn test_sampler_spreads_across_window() {
        let window = month_range(date(2020, 1, 1), date(2020, 12, 31));
        let distinct: std::collections::BTreeSet<NaiveDate> = (0..200)
            .filter_map(|i| select_forecast_date(&format!("INV-{}", i), &window))
            .collect();
        assert!(distinct.len() > 6);
    }

    #[test]
    fn test_empty_window() {
        assert_eq!(select_forecast_date("INV-1", &[]), None);
        assert!(forecast_window(date(2021, 3, 1), Some(date(2021, 2, 1)), None).is_empty());
        assert!(forecast_window(date(2021, 3, 1), None, None).is_empty());
    }

    #[test]
    fn test_window_starts_when_payment_data_starts() {
        let window = forecast_window(
            date(2020, 10, 15),
            Some(date(2021, 2, 1)),
            Some(date(2020, 12, 3)),
        );
        assert_eq!(window, vec![date(2020, 12, 1), date(2021, 1, 1), date(2021, 2, 1)]);
    }

    /// Collected at its opening date, so it widens the observed collection
    /// range without being excluded itself.
    fn anchor() -> ConsolidatedRow {
        let z = invoice("Z", date(2020, 12, 1), InvoiceStatus::Cleared, Some(date(2020, 12, 1)));
        row(&z, date(2020, 12, 1), 1.0, date(2020, 12, 1))
    }

    #[test]
    fn test_collected_invoice_label() {
        let inv = invoice("A", date(2021, 1, 1), InvoiceStatus::Cleared, Some(date(2021, 1, 15)));
        let rows = vec![row(&inv, date(2021, 1, 15), 1.0, date(2021, 1, 15)), anchor()];

        let (labeled, _) = label(&rows, 1.0).unwrap();
        assert_eq!(labeled.len(), 2);

        let row = labeled.iter().find(|r| r.invoice_id() == "A").unwrap();
        assert_eq!(row.collected_date, Some(date(2021, 1, 15)));
        assert_eq!(row.forecast_date(), date(2021, 1, 1));
        assert_eq!(row.snapshot.remaining_inv_pct, 1.0);
        assert_eq!(row.final_remaining_inv_pct, 0.0);
        assert!((row.collected_per_month - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_partial_collection_label() {
        let collected = invoice(
            "A",
            date(2021, 1, 5),
            InvoiceStatus::Cleared,
            Some(date(2021, 3, 10)),
        );
        let open = invoice("B", date(2021, 1, 5), InvoiceStatus::Open, None);
        let rows = vec![
            row(&collected, date(2021, 1, 20), 0.5, date(2021, 3, 10)),
            row(&collected, date(2021, 3, 10), 1.0, date(2021, 3, 10)),
            row(&open, date(2021, 2, 10), 0.25, date(2021, 3, 10)),
            anchor(),
        ];

        let (labeled, _) = label(&rows, 1.0).unwrap();
        assert_eq!(labeled.len(), 3);

        for row in &labeled {
            let months = months_between(row.forecast_date(), row.resolution_date()) + 1;
            let expected =
                (row.snapshot.remaining_inv_pct - row.final_remaining_inv_pct) / months as f64;
            assert!((row.collected_per_month - expected).abs() < 1e-12);
            assert!(row.forecast_date() <= row.resolution_date());
        }

        let open_row = labeled.iter().find(|r| r.invoice_id() == "B").unwrap();
        assert_eq!(open_row.collected_date, None);
        assert!((open_row.final_remaining_inv_pct - 0.75).abs() < 1e-12);
        assert!(open_row.forecast_date() >= date(2021, 1, 1));
        assert!(open_row.forecast_date() <= date(2021, 3, 1));
    }

    #[test]
    fn test_inconsistent_outcomes_are_filtered() {
        let end = date(2021, 3, 31);
        let good = invoice("A", date(2021, 2, 1), InvoiceStatus::Cleared, Some(date(2021, 2, 1)));
        let not_cleared = invoice("B", date(2021, 2, 1), InvoiceStatus::Open, None);
        let cleared_early = invoice(
            "C",
            date(2021, 2, 1),
            InvoiceStatus::Cleared,
            Some(date(2021, 1, 10)),
        );
        let opened_late = invoice("D", date(2021, 3, 20), InvoiceStatus::Open, None);
        let rows = vec![
            row(&good, date(2021, 2, 1), 1.0, date(2021, 2, 1)),
            row(&not_cleared, date(2021, 2, 5), 1.0, date(2021, 2, 5)),
            row(&cleared_early, date(2021, 2, 10), 1.0, date(2021, 1, 10)),
            row(&opened_late, end, 0.0, end),
        ];

        let (labeled, report) = label(&rows, 1.0).unwrap();
        let ids: Vec<&str> = labeled.iter().map(|r| r.invoice_id()).collect();
        assert_eq!(ids, vec!["A"]);
        assert!((labeled[0].collected_per_month - 1.0).abs() < 1e-12);

        assert_eq!(report.len(), 5);
        assert_eq!(
            report.step("No forecast date in observed window").unwrap().pct_of_unfiltered,
            0.0
        );
        assert_eq!(report.step("Collected < opened").unwrap().pct_of_unfiltered, 0.0);
        assert_eq!(report.step("Collected, not cleared").unwrap().pct_of_unfiltered, 0.25);
        assert_eq!(report.step("Cleared < collected").unwrap().pct_of_unfiltered, 0.25);
        assert_eq!(
            report
                .step("Opened outside of collections date range: could be missing payments")
                .unwrap()
                .pct_of_unfiltered,
            0.25
        );
    }

    #[test]
    fn test_labels_do_not_depend_on_row_order() {
        let a = invoice("A", date(2021, 1, 1), InvoiceStatus::Cleared, Some(date(2021, 6, 1)));
        let b = invoice("B", date(2021, 2, 1), InvoiceStatus::Open, None);
        let mut rows = vec![
            anchor(),
            row(&a, date(2021, 2, 1), 0.2, date(2021, 6, 1)),
            row(&a, date(2021, 4, 1), 0.6, date(2021, 6, 1)),
            row(&a, date(2021, 6, 1), 1.0, date(2021, 6, 1)),
            row(&b, date(2021, 3, 1), 0.3, date(2021, 6, 1)),
        ];

        let (forward, _) = label(&rows, 1.0).unwrap();
        rows.reverse();
        let (backward, _) = label(&rows, 1.0).unwrap();

        assert_eq!(forward.len(), 3);
        assert_eq!(forward, backward);
    }
}

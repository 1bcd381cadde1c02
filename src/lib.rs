//! # Invoice Collection Forecast
//!
//! A library for turning historical invoices and their payment transactions
//! into leak-free, time-ordered training data for forecasting when open
//! invoices will be collected, and into serving-time features for the
//! invoices that are still open.
//!
//! ## Core Concepts
//!
//! - **Consolidated history**: one row per invoice and payment event with a running cumulative paid fraction
//! - **Forecast date**: the month start a prediction is made at, sampled deterministically per invoice for training
//! - **Point-in-time snapshot**: an invoice's payment state using only payments strictly before the forecast date
//! - **Collection rate**: the fraction of the invoice collected per month from forecast date to resolution
//! - **Filter report**: every exclusion of noisy data is a named, counted step; integrity violations abort the run
//! - **Time-ordered splits**: rows ranked by forecast date so that test and validation data always lie in the future
//!
//! ## Example
//!
//! ```rust,ignore
//! use invoice_collection_forecast::*;
//! use chrono::NaiveDate;
//!
//! let invoices = vec![RawInvoice {
//!     id: Some("INV-1".to_string()),
//!     company_id: Some("ACME".to_string()),
//!     customer_id: Some("CUST-7".to_string()),
//!     currency: Some("USD".to_string()),
//!     amount: Some(100.0),
//!     exchange_rate: Some(1.0),
//!     invoice_date: NaiveDate::from_ymd_opt(2021, 1, 1),
//!     due_date: NaiveDate::from_ymd_opt(2021, 2, 1),
//!     cleared_date: NaiveDate::from_ymd_opt(2021, 1, 10),
//!     status: Some(InvoiceStatus::Cleared),
//! }];
//! let payments = vec![RawPayment {
//!     invoice_id: Some("INV-1".to_string()),
//!     transaction_date: NaiveDate::from_ymd_opt(2021, 1, 10),
//!     amount: Some(100.0),
//!     exchange_rate: Some(1.0),
//!     converted_amount: Some(100.0),
//! }];
//!
//! let config = PipelineConfig::default();
//! let training = build_training_data(&invoices, &payments, &config).unwrap();
//! println!("{}", training.report.to_json().unwrap());
//!
//! let model = train_collection_model(&my_trainer, &training.splits, &config.model).unwrap();
//! let open = prepare_open_invoices(&invoices, &payments, &config).unwrap();
//! let predictions = predict_open_invoices(&my_predictor, &model, &open, &config.model).unwrap();
//! ```

pub mod config;
pub mod error;
pub mod features;
pub mod filters;
pub mod labeling;
pub mod model;
pub mod pipeline;
pub mod point_in_time;
pub mod preprocessing;
pub mod schema;
pub mod split;
pub mod utils;
pub mod validation;

pub use config::{Distribution, ModelSettings, PipelineConfig};
pub use error::{ForecastError, Result};
pub use features::{
    company_amount_shares, featurize, featurize_labeled, normalize_company_amounts, FeatureRow,
    FeatureValue, InvoiceFeatures, TrainingRow,
};
pub use filters::{apply_filters, FilterReport, FilterSet, FilterStepStats};
pub use labeling::{forecast_window, label, select_forecast_date, LabeledRow};
pub use model::{
    evaluate_model, monthly_forecast_error, train_collection_model, FeatureTable, ModelMetrics,
    ModelRegistry, Predictor, SelectionMetric, Trainer, TrainingRequest,
};
pub use pipeline::{
    apply_payments_cutoff, build_training_data, predict_open_invoices, prepare_open_invoices,
    InvoicePrediction, OpenInvoiceFeatures, TrainingData, TrainingPipeline,
};
pub use point_in_time::{resolve, resolve_with, Snapshot};
pub use preprocessing::{preprocess, ConsolidatedRow, PreparedInvoice, PreparedPayment};
pub use schema::{InputSchema, InvoiceStatus, RawInvoice, RawPayment};
pub use split::{split, DataSplits};
pub use validation::{validate_invoices, validate_payment_references, validate_payments, Validate};

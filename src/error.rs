use chrono::NaiveDate;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ForecastError {
    #[error("Missing {field} in {dataset}: {missing} of {rows} rows have no value")]
    MissingValues {
        dataset: &'static str,
        field: &'static str,
        missing: usize,
        rows: usize,
    },

    #[error("Non-positive {field} in {dataset}: {count} rows are <= 0")]
    NonPositiveValues {
        dataset: &'static str,
        field: &'static str,
        count: usize,
    },

    #[error("Converted amounts populated inconsistently from amounts in {count} payment rows")]
    InconsistentConvertedAmounts { count: usize },

    #[error("Not all payments have invoice data: {count} payment rows reference unknown invoices (e.g. '{example}')")]
    UnknownInvoiceReferences { count: usize, example: String },

    #[error("Invoice ids are not unique: {count} rows repeat an id (e.g. '{example}')")]
    DuplicateInvoiceIds { count: usize, example: String },

    #[error("Payment amount {payment_amount} > invoice amount {invoice_amount} for invoice '{invoice_id}'")]
    PaymentExceedsInvoice {
        invoice_id: String,
        payment_amount: f64,
        invoice_amount: f64,
    },

    #[error("Multiple rows for invoice '{invoice_id}' after {stage}")]
    DuplicateRows {
        stage: &'static str,
        invoice_id: String,
    },

    #[error("Invoices dropped in {stage}: expected {expected}, got {actual}")]
    InvoicesDropped {
        stage: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Forecast date {forecast_date} precedes the month invoice '{invoice_id}' was opened")]
    ForecastBeforeInvoice {
        invoice_id: String,
        forecast_date: NaiveDate,
    },

    #[error("Forecast date sampling inconsistency: {0}")]
    SamplingInconsistency(String),

    #[error("Collection rate not populated for {count} rows")]
    LabelNotPopulated { count: usize },

    #[error("Company amount normalization does not sum to 1 for company '{company_id}' (sum = {sum})")]
    CompanyNormalization { company_id: String, sum: f64 },

    #[error("Split allocation covers {allocated} rows but {expected} were provided")]
    SplitCoverage { expected: usize, allocated: usize },

    #[error("Invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    #[error("Model collaborator error: {0}")]
    Model(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl ForecastError {
    /// True for errors that signal broken input data rather than a broken
    /// configuration or collaborator.
    pub fn is_integrity_violation(&self) -> bool {
        !matches!(
            self,
            ForecastError::InvalidConfig(_)
                | ForecastError::Model(_)
                | ForecastError::SerializationError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ForecastError>;

use chrono::NaiveDate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    #[schemars(description = "The invoice has not been settled; cleared_date is empty")]
    Open,

    #[schemars(description = "The invoice has been settled; cleared_date is populated")]
    Cleared,
}

/// Invoice record as delivered by the invoicing platform.
///
/// Required fields are optional here so that missing values can be reported
/// by the validator instead of failing deserialization row by row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RawInvoice {
    #[schemars(description = "Unique invoice identifier")]
    pub id: Option<String>,

    #[schemars(description = "The company issuing the invoice")]
    pub company_id: Option<String>,

    #[schemars(description = "The customer the invoice is billed to")]
    pub customer_id: Option<String>,

    #[schemars(description = "ISO currency code of the invoice amount")]
    pub currency: Option<String>,

    #[schemars(description = "Invoice amount in the invoice currency. Must be > 0.")]
    pub amount: Option<f64>,

    #[schemars(description = "Rate converting the invoice currency to the company root currency. Must be > 0.")]
    pub exchange_rate: Option<f64>,

    #[schemars(description = "Date the invoice was opened (YYYY-MM-DD)")]
    pub invoice_date: Option<NaiveDate>,

    #[schemars(description = "Date payment is due (YYYY-MM-DD). Invoices without one are filtered out.")]
    pub due_date: Option<NaiveDate>,

    #[schemars(description = "Date the invoice was cleared. Empty while the invoice is OPEN.")]
    pub cleared_date: Option<NaiveDate>,

    #[schemars(description = "OPEN or CLEARED")]
    pub status: Option<InvoiceStatus>,
}

/// Payment transaction against an invoice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RawPayment {
    #[schemars(description = "Invoice the payment applies to. Must exist in the invoice set.")]
    pub invoice_id: Option<String>,

    #[schemars(description = "Date of the payment transaction (YYYY-MM-DD)")]
    pub transaction_date: Option<NaiveDate>,

    #[schemars(description = "Paid amount in the invoice currency. Must be > 0 when present.")]
    pub amount: Option<f64>,

    #[schemars(description = "Rate converting the payment currency to the company root currency. Must be > 0.")]
    pub exchange_rate: Option<f64>,

    #[schemars(description = "Paid amount in the company root currency. Populated exactly when amount is.")]
    pub converted_amount: Option<f64>,
}

/// The two input tables, used for schema export.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct InputSchema {
    #[schemars(description = "All invoices, open and cleared")]
    pub invoices: Vec<RawInvoice>,

    #[schemars(description = "All payment transactions against the invoices")]
    pub payments: Vec<RawPayment>,
}

impl InputSchema {
    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(InputSchema)
    }

    pub fn schema_as_json() -> Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }
}

use crate::error::{ForecastError, Result};
use chrono::NaiveDate;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Response distribution hint passed to the external trainer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Distribution {
    #[schemars(description = "Robust to the bi-modal shape of collection rates (default)")]
    Huber,
    Laplace,
    Gamma,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct ModelSettings {
    #[schemars(description = "Feature columns the model is trained on")]
    pub predictors: Vec<String>,

    #[schemars(description = "Regression target column")]
    pub label_column: String,

    #[schemars(description = "Row weight column")]
    pub weight_column: String,

    pub distribution: Distribution,

    #[schemars(description = "Wall-clock budget for the model search, in seconds")]
    pub time_budget_secs: u64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            predictors: [
                "months_allowed",
                "amount_inv",
                "inv_pct_of_company_total",
                "currency",
                "months_open",
                "due_per_month",
                "remaining_inv_pct",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            label_column: "collected_per_month".to_string(),
            weight_column: "inv_company_weight".to_string(),
            distribution: Distribution::Huber,
            time_budget_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(default)]
pub struct PipelineConfig {
    #[schemars(description = "Invoices with payment terms longer than this many months are outliers")]
    pub max_months_allowed: i32,

    #[schemars(description = "Upper clip bound for months_open and month_due; everything beyond is one 'far future' bucket")]
    pub month_clip_upper: i32,

    #[schemars(description = "Number of rank buckets forecast dates are scaled to")]
    pub fold_buckets: u32,

    #[schemars(description = "Rows in buckets <= this value are used for training")]
    pub train_max_fold: u32,

    #[schemars(description = "Rows in buckets above train_max_fold and <= this value are used for testing; the rest validate")]
    pub test_max_fold: u32,

    #[schemars(description = "Training only: payments on or after this date are excluded (incomplete trailing period)")]
    pub payments_cutoff: Option<NaiveDate>,

    #[schemars(description = "Cumulative paid fraction (after rounding to 4 decimals) at which an invoice counts as collected")]
    pub collected_threshold: f64,

    pub model: ModelSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_months_allowed: 3,
            month_clip_upper: 13,
            fold_buckets: 6,
            train_max_fold: 3,
            test_max_fold: 4,
            payments_cutoff: None,
            collected_threshold: 1.0,
            model: ModelSettings::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: PipelineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_months_allowed < 0 {
            return Err(ForecastError::InvalidConfig(format!(
                "max_months_allowed must be >= 0, got {}",
                self.max_months_allowed
            )));
        }

        if self.month_clip_upper < 1 {
            return Err(ForecastError::InvalidConfig(format!(
                "month_clip_upper must be >= 1, got {}",
                self.month_clip_upper
            )));
        }

        if self.fold_buckets == 0
            || self.train_max_fold > self.test_max_fold
            || self.test_max_fold > self.fold_buckets
        {
            return Err(ForecastError::InvalidConfig(format!(
                "fold bounds must satisfy train_max_fold <= test_max_fold <= fold_buckets, got {} <= {} <= {}",
                self.train_max_fold, self.test_max_fold, self.fold_buckets
            )));
        }

        if !(self.collected_threshold > 0.0 && self.collected_threshold <= 1.0) {
            return Err(ForecastError::InvalidConfig(format!(
                "collected_threshold must be in (0, 1], got {}",
                self.collected_threshold
            )));
        }

        if self.model.predictors.is_empty() {
            return Err(ForecastError::InvalidConfig(
                "at least one predictor is required".to_string(),
            ));
        }

        Ok(())
    }

    pub fn schema_as_json() -> Result<String> {
        let schema = schemars::schema_for!(PipelineConfig);
        Ok(serde_json::to_string_pretty(&schema)?)
    }
}

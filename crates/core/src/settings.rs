use std::collections::HashSet;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_TAX_RATE_BPS: u32 = 10_000;
const MAX_INVOICE_TERMS_DAYS: u32 = 365;

/// Organization settings persisted as JSON and validated whenever they are loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "SettingsDocument")]
pub struct OrganizationSettings {
    pub theme: Theme,
    pub features: FeatureFlags,
    pub timezone: String,
    pub tax_rate_bps: u32,
    pub invoice_terms_days: u32,
    pub workflows: Vec<Workflow>,
}

impl OrganizationSettings {
    /// Parses and validates a stored settings blob.
    pub fn parse(json: &str) -> Result<Self, SettingsError> {
        let document: SettingsDocument = serde_json::from_str(json)?;
        Self::try_from(document)
    }

    pub fn to_json(&self) -> Result<String, SettingsError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn tz(&self) -> Tz {
        // Validated on construction.
        self.timezone.parse().unwrap_or(Tz::UTC)
    }

    /// Returns the job intake wizard if one is configured.
    pub fn job_intake(&self) -> Option<&[WizardStep]> {
        self.workflows.iter().find_map(|workflow| match workflow {
            Workflow::JobIntake { steps } => Some(steps.as_slice()),
            _ => None,
        })
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        self.theme.validate()?;
        if self.timezone.parse::<Tz>().is_err() {
            return Err(SettingsError::UnknownTimezone(self.timezone.clone()));
        }
        if self.tax_rate_bps > MAX_TAX_RATE_BPS {
            return Err(SettingsError::TaxRateOutOfRange(self.tax_rate_bps));
        }
        if self.invoice_terms_days == 0 || self.invoice_terms_days > MAX_INVOICE_TERMS_DAYS {
            return Err(SettingsError::InvoiceTermsOutOfRange(self.invoice_terms_days));
        }
        let mut kinds = HashSet::new();
        for workflow in &self.workflows {
            if !kinds.insert(workflow.kind()) {
                return Err(SettingsError::DuplicateWorkflow(workflow.kind()));
            }
            workflow.validate()?;
        }
        Ok(())
    }
}

impl Default for OrganizationSettings {
    fn default() -> Self {
        Self {
            theme: Theme::default(),
            features: FeatureFlags::default(),
            timezone: default_timezone(),
            tax_rate_bps: 0,
            invoice_terms_days: default_invoice_terms_days(),
            workflows: Vec::new(),
        }
    }
}

impl TryFrom<SettingsDocument> for OrganizationSettings {
    type Error = SettingsError;

    fn try_from(document: SettingsDocument) -> Result<Self, Self::Error> {
        let settings = Self {
            theme: document.theme,
            features: document.features,
            timezone: document.timezone,
            tax_rate_bps: document.tax_rate_bps,
            invoice_terms_days: document.invoice_terms_days,
            workflows: document.workflows,
        };
        settings.validate()?;
        Ok(settings)
    }
}

/// Wire shape of the settings blob before validation.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsDocument {
    #[serde(default)]
    theme: Theme,
    #[serde(default)]
    features: FeatureFlags,
    #[serde(default = "default_timezone")]
    timezone: String,
    #[serde(default)]
    tax_rate_bps: u32,
    #[serde(default = "default_invoice_terms_days")]
    invoice_terms_days: u32,
    #[serde(default)]
    workflows: Vec<Workflow>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_invoice_terms_days() -> u32 {
    30
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Theme {
    #[serde(default = "Theme::default_primary_color")]
    pub primary_color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo_url: Option<String>,
}

impl Theme {
    fn default_primary_color() -> String {
        "#2f6f4f".to_string()
    }

    fn validate(&self) -> Result<(), SettingsError> {
        let hex = self.primary_color.strip_prefix('#').unwrap_or("");
        if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(SettingsError::InvalidColor(self.primary_color.clone()));
        }
        if let Some(url) = &self.logo_url {
            if !url.starts_with("https://") {
                return Err(SettingsError::InsecureLogoUrl(url.clone()));
            }
        }
        Ok(())
    }
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            primary_color: Self::default_primary_color(),
            logo_url: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeatureFlags {
    #[serde(default = "enabled")]
    pub estimates: bool,
    #[serde(default)]
    pub online_payments: bool,
    #[serde(default)]
    pub client_portal: bool,
}

fn enabled() -> bool {
    true
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            estimates: true,
            online_payments: false,
            client_portal: false,
        }
    }
}

/// Workflow configuration, one entry per kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum Workflow {
    JobIntake { steps: Vec<WizardStep> },
    InvoiceReminder { days_after_due: Vec<u32> },
    EstimateFollowUp { after_days: u32 },
}

impl Workflow {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JobIntake { .. } => "job_intake",
            Self::InvoiceReminder { .. } => "invoice_reminder",
            Self::EstimateFollowUp { .. } => "estimate_follow_up",
        }
    }

    fn validate(&self) -> Result<(), SettingsError> {
        match self {
            Self::JobIntake { steps } => {
                if steps.is_empty() {
                    return Err(SettingsError::EmptyWizard);
                }
                let mut fields = HashSet::new();
                for step in steps {
                    if !fields.insert(step.field()) {
                        return Err(SettingsError::DuplicateField(step.field().to_string()));
                    }
                    step.validate()?;
                }
                Ok(())
            }
            Self::InvoiceReminder { days_after_due } => {
                if days_after_due.is_empty() || days_after_due.iter().any(|day| *day == 0) {
                    return Err(SettingsError::InvalidReminderSchedule);
                }
                Ok(())
            }
            Self::EstimateFollowUp { after_days } => {
                if *after_days == 0 {
                    return Err(SettingsError::InvalidReminderSchedule);
                }
                Ok(())
            }
        }
    }
}

/// One step of a configurable form wizard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum WizardStep {
    Text {
        field: String,
        label: String,
        #[serde(default)]
        required: bool,
    },
    Choice {
        field: String,
        label: String,
        options: Vec<String>,
    },
    Date {
        field: String,
        label: String,
    },
    Number {
        field: String,
        label: String,
        #[serde(default)]
        min: Option<i64>,
        #[serde(default)]
        max: Option<i64>,
    },
}

impl WizardStep {
    pub fn field(&self) -> &str {
        match self {
            Self::Text { field, .. }
            | Self::Choice { field, .. }
            | Self::Date { field, .. }
            | Self::Number { field, .. } => field,
        }
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.field().trim().is_empty() {
            return Err(SettingsError::EmptyField);
        }
        match self {
            Self::Choice { field, options, .. } => {
                let distinct: HashSet<&str> = options.iter().map(String::as_str).collect();
                if options.len() < 2 || distinct.len() != options.len() {
                    return Err(SettingsError::InvalidChoice(field.clone()));
                }
            }
            Self::Number {
                field,
                min: Some(min),
                max: Some(max),
                ..
            } if min > max => {
                return Err(SettingsError::InvalidRange(field.clone()));
            }
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to decode settings json: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("theme color must be #RRGGBB (got {0})")]
    InvalidColor(String),
    #[error("logo url must use https (got {0})")]
    InsecureLogoUrl(String),
    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),
    #[error("tax rate {0} bps exceeds 10000")]
    TaxRateOutOfRange(u32),
    #[error("invoice terms must be between 1 and 365 days (got {0})")]
    InvoiceTermsOutOfRange(u32),
    #[error("workflow {0} is configured more than once")]
    DuplicateWorkflow(&'static str),
    #[error("job intake wizard must have at least one step")]
    EmptyWizard,
    #[error("wizard field {0} is declared more than once")]
    DuplicateField(String),
    #[error("wizard step field must not be empty")]
    EmptyField,
    #[error("choice step {0} needs at least two distinct options")]
    InvalidChoice(String),
    #[error("number step {0} has min greater than max")]
    InvalidRange(String),
    #[error("reminder schedule must contain positive day offsets")]
    InvalidReminderSchedule,
}

//! Tenant-scoped business entities. Every type here carries the owning
//! organization; none of the input types do, the storage layer stamps it from
//! the bound tenant context.

use std::{fmt, str::FromStr};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::billing::{LineItem, Totals};
use crate::ids::{ClientId, EstimateId, InvoiceId, JobId, OrganizationId, PropertyId, VisitId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EntityError {
    #[error("unknown {kind} status: {value}")]
    UnknownStatus { kind: &'static str, value: String },
    #[error("cannot move {kind} from {from} to {to}")]
    InvalidTransition {
        kind: &'static str,
        from: &'static str,
        to: &'static str,
    },
    #[error("{0}")]
    Validation(String),
}

macro_rules! status_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = EntityError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok(Self::$variant),)+
                    other => Err(EntityError::UnknownStatus {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

status_enum!(
    /// Lifecycle of a job.
    JobStatus, "job", {
        Draft => "draft",
        Scheduled => "scheduled",
        InProgress => "in_progress",
        Completed => "completed",
        Cancelled => "cancelled",
    }
);

impl JobStatus {
    pub fn can_transition_to(self, next: Self) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Draft, Scheduled)
                | (Draft, Cancelled)
                | (Scheduled, InProgress)
                | (Scheduled, Cancelled)
                | (Scheduled, Draft)
                | (InProgress, Completed)
                | (InProgress, Cancelled)
        )
    }
}

status_enum!(EstimateStatus, "estimate", {
    Draft => "draft",
    Sent => "sent",
    Approved => "approved",
    Declined => "declined",
    Converted => "converted",
});

impl EstimateStatus {
    /// Conversion is its own operation and is not reachable through a plain transition.
    pub fn can_transition_to(self, next: Self) -> bool {
        use EstimateStatus::*;
        matches!(
            (self, next),
            (Draft, Sent) | (Sent, Approved) | (Sent, Declined) | (Declined, Draft)
        )
    }
}

status_enum!(InvoiceStatus, "invoice", {
    Draft => "draft",
    Sent => "sent",
    Paid => "paid",
    Overdue => "overdue",
    Void => "void",
});

impl InvoiceStatus {
    pub fn can_transition_to(self, next: Self) -> bool {
        use InvoiceStatus::*;
        matches!(
            (self, next),
            (Draft, Sent)
                | (Draft, Void)
                | (Sent, Paid)
                | (Sent, Overdue)
                | (Sent, Void)
                | (Overdue, Paid)
                | (Overdue, Void)
        )
    }
}

/// Checks a transition and returns a typed error naming both ends when refused.
pub fn ensure_transition<S>(
    kind: &'static str,
    from: S,
    to: S,
    allowed: impl Fn(S, S) -> bool,
) -> Result<(), EntityError>
where
    S: Copy + Into<&'static str>,
{
    if allowed(from, to) {
        Ok(())
    } else {
        Err(EntityError::InvalidTransition {
            kind,
            from: from.into(),
            to: to.into(),
        })
    }
}

impl From<JobStatus> for &'static str {
    fn from(status: JobStatus) -> Self {
        status.as_str()
    }
}

impl From<EstimateStatus> for &'static str {
    fn from(status: EstimateStatus) -> Self {
        status.as_str()
    }
}

impl From<InvoiceStatus> for &'static str {
    fn from(status: InvoiceStatus) -> Self {
        status.as_str()
    }
}

fn require(value: &str, what: &str) -> Result<(), EntityError> {
    if value.trim().is_empty() {
        Err(EntityError::Validation(format!("{what} must not be empty")))
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Client {
    pub id: ClientId,
    pub organization_id: OrganizationId,
    pub display_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub notes: Option<String>,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewClient {
    pub display_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl NewClient {
    pub fn named(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            email: None,
            phone: None,
            notes: None,
        }
    }

    pub fn validate(&self) -> Result<(), EntityError> {
        require(&self.display_name, "client display name")
    }
}

/// Partial update; absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientUpdate {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Property {
    pub id: PropertyId,
    pub organization_id: OrganizationId,
    pub client_id: ClientId,
    pub address_line: String,
    pub city: String,
    pub region: Option<String>,
    pub postal_code: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewProperty {
    pub address_line: String,
    pub city: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
}

impl NewProperty {
    pub fn validate(&self) -> Result<(), EntityError> {
        require(&self.address_line, "address line")?;
        require(&self.city, "city")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    pub id: JobId,
    pub organization_id: OrganizationId,
    pub client_id: ClientId,
    pub property_id: Option<PropertyId>,
    pub title: String,
    pub description: Option<String>,
    pub status: JobStatus,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewJob {
    pub client_id: ClientId,
    #[serde(default)]
    pub property_id: Option<PropertyId>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn validate(&self) -> Result<(), EntityError> {
        require(&self.title, "job title")
    }

    /// Jobs created with a date start out scheduled.
    pub fn initial_status(&self) -> JobStatus {
        if self.scheduled_for.is_some() {
            JobStatus::Scheduled
        } else {
            JobStatus::Draft
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Visit {
    pub id: VisitId,
    pub organization_id: OrganizationId,
    pub job_id: JobId,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewVisit {
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl NewVisit {
    pub fn validate(&self) -> Result<(), EntityError> {
        if self.ends_at <= self.starts_at {
            return Err(EntityError::Validation(
                "visit must end after it starts".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Estimate {
    pub id: EstimateId,
    pub organization_id: OrganizationId,
    pub client_id: ClientId,
    pub title: String,
    pub line_items: Vec<LineItem>,
    #[serde(flatten)]
    pub totals: Totals,
    pub status: EstimateStatus,
    pub job_id: Option<JobId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewEstimate {
    pub client_id: ClientId,
    pub title: String,
    pub line_items: Vec<LineItem>,
}

impl NewEstimate {
    pub fn validate(&self) -> Result<(), EntityError> {
        require(&self.title, "estimate title")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Invoice {
    pub id: InvoiceId,
    pub organization_id: OrganizationId,
    pub client_id: ClientId,
    pub job_id: Option<JobId>,
    /// Sequential per organization, starting at 1.
    pub number: i64,
    pub line_items: Vec<LineItem>,
    #[serde(flatten)]
    pub totals: Totals,
    pub status: InvoiceStatus,
    pub due_on: NaiveDate,
    pub issued_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewInvoice {
    pub client_id: ClientId,
    #[serde(default)]
    pub job_id: Option<JobId>,
    pub line_items: Vec<LineItem>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_transitions() {
        assert!(JobStatus::Draft.can_transition_to(JobStatus::Scheduled));
        assert!(JobStatus::InProgress.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::InProgress));
        assert!(!JobStatus::Draft.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn invoice_transitions_and_errors() {
        let err = ensure_transition(
            "invoice",
            InvoiceStatus::Paid,
            InvoiceStatus::Void,
            InvoiceStatus::can_transition_to,
        )
        .expect_err("paid invoices are final");
        assert_eq!(
            err,
            EntityError::InvalidTransition {
                kind: "invoice",
                from: "paid",
                to: "void"
            }
        );
        assert!(ensure_transition(
            "invoice",
            InvoiceStatus::Overdue,
            InvoiceStatus::Paid,
            InvoiceStatus::can_transition_to
        )
        .is_ok());
    }

    #[test]
    fn estimate_conversion_is_not_a_plain_transition() {
        assert!(!EstimateStatus::Approved.can_transition_to(EstimateStatus::Converted));
        assert_eq!("in_progress".parse::<JobStatus>().expect("status"), JobStatus::InProgress);
        assert!("paused".parse::<JobStatus>().is_err());
    }

    #[test]
    fn visit_must_end_after_start() {
        let now = Utc::now();
        let visit = NewVisit {
            starts_at: now,
            ends_at: now,
            notes: None,
        };
        assert!(visit.validate().is_err());
    }
}

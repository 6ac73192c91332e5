use chrono::{DateTime, Days, NaiveDate, Utc};
use fieldbook_core::{
    billing::{BillingError, Totals},
    entities::{ensure_transition, EntityError, Invoice, InvoiceStatus, NewInvoice},
    settings::OrganizationSettings,
    ClientId, InvoiceId, JobId, OrganizationId,
};
use sqlx::FromRow;
use tracing::info;

use super::{decode_line_items, encode_line_items};
use crate::{error::DataError, guard::TenantScope, to_rfc3339};

const COLUMNS: &str = "id, organization_id, client_id, job_id, number, line_items_json, subtotal_cents, \
     tax_cents, total_cents, status, due_on, issued_at, paid_at, created_at, updated_at";

pub struct InvoiceRepository<'s> {
    scope: &'s mut TenantScope,
}

impl<'s> InvoiceRepository<'s> {
    pub(crate) fn new(scope: &'s mut TenantScope) -> Self {
        Self { scope }
    }

    /// Creates a draft with the next per-organization number, the
    /// organization's tax rate and a due date from its payment terms.
    pub async fn create(&mut self, new: NewInvoice) -> Result<Invoice, DataError> {
        let settings = self.scope.organization().current().await?.settings;
        self.scope.clients().get(&new.client_id).await?;
        if let Some(job_id) = &new.job_id {
            let job = self.scope.jobs().get(job_id).await?;
            if job.client_id != new.client_id {
                return Err(EntityError::Validation(
                    "job belongs to a different client".to_string(),
                )
                .into());
            }
        }
        let totals = Totals::compute(&new.line_items, settings.tax_rate_bps)?;
        let now = Utc::now();
        let due_on = due_date(&settings, now)?;

        let (number,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(number), 0) + 1 FROM scoped_invoices")
                .fetch_one(self.scope.connection()?)
                .await?;

        let id = InvoiceId::new();
        let stamp = to_rfc3339(now);
        sqlx::query(
            "INSERT INTO scoped_invoices (id, client_id, job_id, number, line_items_json, subtotal_cents, \
             tax_cents, total_cents, status, due_on, issued_at, paid_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, ?, ?)",
        )
        .bind(id.to_string())
        .bind(new.client_id.to_string())
        .bind(new.job_id.map(|id| id.to_string()))
        .bind(number)
        .bind(encode_line_items(&new.line_items)?)
        .bind(totals.subtotal_cents)
        .bind(totals.tax_cents)
        .bind(totals.total_cents)
        .bind(InvoiceStatus::Draft.as_str())
        .bind(due_on)
        .bind(&stamp)
        .bind(&stamp)
        .execute(self.scope.connection()?)
        .await?;
        self.get(&id).await
    }

    pub async fn get(&mut self, id: &InvoiceId) -> Result<Invoice, DataError> {
        let row = sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {COLUMNS} FROM scoped_invoices WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(self.scope.connection()?)
        .await?;
        row.map(|row| row.into_domain(self.scope))
            .transpose()?
            .ok_or_else(|| DataError::not_found("invoice", id))
    }

    pub async fn list(&mut self, status: Option<InvoiceStatus>) -> Result<Vec<Invoice>, DataError> {
        let rows = sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {COLUMNS} FROM scoped_invoices WHERE ? IS NULL OR status = ? ORDER BY number"
        ))
        .bind(status.map(InvoiceStatus::as_str))
        .bind(status.map(InvoiceStatus::as_str))
        .fetch_all(self.scope.connection()?)
        .await?;
        rows.into_iter()
            .map(|row| row.into_domain(self.scope))
            .collect()
    }

    /// Issues a draft; payment terms restart from the issue date.
    pub async fn send(&mut self, id: &InvoiceId) -> Result<Invoice, DataError> {
        let invoice = self.get(id).await?;
        ensure_transition("invoice", invoice.status, InvoiceStatus::Sent, InvoiceStatus::can_transition_to)?;
        let settings = self.scope.organization().current().await?.settings;
        let now = Utc::now();
        let stamp = to_rfc3339(now);
        sqlx::query(
            "UPDATE scoped_invoices SET status = ?, issued_at = ?, due_on = ?, updated_at = ? WHERE id = ?",
        )
        .bind(InvoiceStatus::Sent.as_str())
        .bind(&stamp)
        .bind(due_date(&settings, now)?)
        .bind(&stamp)
        .bind(id.to_string())
        .execute(self.scope.connection()?)
        .await?;
        self.get(id).await
    }

    pub async fn record_payment(&mut self, id: &InvoiceId) -> Result<Invoice, DataError> {
        let invoice = self.get(id).await?;
        ensure_transition("invoice", invoice.status, InvoiceStatus::Paid, InvoiceStatus::can_transition_to)?;
        let stamp = to_rfc3339(Utc::now());
        sqlx::query("UPDATE scoped_invoices SET status = ?, paid_at = ?, updated_at = ? WHERE id = ?")
            .bind(InvoiceStatus::Paid.as_str())
            .bind(&stamp)
            .bind(&stamp)
            .bind(id.to_string())
            .execute(self.scope.connection()?)
            .await?;
        self.get(id).await
    }

    pub async fn void(&mut self, id: &InvoiceId) -> Result<Invoice, DataError> {
        let invoice = self.get(id).await?;
        ensure_transition("invoice", invoice.status, InvoiceStatus::Void, InvoiceStatus::can_transition_to)?;
        self.write_status(id, InvoiceStatus::Void).await?;
        self.get(id).await
    }

    /// Flags sent invoices whose due date is before `today`.
    pub async fn mark_overdue(&mut self, today: NaiveDate) -> Result<Vec<Invoice>, DataError> {
        let due: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM scoped_invoices WHERE status = ? AND due_on < ? ORDER BY number",
        )
        .bind(InvoiceStatus::Sent.as_str())
        .bind(today)
        .fetch_all(self.scope.connection()?)
        .await?;

        let mut flagged = Vec::with_capacity(due.len());
        for (id,) in due {
            let id = InvoiceId::parse(&id)?;
            self.write_status(&id, InvoiceStatus::Overdue).await?;
            flagged.push(self.get(&id).await?);
        }
        if !flagged.is_empty() {
            info!(
                stage = "invoices",
                organization_id = %self.scope.organization_id(),
                count = flagged.len(),
                "invoices marked overdue"
            );
        }
        Ok(flagged)
    }

    async fn write_status(&mut self, id: &InvoiceId, status: InvoiceStatus) -> Result<(), DataError> {
        sqlx::query("UPDATE scoped_invoices SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(to_rfc3339(Utc::now()))
            .bind(id.to_string())
            .execute(self.scope.connection()?)
            .await?;
        Ok(())
    }
}

fn due_date(settings: &OrganizationSettings, at: DateTime<Utc>) -> Result<NaiveDate, DataError> {
    at.with_timezone(&settings.tz())
        .date_naive()
        .checked_add_days(Days::new(u64::from(settings.invoice_terms_days)))
        .ok_or(DataError::Billing(BillingError::Overflow))
}

#[derive(Debug, FromRow)]
struct InvoiceRow {
    id: String,
    organization_id: String,
    client_id: String,
    job_id: Option<String>,
    number: i64,
    line_items_json: String,
    subtotal_cents: i64,
    tax_cents: i64,
    total_cents: i64,
    status: String,
    due_on: NaiveDate,
    issued_at: Option<DateTime<Utc>>,
    paid_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl InvoiceRow {
    fn into_domain(self, scope: &TenantScope) -> Result<Invoice, DataError> {
        scope.ensure_owned(&self.organization_id)?;
        Ok(Invoice {
            id: InvoiceId::parse(&self.id)?,
            organization_id: OrganizationId::parse(&self.organization_id)?,
            client_id: ClientId::parse(&self.client_id)?,
            job_id: self.job_id.as_deref().map(JobId::parse).transpose()?,
            number: self.number,
            line_items: decode_line_items(&self.line_items_json)?,
            totals: Totals {
                subtotal_cents: self.subtotal_cents,
                tax_cents: self.tax_cents,
                total_cents: self.total_cents,
            },
            status: self.status.parse()?,
            due_on: self.due_on,
            issued_at: self.issued_at,
            paid_at: self.paid_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

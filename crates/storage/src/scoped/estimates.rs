use chrono::{DateTime, Utc};
use fieldbook_core::{
    billing::Totals,
    entities::{
        ensure_transition, EntityError, Estimate, EstimateStatus, Job, NewEstimate, NewJob,
    },
    ClientId, EstimateId, JobId, OrganizationId,
};
use sqlx::FromRow;

use super::{decode_line_items, encode_line_items};
use crate::{error::DataError, guard::TenantScope, to_rfc3339};

const COLUMNS: &str = "id, organization_id, client_id, title, line_items_json, subtotal_cents, \
     tax_cents, total_cents, status, job_id, created_at, updated_at";

pub struct EstimateRepository<'s> {
    scope: &'s mut TenantScope,
}

impl<'s> EstimateRepository<'s> {
    pub(crate) fn new(scope: &'s mut TenantScope) -> Self {
        Self { scope }
    }

    /// Prices the line items with the organization's tax rate and stores a draft.
    pub async fn create(&mut self, new: NewEstimate) -> Result<Estimate, DataError> {
        new.validate()?;
        let settings = self.scope.organization().current().await?.settings;
        if !settings.features.estimates {
            return Err(DataError::FeatureDisabled("estimates"));
        }
        self.scope.clients().get(&new.client_id).await?;
        let totals = Totals::compute(&new.line_items, settings.tax_rate_bps)?;

        let id = EstimateId::new();
        let now = to_rfc3339(Utc::now());
        sqlx::query(
            "INSERT INTO scoped_estimates (id, client_id, title, line_items_json, subtotal_cents, tax_cents, \
             total_cents, status, job_id, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?)",
        )
        .bind(id.to_string())
        .bind(new.client_id.to_string())
        .bind(new.title.trim())
        .bind(encode_line_items(&new.line_items)?)
        .bind(totals.subtotal_cents)
        .bind(totals.tax_cents)
        .bind(totals.total_cents)
        .bind(EstimateStatus::Draft.as_str())
        .bind(&now)
        .bind(&now)
        .execute(self.scope.connection()?)
        .await?;
        self.get(&id).await
    }

    pub async fn get(&mut self, id: &EstimateId) -> Result<Estimate, DataError> {
        let row = sqlx::query_as::<_, EstimateRow>(&format!(
            "SELECT {COLUMNS} FROM scoped_estimates WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(self.scope.connection()?)
        .await?;
        row.map(|row| row.into_domain(self.scope))
            .transpose()?
            .ok_or_else(|| DataError::not_found("estimate", id))
    }

    pub async fn list(&mut self, status: Option<EstimateStatus>) -> Result<Vec<Estimate>, DataError> {
        let rows = sqlx::query_as::<_, EstimateRow>(&format!(
            "SELECT {COLUMNS} FROM scoped_estimates WHERE ? IS NULL OR status = ? ORDER BY created_at, id"
        ))
        .bind(status.map(EstimateStatus::as_str))
        .bind(status.map(EstimateStatus::as_str))
        .fetch_all(self.scope.connection()?)
        .await?;
        rows.into_iter()
            .map(|row| row.into_domain(self.scope))
            .collect()
    }

    pub async fn update_status(
        &mut self,
        id: &EstimateId,
        next: EstimateStatus,
    ) -> Result<Estimate, DataError> {
        let estimate = self.get(id).await?;
        ensure_transition("estimate", estimate.status, next, EstimateStatus::can_transition_to)?;
        self.write_status(id, next, None).await?;
        self.get(id).await
    }

    /// Turns an approved estimate into a draft job for the same client.
    pub async fn convert_to_job(&mut self, id: &EstimateId) -> Result<(Estimate, Job), DataError> {
        let estimate = self.get(id).await?;
        if estimate.status != EstimateStatus::Approved {
            return Err(EntityError::InvalidTransition {
                kind: "estimate",
                from: estimate.status.as_str(),
                to: EstimateStatus::Converted.as_str(),
            }
            .into());
        }

        let description = estimate
            .line_items
            .iter()
            .map(|item| format!("{} x {}", item.quantity, item.description))
            .collect::<Vec<_>>()
            .join("\n");
        let job = self
            .scope
            .jobs()
            .create(NewJob {
                client_id: estimate.client_id,
                property_id: None,
                title: estimate.title.clone(),
                description: Some(description),
                scheduled_for: None,
            })
            .await?;
        self.write_status(id, EstimateStatus::Converted, Some(&job.id))
            .await?;
        Ok((self.get(id).await?, job))
    }

    async fn write_status(
        &mut self,
        id: &EstimateId,
        status: EstimateStatus,
        job_id: Option<&JobId>,
    ) -> Result<(), DataError> {
        sqlx::query(
            "UPDATE scoped_estimates SET status = ?, job_id = COALESCE(?, job_id), updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(job_id.map(|id| id.to_string()))
        .bind(to_rfc3339(Utc::now()))
        .bind(id.to_string())
        .execute(self.scope.connection()?)
        .await?;
        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct EstimateRow {
    id: String,
    organization_id: String,
    client_id: String,
    title: String,
    line_items_json: String,
    subtotal_cents: i64,
    tax_cents: i64,
    total_cents: i64,
    status: String,
    job_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl EstimateRow {
    fn into_domain(self, scope: &TenantScope) -> Result<Estimate, DataError> {
        scope.ensure_owned(&self.organization_id)?;
        Ok(Estimate {
            id: EstimateId::parse(&self.id)?,
            organization_id: OrganizationId::parse(&self.organization_id)?,
            client_id: ClientId::parse(&self.client_id)?,
            title: self.title,
            line_items: decode_line_items(&self.line_items_json)?,
            totals: Totals {
                subtotal_cents: self.subtotal_cents,
                tax_cents: self.tax_cents,
                total_cents: self.total_cents,
            },
            status: self.status.parse()?,
            job_id: self.job_id.as_deref().map(JobId::parse).transpose()?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

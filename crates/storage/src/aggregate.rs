//! Cross-tenant reporting for platform administrators.
//!
//! This is the one read path that spans organizations. It refuses to run
//! inside a tenant scope, requires a superadmin, and leaves an entry in the
//! platform audit log for every call.

use fieldbook_core::{OrganizationId, PrincipalId};
use metrics::counter;
use serde::Serialize;
use serde_json::json;
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use tracing::info;

use crate::{
    directory::{Directory, DirectoryError},
    guard::current_context,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrganizationSummary {
    pub organization_id: OrganizationId,
    pub slug: String,
    pub display_name: String,
    pub disabled: bool,
    pub members: i64,
    pub clients: i64,
    pub open_jobs: i64,
    pub outstanding_cents: i64,
}

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("principal {0} is not a platform administrator")]
    Forbidden(PrincipalId),
    #[error("platform aggregation cannot run inside a tenant scope")]
    InsideTenantScope,
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Clone)]
pub struct PlatformAggregator {
    pool: SqlitePool,
    directory: Directory,
}

impl PlatformAggregator {
    pub(crate) fn new(pool: SqlitePool, directory: Directory) -> Self {
        Self { pool, directory }
    }

    pub async fn organization_summaries(
        &self,
        principal_id: &PrincipalId,
    ) -> Result<Vec<OrganizationSummary>, AggregateError> {
        if current_context().is_some() {
            return Err(AggregateError::InsideTenantScope);
        }
        let allowed = self
            .directory
            .find_principal(principal_id)
            .await?
            .is_some_and(|principal| principal.is_active() && principal.is_superadmin);
        if !allowed {
            counter!("platform_aggregation_total", "result" => "forbidden").increment(1);
            return Err(AggregateError::Forbidden(*principal_id));
        }

        let rows = sqlx::query_as::<_, SummaryRow>(
            "SELECT o.id, o.slug, o.display_name, o.disabled_at IS NOT NULL AS disabled, \
                (SELECT COUNT(*) FROM memberships m WHERE m.organization_id = o.id) AS members, \
                (SELECT COUNT(*) FROM clients c WHERE c.organization_id = o.id AND c.archived = 0) AS clients, \
                (SELECT COUNT(*) FROM jobs j WHERE j.organization_id = o.id \
                    AND j.status IN ('draft', 'scheduled', 'in_progress')) AS open_jobs, \
                (SELECT COALESCE(SUM(i.total_cents), 0) FROM invoices i WHERE i.organization_id = o.id \
                    AND i.status IN ('sent', 'overdue')) AS outstanding_cents \
             FROM organizations o ORDER BY o.slug",
        )
        .fetch_all(&self.pool)
        .await?;
        let summaries = rows
            .into_iter()
            .map(SummaryRow::into_domain)
            .collect::<Result<Vec<_>, _>>()?;

        self.directory
            .record_platform_action(
                principal_id,
                "organization_summaries",
                &json!({ "organizations": summaries.len() }),
            )
            .await?;
        counter!("platform_aggregation_total", "result" => "ok").increment(1);
        info!(
            stage = "platform",
            principal_id = %principal_id,
            organizations = summaries.len(),
            "cross-tenant summary served"
        );
        Ok(summaries)
    }
}

#[derive(Debug, FromRow)]
struct SummaryRow {
    id: String,
    slug: String,
    display_name: String,
    disabled: bool,
    members: i64,
    clients: i64,
    open_jobs: i64,
    outstanding_cents: i64,
}

impl SummaryRow {
    fn into_domain(self) -> Result<OrganizationSummary, DirectoryError> {
        Ok(OrganizationSummary {
            organization_id: OrganizationId::parse(&self.id)?,
            slug: self.slug,
            display_name: self.display_name,
            disabled: self.disabled,
            members: self.members,
            clients: self.clients,
            open_jobs: self.open_jobs,
            outstanding_cents: self.outstanding_cents,
        })
    }
}

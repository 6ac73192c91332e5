use chrono::Utc;
use fieldbook_core::{Organization, OrganizationUpdate};

use crate::{
    directory::OrganizationRow,
    error::{DataError, IsolationError},
    guard::TenantScope,
    schema::ORGANIZATION_VIEW,
    to_rfc3339,
};

/// The bound organization's own record.
pub struct OrganizationRepository<'s> {
    scope: &'s mut TenantScope,
}

impl<'s> OrganizationRepository<'s> {
    pub(crate) fn new(scope: &'s mut TenantScope) -> Self {
        Self { scope }
    }

    pub async fn current(&mut self) -> Result<Organization, DataError> {
        let row = sqlx::query_as::<_, OrganizationRow>(&format!(
            "SELECT {} FROM {ORGANIZATION_VIEW}",
            OrganizationRow::COLUMNS
        ))
        .fetch_optional(self.scope.connection()?)
        .await?
        .ok_or_else(|| {
            IsolationError::Integrity("bound organization is not visible in scope".to_string())
        })?;
        let organization = row
            .into_domain()
            .map_err(|err| DataError::Decode(err.to_string()))?;
        self.scope.ensure_owned(&organization.id.to_string())?;
        Ok(organization)
    }

    /// Edits display name, industry or settings. Requires an owner or admin.
    pub async fn update(&mut self, update: OrganizationUpdate) -> Result<Organization, DataError> {
        if !self.scope.context().grant.role().can_manage_organization() {
            return Err(DataError::Forbidden(
                "only owners and admins may edit the organization",
            ));
        }
        update.validate()?;
        let current = self.current().await?;
        let settings = update.settings.unwrap_or(current.settings);
        settings.validate()?;

        sqlx::query(&format!(
            "UPDATE {ORGANIZATION_VIEW} SET display_name = ?, industry = ?, settings_json = ?, updated_at = ?"
        ))
        .bind(
            update
                .display_name
                .as_deref()
                .map(str::trim)
                .unwrap_or(&current.display_name),
        )
        .bind(update.industry.unwrap_or(current.industry).as_str())
        .bind(settings.to_json()?)
        .bind(to_rfc3339(Utc::now()))
        .execute(self.scope.connection()?)
        .await?;
        self.current().await
    }
}

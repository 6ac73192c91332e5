//! Platform-level registry of organizations, principals and memberships.
//!
//! None of these tables are tenant-scoped, which is why this repository works
//! straight off the pool. It never touches tenant business data.

use chrono::{DateTime, Utc};
use fieldbook_core::{
    settings::{OrganizationSettings, SettingsError},
    tenancy::{Industry, NewOrganization, NewPrincipal, TenancyError},
    IdError, Membership, Organization, OrganizationId, Principal, PrincipalId, Role,
};
use serde_json::Value;
use sqlx::{FromRow, SqlitePool};
use thiserror::Error;
use tracing::info;

use crate::to_rfc3339;

const SQLITE_UNIQUE_VIOLATION: &str = "2067";
const SQLITE_FOREIGN_KEY_VIOLATION: &str = "787";

const ORGANIZATION_COLUMNS: &str =
    "id, slug, display_name, industry, settings_json, disabled_at, created_at, updated_at";
const PRINCIPAL_COLUMNS: &str =
    "id, display_name, email, credential_hash, is_superadmin, disabled_at, created_at";

#[derive(Clone)]
pub struct Directory {
    pool: SqlitePool,
}

impl Directory {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create_organization(
        &self,
        new: NewOrganization,
    ) -> Result<Organization, DirectoryError> {
        new.validate()?;
        new.settings.validate()?;
        let id = OrganizationId::new();
        let now = to_rfc3339(Utc::now());
        sqlx::query(
            "INSERT INTO organizations (id, slug, display_name, industry, settings_json, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(&new.slug)
        .bind(new.display_name.trim())
        .bind(new.industry.as_str())
        .bind(new.settings.to_json()?)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|err| map_conflict(err, "organization slug already taken"))?;

        info!(stage = "directory", organization_id = %id, slug = %new.slug, "organization created");
        self.require_organization(&id).await
    }

    pub async fn find_organization(
        &self,
        id: &OrganizationId,
    ) -> Result<Option<Organization>, DirectoryError> {
        let row = sqlx::query_as::<_, OrganizationRow>(&format!(
            "SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(OrganizationRow::into_domain).transpose()
    }

    pub async fn find_organization_by_slug(
        &self,
        slug: &str,
    ) -> Result<Option<Organization>, DirectoryError> {
        let row = sqlx::query_as::<_, OrganizationRow>(&format!(
            "SELECT {ORGANIZATION_COLUMNS} FROM organizations WHERE slug = ?"
        ))
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;
        row.map(OrganizationRow::into_domain).transpose()
    }

    /// Ids of every organization that can currently be selected as a tenant.
    pub async fn active_organization_ids(&self) -> Result<Vec<OrganizationId>, DirectoryError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM organizations WHERE disabled_at IS NULL ORDER BY slug",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|(id,)| OrganizationId::parse(&id).map_err(DirectoryError::from))
            .collect()
    }

    pub async fn disable_organization(
        &self,
        id: &OrganizationId,
    ) -> Result<Organization, DirectoryError> {
        let now = to_rfc3339(Utc::now());
        let result = sqlx::query(
            "UPDATE organizations SET disabled_at = COALESCE(disabled_at, ?), updated_at = ? WHERE id = ?",
        )
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DirectoryError::not_found("organization", id));
        }
        info!(stage = "directory", organization_id = %id, "organization disabled");
        self.require_organization(id).await
    }

    pub async fn create_principal(&self, new: NewPrincipal) -> Result<Principal, DirectoryError> {
        new.validate()?;
        let id = PrincipalId::new();
        sqlx::query(
            "INSERT INTO principals (id, display_name, email, credential_hash, is_superadmin, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(new.display_name.trim())
        .bind(new.email.trim().to_ascii_lowercase())
        .bind(new.credential_hash.as_deref())
        .bind(i64::from(new.is_superadmin))
        .bind(to_rfc3339(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|err| map_conflict(err, "email already registered"))?;

        self.find_principal(&id)
            .await?
            .ok_or_else(|| DirectoryError::not_found("principal", id))
    }

    pub async fn find_principal(
        &self,
        id: &PrincipalId,
    ) -> Result<Option<Principal>, DirectoryError> {
        let row = sqlx::query_as::<_, PrincipalRow>(&format!(
            "SELECT {PRINCIPAL_COLUMNS} FROM principals WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(PrincipalRow::into_domain).transpose()
    }

    pub async fn find_principal_by_email(
        &self,
        email: &str,
    ) -> Result<Option<Principal>, DirectoryError> {
        let row = sqlx::query_as::<_, PrincipalRow>(&format!(
            "SELECT {PRINCIPAL_COLUMNS} FROM principals WHERE email = ?"
        ))
        .bind(email.trim().to_ascii_lowercase())
        .fetch_optional(&self.pool)
        .await?;
        row.map(PrincipalRow::into_domain).transpose()
    }

    /// Grants or changes a principal's role inside an organization.
    pub async fn grant_membership(
        &self,
        principal_id: &PrincipalId,
        organization_id: &OrganizationId,
        role: Role,
    ) -> Result<Membership, DirectoryError> {
        sqlx::query(
            "INSERT INTO memberships (principal_id, organization_id, role, created_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(principal_id, organization_id) DO UPDATE SET role = excluded.role",
        )
        .bind(principal_id.to_string())
        .bind(organization_id.to_string())
        .bind(role.as_str())
        .bind(to_rfc3339(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|err| map_conflict(err, "membership references an unknown principal or organization"))?;

        info!(
            stage = "directory",
            principal_id = %principal_id,
            organization_id = %organization_id,
            role = role.as_str(),
            "membership granted"
        );
        self.membership(principal_id, organization_id)
            .await?
            .ok_or_else(|| DirectoryError::not_found("membership", organization_id))
    }

    pub async fn membership(
        &self,
        principal_id: &PrincipalId,
        organization_id: &OrganizationId,
    ) -> Result<Option<Membership>, DirectoryError> {
        let row = sqlx::query_as::<_, MembershipRow>(
            "SELECT principal_id, organization_id, role, created_at FROM memberships \
             WHERE principal_id = ? AND organization_id = ?",
        )
        .bind(principal_id.to_string())
        .bind(organization_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(MembershipRow::into_domain).transpose()
    }

    pub async fn memberships_for(
        &self,
        principal_id: &PrincipalId,
    ) -> Result<Vec<Membership>, DirectoryError> {
        let rows = sqlx::query_as::<_, MembershipRow>(
            "SELECT m.principal_id, m.organization_id, m.role, m.created_at FROM memberships m \
             JOIN organizations o ON o.id = m.organization_id \
             WHERE m.principal_id = ? AND o.disabled_at IS NULL ORDER BY o.slug",
        )
        .bind(principal_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(MembershipRow::into_domain).collect()
    }

    /// Appends an entry to the platform audit trail.
    pub async fn record_platform_action(
        &self,
        principal_id: &PrincipalId,
        action: &str,
        detail: &Value,
    ) -> Result<(), DirectoryError> {
        sqlx::query(
            "INSERT INTO platform_audit_log (principal_id, action, detail_json, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(principal_id.to_string())
        .bind(action)
        .bind(detail.to_string())
        .bind(to_rfc3339(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn platform_actions(
        &self,
        principal_id: &PrincipalId,
    ) -> Result<Vec<String>, DirectoryError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT action FROM platform_audit_log WHERE principal_id = ? ORDER BY id",
        )
        .bind(principal_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(action,)| action).collect())
    }

    async fn require_organization(
        &self,
        id: &OrganizationId,
    ) -> Result<Organization, DirectoryError> {
        self.find_organization(id)
            .await?
            .ok_or_else(|| DirectoryError::not_found("organization", id))
    }
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Invalid(#[from] TenancyError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("failed to decode stored row: {0}")]
    Decode(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl DirectoryError {
    fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<IdError> for DirectoryError {
    fn from(err: IdError) -> Self {
        Self::Decode(err.to_string())
    }
}

fn map_conflict(err: sqlx::Error, message: &str) -> DirectoryError {
    if let sqlx::Error::Database(db_err) = &err {
        if matches!(
            db_err.code().as_deref(),
            Some(SQLITE_UNIQUE_VIOLATION | SQLITE_FOREIGN_KEY_VIOLATION)
        ) {
            return DirectoryError::Conflict(message.to_string());
        }
    }
    DirectoryError::Database(err)
}

/// Shared with the scoped organization view, which returns the same columns.
#[derive(Debug, FromRow)]
pub(crate) struct OrganizationRow {
    id: String,
    slug: String,
    display_name: String,
    industry: String,
    settings_json: String,
    disabled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl OrganizationRow {
    pub(crate) const COLUMNS: &'static str = ORGANIZATION_COLUMNS;

    pub(crate) fn into_domain(self) -> Result<Organization, DirectoryError> {
        Ok(Organization {
            id: OrganizationId::parse(&self.id)?,
            slug: self.slug,
            display_name: self.display_name,
            industry: self.industry.parse::<Industry>()?,
            settings: OrganizationSettings::parse(&self.settings_json)?,
            disabled_at: self.disabled_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct PrincipalRow {
    id: String,
    display_name: String,
    email: String,
    credential_hash: Option<String>,
    is_superadmin: i64,
    disabled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl PrincipalRow {
    fn into_domain(self) -> Result<Principal, DirectoryError> {
        Ok(Principal {
            id: PrincipalId::parse(&self.id)?,
            display_name: self.display_name,
            email: self.email,
            credential_hash: self.credential_hash,
            is_superadmin: self.is_superadmin != 0,
            disabled_at: self.disabled_at,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct MembershipRow {
    principal_id: String,
    organization_id: String,
    role: String,
    created_at: DateTime<Utc>,
}

impl MembershipRow {
    fn into_domain(self) -> Result<Membership, DirectoryError> {
        Ok(Membership {
            principal_id: PrincipalId::parse(&self.principal_id)?,
            organization_id: OrganizationId::parse(&self.organization_id)?,
            role: self.role.parse::<Role>()?,
            created_at: self.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::setup_db;

    fn new_org(slug: &str) -> NewOrganization {
        NewOrganization {
            slug: slug.to_string(),
            display_name: format!("{slug} inc"),
            industry: Industry::Landscaping,
            settings: OrganizationSettings::default(),
        }
    }

    fn new_principal(email: &str) -> NewPrincipal {
        NewPrincipal {
            display_name: "Jane Doe".into(),
            email: email.into(),
            credential_hash: None,
            is_superadmin: false,
        }
    }

    #[tokio::test]
    async fn organizations_are_unique_by_slug() {
        let (db, _dir) = setup_db().await;
        let directory = db.directory();

        let acme = directory
            .create_organization(new_org("acme"))
            .await
            .expect("create");
        assert!(acme.is_active());
        assert_eq!(
            directory
                .find_organization_by_slug("acme")
                .await
                .expect("lookup")
                .map(|org| org.id),
            Some(acme.id)
        );

        let err = directory
            .create_organization(new_org("acme"))
            .await
            .expect_err("duplicate slug");
        assert!(matches!(err, DirectoryError::Conflict(_)));

        let disabled = directory.disable_organization(&acme.id).await.expect("disable");
        assert!(!disabled.is_active());
        assert!(directory
            .active_organization_ids()
            .await
            .expect("active")
            .is_empty());
    }

    #[tokio::test]
    async fn memberships_upsert_role() {
        let (db, _dir) = setup_db().await;
        let directory = db.directory();
        let org = directory
            .create_organization(new_org("zen-garden"))
            .await
            .expect("org");
        let jane = directory
            .create_principal(new_principal("Jane@Example.com"))
            .await
            .expect("principal");
        assert_eq!(jane.email, "jane@example.com");

        directory
            .grant_membership(&jane.id, &org.id, Role::Member)
            .await
            .expect("grant");
        let upgraded = directory
            .grant_membership(&jane.id, &org.id, Role::Admin)
            .await
            .expect("regrant");
        assert_eq!(upgraded.role, Role::Admin);
        assert_eq!(directory.memberships_for(&jane.id).await.expect("list").len(), 1);

        let err = directory
            .grant_membership(&PrincipalId::new(), &org.id, Role::Member)
            .await
            .expect_err("unknown principal");
        assert!(matches!(err, DirectoryError::Conflict(_)));
    }
}

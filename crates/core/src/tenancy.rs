//! Tenancy model: organizations, principals, memberships and the ephemeral
//! tenant context bound for the lifetime of one scope.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{OrganizationId, PrincipalId};
use crate::settings::OrganizationSettings;

const SLUG_MIN_LEN: usize = 3;
const SLUG_MAX_LEN: usize = 63;

/// Industry classification attached to an organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Industry {
    Landscaping,
    Cleaning,
    Plumbing,
    Hvac,
    Electrical,
    GeneralContracting,
    Other,
}

impl Industry {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Landscaping => "landscaping",
            Self::Cleaning => "cleaning",
            Self::Plumbing => "plumbing",
            Self::Hvac => "hvac",
            Self::Electrical => "electrical",
            Self::GeneralContracting => "general_contracting",
            Self::Other => "other",
        }
    }
}

impl FromStr for Industry {
    type Err = TenancyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "landscaping" => Ok(Self::Landscaping),
            "cleaning" => Ok(Self::Cleaning),
            "plumbing" => Ok(Self::Plumbing),
            "hvac" => Ok(Self::Hvac),
            "electrical" => Ok(Self::Electrical),
            "general_contracting" => Ok(Self::GeneralContracting),
            "other" => Ok(Self::Other),
            other => Err(TenancyError::UnknownIndustry(other.to_string())),
        }
    }
}

/// The tenant boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Organization {
    pub id: OrganizationId,
    pub slug: String,
    pub display_name: String,
    pub industry: Industry,
    pub settings: OrganizationSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disabled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Organization {
    /// Disabled organizations can no longer be selected as a tenant context.
    pub fn is_active(&self) -> bool {
        self.disabled_at.is_none()
    }
}

/// Fields required to provision an organization.
#[derive(Debug, Clone, Deserialize)]
pub struct NewOrganization {
    pub slug: String,
    pub display_name: String,
    pub industry: Industry,
    #[serde(default)]
    pub settings: OrganizationSettings,
}

impl NewOrganization {
    pub fn validate(&self) -> Result<(), TenancyError> {
        validate_slug(&self.slug)?;
        validate_display_name(&self.display_name)?;
        Ok(())
    }
}

/// Editable organization fields; absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrganizationUpdate {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub industry: Option<Industry>,
    #[serde(default)]
    pub settings: Option<OrganizationSettings>,
}

impl OrganizationUpdate {
    pub fn validate(&self) -> Result<(), TenancyError> {
        if let Some(name) = &self.display_name {
            validate_display_name(name)?;
        }
        Ok(())
    }
}

/// An authenticated actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub id: PrincipalId,
    pub display_name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub credential_hash: Option<String>,
    /// Bypasses membership checks; reserved for platform-wide views.
    pub is_superadmin: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disabled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Principal {
    pub fn is_active(&self) -> bool {
        self.disabled_at.is_none()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewPrincipal {
    pub display_name: String,
    pub email: String,
    #[serde(default)]
    pub credential_hash: Option<String>,
    #[serde(default)]
    pub is_superadmin: bool,
}

impl NewPrincipal {
    pub fn validate(&self) -> Result<(), TenancyError> {
        validate_display_name(&self.display_name)?;
        let email = self.email.trim();
        let valid = email
            .split_once('@')
            .map(|(local, domain)| !local.is_empty() && domain.contains('.'))
            .unwrap_or(false);
        if !valid {
            return Err(TenancyError::InvalidEmail(self.email.clone()));
        }
        Ok(())
    }
}

/// Role a principal holds inside an organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Member,
    Admin,
    Owner,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Member => "member",
            Self::Admin => "admin",
            Self::Owner => "owner",
        }
    }

    /// Owners and admins may edit organization settings.
    pub fn can_manage_organization(self) -> bool {
        matches!(self, Self::Owner | Self::Admin)
    }
}

impl FromStr for Role {
    type Err = TenancyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "member" => Ok(Self::Member),
            "admin" => Ok(Self::Admin),
            "owner" => Ok(Self::Owner),
            other => Err(TenancyError::UnknownRole(other.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authorization edge permitting a principal to select an organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Membership {
    pub principal_id: PrincipalId,
    pub organization_id: OrganizationId,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

/// How a principal was admitted into a tenant scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "via", content = "role", rename_all = "snake_case")]
pub enum Grant {
    Membership(Role),
    PlatformAdmin,
}

impl Grant {
    /// Effective role inside the organization; platform admins act as owners.
    pub fn role(self) -> Role {
        match self {
            Self::Membership(role) => role,
            Self::PlatformAdmin => Role::Owner,
        }
    }
}

/// The ephemeral value bound for the lifetime of one scope. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantContext {
    pub organization_id: OrganizationId,
    pub principal_id: PrincipalId,
    pub grant: Grant,
    pub started_at: DateTime<Utc>,
}

impl TenantContext {
    pub fn new(organization_id: OrganizationId, principal_id: PrincipalId, grant: Grant) -> Self {
        Self {
            organization_id,
            principal_id,
            grant,
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TenancyError {
    #[error("slug must be 3-63 characters of a-z, 0-9 or '-' (got {0:?})")]
    InvalidSlug(String),
    #[error("display name must not be empty")]
    EmptyDisplayName,
    #[error("invalid email address: {0}")]
    InvalidEmail(String),
    #[error("unknown industry: {0}")]
    UnknownIndustry(String),
    #[error("unknown role: {0}")]
    UnknownRole(String),
}

/// Slugs are URL-stable: lowercase ascii, digits and inner dashes.
pub fn validate_slug(slug: &str) -> Result<(), TenancyError> {
    let len_ok = (SLUG_MIN_LEN..=SLUG_MAX_LEN).contains(&slug.len());
    let chars_ok = slug
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let edges_ok = !slug.starts_with('-') && !slug.ends_with('-');
    if len_ok && chars_ok && edges_ok {
        Ok(())
    } else {
        Err(TenancyError::InvalidSlug(slug.to_string()))
    }
}

fn validate_display_name(name: &str) -> Result<(), TenancyError> {
    if name.trim().is_empty() {
        Err(TenancyError::EmptyDisplayName)
    } else {
        Ok(())
    }
}

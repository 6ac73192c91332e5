use std::future::Future;

use fieldbook_core::{Grant, OrganizationId, PrincipalId};
use tracing::debug;

use crate::{directory::Directory, error::IsolationError};

/// Decides whether a principal may operate inside an organization.
///
/// Runs before any connection is bound, so a refusal never reaches the
/// unit of work.
pub trait CapabilityCheck: Send + Sync {
    fn authorize(
        &self,
        principal_id: &PrincipalId,
        organization_id: &OrganizationId,
    ) -> impl Future<Output = Result<Grant, IsolationError>> + Send;
}

/// Grants access through memberships, with the superadmin bypass.
#[derive(Clone)]
pub struct DirectoryCapability {
    directory: Directory,
}

impl DirectoryCapability {
    pub fn new(directory: Directory) -> Self {
        Self { directory }
    }
}

impl CapabilityCheck for DirectoryCapability {
    async fn authorize(
        &self,
        principal_id: &PrincipalId,
        organization_id: &OrganizationId,
    ) -> Result<Grant, IsolationError> {
        let unauthorized = || IsolationError::Unauthorized {
            principal: *principal_id,
            organization: *organization_id,
        };

        let principal = match self.directory.find_principal(principal_id).await? {
            Some(principal) if principal.is_active() => principal,
            _ => return Err(unauthorized()),
        };
        if principal.is_superadmin {
            debug!(stage = "guard", principal_id = %principal_id, "superadmin bypass");
            return Ok(Grant::PlatformAdmin);
        }

        self.directory
            .membership(principal_id, organization_id)
            .await?
            .map(|membership| Grant::Membership(membership.role))
            .ok_or_else(unauthorized)
    }
}

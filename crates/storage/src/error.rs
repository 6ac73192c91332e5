use fieldbook_core::{
    billing::BillingError, entities::EntityError, settings::SettingsError, tenancy::TenancyError,
    IdError, OrganizationId, PrincipalId,
};
use thiserror::Error;

use crate::{directory::DirectoryError, schema::ISOLATION_ABORT};

const SQLITE_UNIQUE_VIOLATION: &str = "2067";
const SQLITE_PRIMARY_KEY_VIOLATION: &str = "1555";
const SQLITE_FOREIGN_KEY_VIOLATION: &str = "787";
const SQLITE_TRIGGER_ABORT: &str = "1811";

/// Failures of the tenant context guard.
#[derive(Debug, Error)]
pub enum IsolationError {
    #[error("organization {0} does not exist or is disabled")]
    InvalidOrganization(String),
    #[error("principal {principal} is not authorized for organization {organization}")]
    Unauthorized {
        principal: PrincipalId,
        organization: OrganizationId,
    },
    #[error("no active tenant scope")]
    NoActiveScope,
    #[error("tenant scope for organization {active} is active; refusing to enter {requested}")]
    NestedContextMismatch {
        active: OrganizationId,
        requested: OrganizationId,
    },
    #[error("a tenant scope for organization {0} is already active in this task")]
    NestedScope(OrganizationId),
    #[error("tenant isolation could not be confirmed: {0}")]
    Integrity(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl IsolationError {
    /// Integrity failures override any unit-of-work result and must be
    /// surfaced as server errors.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Integrity(_))
    }

    /// Storage hiccups that may succeed on a fresh scope.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(err) => is_transient(err),
            _ => false,
        }
    }
}

impl From<IdError> for IsolationError {
    fn from(err: IdError) -> Self {
        Self::InvalidOrganization(err.value)
    }
}

impl From<DirectoryError> for IsolationError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::Database(err) => Self::Database(err),
            other => Self::Integrity(other.to_string()),
        }
    }
}

/// Failures of scoped data operations.
#[derive(Debug, Error)]
pub enum DataError {
    #[error(transparent)]
    Isolation(#[from] IsolationError),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Forbidden(&'static str),
    #[error("feature {0} is disabled for this organization")]
    FeatureDisabled(&'static str),
    #[error("write rejected by tenant isolation policy: {0}")]
    Rejected(String),
    #[error(transparent)]
    Entity(#[from] EntityError),
    #[error(transparent)]
    Billing(#[from] BillingError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Tenancy(#[from] TenancyError),
    #[error("failed to decode stored row: {0}")]
    Decode(String),
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl DataError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Isolation(err) if err.is_fatal())
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Self::Isolation(err) => err.is_transient(),
            Self::Database(err) => is_transient(err),
            _ => false,
        }
    }
}

impl From<sqlx::Error> for DataError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            let code = db_err.code();
            let code = code.as_deref();
            if code == Some(SQLITE_TRIGGER_ABORT) || db_err.message().contains(ISOLATION_ABORT) {
                return Self::Rejected(db_err.message().to_string());
            }
            if matches!(code, Some(SQLITE_UNIQUE_VIOLATION | SQLITE_PRIMARY_KEY_VIOLATION)) {
                return Self::Conflict(db_err.message().to_string());
            }
            if code == Some(SQLITE_FOREIGN_KEY_VIOLATION) {
                return Self::Conflict("referenced record does not exist".to_string());
            }
        }
        Self::Database(err)
    }
}

impl From<serde_json::Error> for DataError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<IdError> for DataError {
    fn from(err: IdError) -> Self {
        Self::Decode(err.to_string())
    }
}

fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db_err) => {
            let message = db_err.message();
            message.contains("database is locked") || message.contains("database is busy")
        }
        _ => false,
    }
}

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use fieldbook_core::entities::EntityError;
use fieldbook_storage::{AggregateError, DataError, DirectoryError, IsolationError};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::identity::IdentityError;

#[derive(Debug, Serialize)]
struct ProblemDetails {
    #[serde(rename = "type")]
    problem_type: &'static str,
    title: &'static str,
    detail: String,
}

pub struct ProblemResponse {
    status: StatusCode,
    body: ProblemDetails,
}

impl ProblemResponse {
    pub fn new<S: Into<String>>(status: StatusCode, problem_type: &'static str, detail: S) -> Self {
        Self {
            status,
            body: ProblemDetails {
                problem_type,
                title: status.canonical_reason().unwrap_or("error"),
                detail: detail.into(),
            },
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ProblemResponse {
    fn into_response(self) -> Response {
        let mut response = Json(self.body).into_response();
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

/// Everything a handler can fail with.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
    #[error("{0}")]
    BadRequest(String),
}

impl From<IsolationError> for ApiError {
    fn from(err: IsolationError) -> Self {
        Self::Data(DataError::Isolation(err))
    }
}

impl ApiError {
    /// Short label used for the `result` metric dimension.
    pub fn kind(&self) -> &'static str {
        match self.to_problem().status.as_u16() {
            400 => "bad_request",
            401 => "unauthenticated",
            403 => "forbidden",
            404 => "not_found",
            409 => "conflict",
            503 => "unavailable",
            _ => "error",
        }
    }

    pub fn to_problem(&self) -> ProblemResponse {
        let detail = self.to_string();
        match self {
            Self::Identity(IdentityError::Unauthenticated(_)) => {
                ProblemResponse::new(StatusCode::UNAUTHORIZED, "unauthenticated", detail)
            }
            Self::Identity(IdentityError::Forbidden { .. } | IdentityError::NotSuperadmin(_)) => {
                ProblemResponse::new(StatusCode::FORBIDDEN, "forbidden", detail)
            }
            Self::Identity(IdentityError::Directory(err)) => directory_problem(err),
            Self::Identity(IdentityError::Token(_)) => {
                ProblemResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "token_issue_failed", detail)
            }
            Self::Data(err) => data_problem(err),
            Self::Directory(err) => directory_problem(err),
            Self::Aggregate(AggregateError::Forbidden(_)) => {
                ProblemResponse::new(StatusCode::FORBIDDEN, "forbidden", detail)
            }
            Self::Aggregate(AggregateError::Directory(err)) => directory_problem(err),
            Self::Aggregate(_) => {
                ProblemResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "aggregation_failed", detail)
            }
            Self::BadRequest(_) => ProblemResponse::new(StatusCode::BAD_REQUEST, "bad_request", detail),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Data(err) = &self {
            if err.is_fatal() {
                error!(stage = "api", isolation_integrity = true, error = %err, "request ended with an isolation integrity failure");
            }
        }
        let problem = self.to_problem();
        if problem.status.is_server_error() {
            warn!(stage = "api", status = problem.status.as_u16(), error = %self, "request failed");
        }
        problem.into_response()
    }
}

fn isolation_problem(err: &IsolationError) -> ProblemResponse {
    let detail = err.to_string();
    match err {
        IsolationError::InvalidOrganization(_) => {
            ProblemResponse::new(StatusCode::NOT_FOUND, "invalid_organization", detail)
        }
        IsolationError::Unauthorized { .. } => {
            ProblemResponse::new(StatusCode::FORBIDDEN, "unauthorized", detail)
        }
        IsolationError::Database(_) if err.is_transient() => {
            ProblemResponse::new(StatusCode::SERVICE_UNAVAILABLE, "storage_busy", detail)
        }
        IsolationError::Integrity(_) => ProblemResponse::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "isolation_integrity",
            "tenant isolation could not be confirmed",
        ),
        _ => ProblemResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "isolation_error", detail),
    }
}

fn data_problem(err: &DataError) -> ProblemResponse {
    let detail = err.to_string();
    match err {
        DataError::Isolation(inner) => isolation_problem(inner),
        DataError::NotFound { .. } => ProblemResponse::new(StatusCode::NOT_FOUND, "not_found", detail),
        DataError::Conflict(_) => ProblemResponse::new(StatusCode::CONFLICT, "conflict", detail),
        DataError::Forbidden(_) => ProblemResponse::new(StatusCode::FORBIDDEN, "forbidden", detail),
        DataError::FeatureDisabled(_) => {
            ProblemResponse::new(StatusCode::FORBIDDEN, "feature_disabled", detail)
        }
        DataError::Entity(EntityError::InvalidTransition { .. }) => {
            ProblemResponse::new(StatusCode::CONFLICT, "invalid_transition", detail)
        }
        DataError::Entity(_) | DataError::Billing(_) | DataError::Settings(_) | DataError::Tenancy(_) => {
            ProblemResponse::new(StatusCode::BAD_REQUEST, "validation", detail)
        }
        DataError::Database(_) if err.is_transient() => {
            ProblemResponse::new(StatusCode::SERVICE_UNAVAILABLE, "storage_busy", detail)
        }
        DataError::Rejected(_) => ProblemResponse::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "isolation_rejected",
            "write rejected by tenant isolation policy",
        ),
        DataError::Decode(_) | DataError::Database(_) => {
            ProblemResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", detail)
        }
    }
}

fn directory_problem(err: &DirectoryError) -> ProblemResponse {
    let detail = err.to_string();
    match err {
        DirectoryError::NotFound { .. } => {
            ProblemResponse::new(StatusCode::NOT_FOUND, "not_found", detail)
        }
        DirectoryError::Conflict(_) => ProblemResponse::new(StatusCode::CONFLICT, "conflict", detail),
        DirectoryError::Invalid(_) | DirectoryError::Settings(_) => {
            ProblemResponse::new(StatusCode::BAD_REQUEST, "validation", detail)
        }
        DirectoryError::Decode(_) | DirectoryError::Database(_) => {
            ProblemResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", detail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldbook_core::{OrganizationId, PrincipalId};

    #[test]
    fn isolation_errors_map_to_their_statuses() {
        let cases = [
            (IsolationError::InvalidOrganization("x".into()), StatusCode::NOT_FOUND),
            (
                IsolationError::Unauthorized {
                    principal: PrincipalId::new(),
                    organization: OrganizationId::new(),
                },
                StatusCode::FORBIDDEN,
            ),
            (IsolationError::NoActiveScope, StatusCode::INTERNAL_SERVER_ERROR),
            (
                IsolationError::NestedScope(OrganizationId::new()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                IsolationError::Integrity("reset".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).to_problem().status(), status);
        }
    }

    #[test]
    fn data_errors_map_to_their_statuses() {
        let transition = DataError::Entity(EntityError::InvalidTransition {
            kind: "job",
            from: "completed",
            to: "draft",
        });
        assert_eq!(ApiError::from(transition).to_problem().status(), StatusCode::CONFLICT);
        let invalid = DataError::Entity(EntityError::Validation("title must not be empty".into()));
        assert_eq!(ApiError::from(invalid).kind(), "bad_request");
        let missing = DataError::NotFound {
            entity: "client",
            id: "c-1".into(),
        };
        assert_eq!(ApiError::from(missing).kind(), "not_found");
    }

    #[test]
    fn integrity_detail_is_not_leaked() {
        let problem = ApiError::from(IsolationError::Integrity("slot 1 still bound".into())).to_problem();
        assert!(!problem.body.detail.contains("slot"));
    }
}

//! Session identity resolution.
//!
//! A session is an HS256 token naming the principal (`sub`) and the
//! organization they selected (`org`). Resolution only reads the platform
//! directory; it never opens a tenant scope.

use std::{sync::Arc, time::Duration};

use axum::http::{header, HeaderMap};
use chrono::{DateTime, Utc};
use fieldbook_core::{OrganizationId, PrincipalId};
use fieldbook_storage::{Directory, DirectoryError};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const SESSION_COOKIE: &str = "fieldbook_session";

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Who is calling and which organization they are acting in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub principal_id: PrincipalId,
    pub organization_id: OrganizationId,
    pub is_superadmin: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub org: String,
    pub exp: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<usize>,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("authentication required: {0}")]
    Unauthenticated(&'static str),
    #[error("principal {principal} may not act in organization {organization}")]
    Forbidden {
        principal: PrincipalId,
        organization: OrganizationId,
    },
    #[error("principal {0} is not a platform administrator")]
    NotSuperadmin(PrincipalId),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error("failed to issue session token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
}

#[derive(Clone)]
pub struct IdentityResolver {
    directory: Directory,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    ttl: Duration,
    clock: Clock,
}

impl IdentityResolver {
    pub fn new(directory: Directory, secret: &[u8], ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        validation.validate_exp = false;
        validation.validate_nbf = false;
        Self {
            directory,
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            ttl,
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Signs a session for `principal_id` acting in `organization_id`.
    ///
    /// Issuing does not check membership; [`IdentityResolver::switch`] and
    /// [`IdentityResolver::resolve`] do.
    pub fn issue(
        &self,
        principal_id: &PrincipalId,
        organization_id: &OrganizationId,
    ) -> Result<String, IdentityError> {
        let now = (self.clock)().timestamp().max(0) as usize;
        let claims = SessionClaims {
            sub: principal_id.to_string(),
            org: organization_id.to_string(),
            exp: now + self.ttl.as_secs() as usize,
            nbf: Some(now),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?)
    }

    /// Resolves the request's credential into an identity.
    ///
    /// Missing, malformed or expired tokens and unknown or disabled
    /// principals are `Unauthenticated`. A principal without membership in
    /// the selected organization is `Forbidden` unless they are a superadmin.
    pub async fn resolve(&self, headers: &HeaderMap) -> Result<SessionIdentity, IdentityError> {
        let result = self.resolve_inner(headers).await;
        let label = match &result {
            Ok(_) => "ok",
            Err(IdentityError::Unauthenticated(_)) => "unauthenticated",
            Err(IdentityError::Forbidden { .. } | IdentityError::NotSuperadmin(_)) => "forbidden",
            Err(_) => "error",
        };
        counter!("session_resolve_total", "result" => label).increment(1);
        result
    }

    async fn resolve_inner(&self, headers: &HeaderMap) -> Result<SessionIdentity, IdentityError> {
        let token = session_token(headers).ok_or(IdentityError::Unauthenticated("missing_token"))?;
        let claims = self.decode_claims(token)?;
        let principal_id = PrincipalId::parse(&claims.sub)
            .map_err(|_| IdentityError::Unauthenticated("invalid_subject"))?;
        let organization_id = OrganizationId::parse(&claims.org)
            .map_err(|_| IdentityError::Unauthenticated("invalid_organization_claim"))?;

        let principal = self
            .directory
            .find_principal(&principal_id)
            .await?
            .filter(|principal| principal.is_active())
            .ok_or(IdentityError::Unauthenticated("unknown_principal"))?;

        if !principal.is_superadmin {
            self.require_membership(&principal_id, &organization_id).await?;
        }

        debug!(stage = "identity", principal_id = %principal_id, organization_id = %organization_id, "session resolved");
        Ok(SessionIdentity {
            principal_id,
            organization_id,
            is_superadmin: principal.is_superadmin,
        })
    }

    /// Resolves the session and requires a platform administrator.
    pub async fn resolve_superadmin(
        &self,
        headers: &HeaderMap,
    ) -> Result<SessionIdentity, IdentityError> {
        let identity = self.resolve(headers).await?;
        if !identity.is_superadmin {
            return Err(IdentityError::NotSuperadmin(identity.principal_id));
        }
        Ok(identity)
    }

    /// Re-issues the session for another organization the caller may act in.
    pub async fn switch(
        &self,
        identity: &SessionIdentity,
        target: &OrganizationId,
    ) -> Result<String, IdentityError> {
        let selectable = self
            .directory
            .find_organization(target)
            .await?
            .is_some_and(|organization| organization.is_active());
        if !selectable {
            return Err(IdentityError::Forbidden {
                principal: identity.principal_id,
                organization: *target,
            });
        }
        if !identity.is_superadmin {
            self.require_membership(&identity.principal_id, target).await?;
        }

        info!(
            stage = "identity",
            principal_id = %identity.principal_id,
            from_organization = %identity.organization_id,
            to_organization = %target,
            "organization switched"
        );
        self.issue(&identity.principal_id, target)
    }

    async fn require_membership(
        &self,
        principal_id: &PrincipalId,
        organization_id: &OrganizationId,
    ) -> Result<(), IdentityError> {
        match self.directory.membership(principal_id, organization_id).await? {
            Some(_) => Ok(()),
            None => Err(IdentityError::Forbidden {
                principal: *principal_id,
                organization: *organization_id,
            }),
        }
    }

    fn decode_claims(&self, token: &str) -> Result<SessionClaims, IdentityError> {
        let claims = decode::<SessionClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|_| IdentityError::Unauthenticated("invalid_token"))?
            .claims;
        let now = (self.clock)().timestamp();
        if let Some(nbf) = claims.nbf {
            if now < nbf as i64 {
                return Err(IdentityError::Unauthenticated("token_not_yet_valid"));
            }
        }
        if now >= claims.exp as i64 {
            return Err(IdentityError::Unauthenticated("token_expired"));
        }
        Ok(claims)
    }
}

/// Bearer token first, then the session cookie.
fn session_token(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty());
    if bearer.is_some() {
        return bearer;
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, token)| token.trim())
        .filter(|token| !token.is_empty())
}

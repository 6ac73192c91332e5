//! Platform administration endpoints.
//!
//! These run outside any tenant scope and are restricted to superadmins.
//! Every mutation lands in the platform audit log. Work that touches tenant
//! rows still goes through the guard, one organization at a time.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use fieldbook_core::{
    entities::NewClient, settings::OrganizationSettings, Industry, Membership, NewOrganization,
    NewPrincipal, Organization, OrganizationId, Principal, PrincipalId, Role,
};
use fieldbook_storage::{DataError, DirectoryError, OrganizationSummary};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::{api::record, problem::ApiError, router::AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/platform/organizations",
            get(list_organizations).post(provision_organization),
        )
        .route("/platform/organizations/:id/disable", post(disable_organization))
        .route("/platform/organizations/:id/members", post(add_member))
        .route("/platform/organizations/:id/copy-clients", post(copy_clients))
}

async fn list_organizations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<OrganizationSummary>>, ApiError> {
    let result = summaries(&state, &headers).await;
    record("platform.organizations.list", &result);
    result.map(Json)
}

async fn summaries(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Vec<OrganizationSummary>, ApiError> {
    let identity = state.identity().resolve_superadmin(headers).await?;
    Ok(state
        .aggregator()
        .organization_summaries(&identity.principal_id)
        .await?)
}

#[derive(Debug, Deserialize)]
struct ProvisionRequest {
    slug: String,
    display_name: String,
    industry: Industry,
    #[serde(default)]
    settings: OrganizationSettings,
    owner_email: String,
    #[serde(default)]
    owner_display_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct Provisioned {
    organization: Organization,
    owner: Membership,
}

async fn provision_organization(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ProvisionRequest>,
) -> Result<(StatusCode, Json<Provisioned>), ApiError> {
    let result = provision(&state, &headers, request).await;
    record("platform.organizations.create", &result);
    Ok((StatusCode::CREATED, Json(result?)))
}

async fn provision(
    state: &AppState,
    headers: &HeaderMap,
    request: ProvisionRequest,
) -> Result<Provisioned, ApiError> {
    let identity = state.identity().resolve_superadmin(headers).await?;
    let directory = state.database().directory();

    let owner = NewPrincipal {
        display_name: request
            .owner_display_name
            .unwrap_or_else(|| request.owner_email.clone()),
        email: request.owner_email,
        credential_hash: None,
        is_superadmin: false,
    };
    owner.validate().map_err(DirectoryError::from)?;

    let organization = directory
        .create_organization(NewOrganization {
            slug: request.slug,
            display_name: request.display_name,
            industry: request.industry,
            settings: request.settings,
        })
        .await?;
    let owner = find_or_create_principal(state, owner).await?;
    let membership = directory
        .grant_membership(&owner.id, &organization.id, Role::Owner)
        .await?;

    directory
        .record_platform_action(
            &identity.principal_id,
            "organization_provisioned",
            &json!({
                "organization_id": organization.id,
                "slug": organization.slug,
                "owner_id": owner.id,
            }),
        )
        .await?;
    info!(
        stage = "platform",
        organization_id = %organization.id,
        slug = %organization.slug,
        owner_id = %owner.id,
        "organization provisioned"
    );
    Ok(Provisioned {
        organization,
        owner: membership,
    })
}

async fn find_or_create_principal(
    state: &AppState,
    new: NewPrincipal,
) -> Result<Principal, ApiError> {
    let directory = state.database().directory();
    match directory.find_principal_by_email(&new.email).await? {
        Some(existing) => Ok(existing),
        None => Ok(directory.create_principal(new).await?),
    }
}

async fn disable_organization(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<OrganizationId>,
) -> Result<Json<Organization>, ApiError> {
    let result = disable(&state, &headers, id).await;
    record("platform.organizations.disable", &result);
    result.map(Json)
}

async fn disable(
    state: &AppState,
    headers: &HeaderMap,
    id: OrganizationId,
) -> Result<Organization, ApiError> {
    let identity = state.identity().resolve_superadmin(headers).await?;
    let directory = state.database().directory();
    let organization = directory.disable_organization(&id).await?;
    directory
        .record_platform_action(
            &identity.principal_id,
            "organization_disabled",
            &json!({ "organization_id": id }),
        )
        .await?;
    Ok(organization)
}

#[derive(Debug, Deserialize)]
struct MemberRequest {
    email: String,
    #[serde(default)]
    display_name: Option<String>,
    role: Role,
}

async fn add_member(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<OrganizationId>,
    Json(request): Json<MemberRequest>,
) -> Result<(StatusCode, Json<Membership>), ApiError> {
    let result = grant(&state, &headers, id, request).await;
    record("platform.members.create", &result);
    Ok((StatusCode::CREATED, Json(result?)))
}

async fn grant(
    state: &AppState,
    headers: &HeaderMap,
    organization_id: OrganizationId,
    request: MemberRequest,
) -> Result<Membership, ApiError> {
    let identity = state.identity().resolve_superadmin(headers).await?;
    let directory = state.database().directory();
    if directory.find_organization(&organization_id).await?.is_none() {
        return Err(ApiError::BadRequest(format!(
            "organization {organization_id} does not exist"
        )));
    }

    let principal = find_or_create_principal(
        state,
        NewPrincipal {
            display_name: request.display_name.unwrap_or_else(|| request.email.clone()),
            email: request.email,
            credential_hash: None,
            is_superadmin: false,
        },
    )
    .await?;
    let membership = directory
        .grant_membership(&principal.id, &organization_id, request.role)
        .await?;
    directory
        .record_platform_action(
            &identity.principal_id,
            "membership_granted",
            &json!({
                "organization_id": organization_id,
                "principal_id": principal.id,
                "role": request.role,
            }),
        )
        .await?;
    Ok(membership)
}

#[derive(Debug, Deserialize)]
struct CopyClientsRequest {
    target_organization_id: OrganizationId,
    #[serde(default)]
    include_archived: bool,
}

#[derive(Debug, Serialize)]
struct CopyReport {
    source_organization_id: OrganizationId,
    target_organization_id: OrganizationId,
    copied: usize,
}

async fn copy_clients(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(source): Path<OrganizationId>,
    Json(request): Json<CopyClientsRequest>,
) -> Result<Json<CopyReport>, ApiError> {
    let result = copy(&state, &headers, source, request).await;
    record("platform.copy_clients", &result);
    result.map(Json)
}

/// Copies client records across organizations with two sequential scopes.
///
/// The source scope is closed before the target scope opens; no connection
/// ever carries both tenants. Archived clients stay archived in the target.
async fn copy(
    state: &AppState,
    headers: &HeaderMap,
    source: OrganizationId,
    request: CopyClientsRequest,
) -> Result<CopyReport, ApiError> {
    let identity = state.identity().resolve_superadmin(headers).await?;
    let target = request.target_organization_id;
    if source == target {
        return Err(ApiError::BadRequest(
            "source and target organization must differ".to_string(),
        ));
    }
    let principal: PrincipalId = identity.principal_id;
    let include_archived = request.include_archived;

    let clients = state
        .guard()
        .run(&source, &principal, move |scope| {
            async move { scope.clients().list(include_archived).await }.boxed()
        })
        .await
        .map_err(ApiError::from)?;

    let copied = state
        .guard()
        .run(&target, &principal, move |scope| {
            async move {
                let mut copied = 0usize;
                for client in clients {
                    let created = scope
                        .clients()
                        .create(NewClient {
                            display_name: client.display_name,
                            email: client.email,
                            phone: client.phone,
                            notes: client.notes,
                        })
                        .await?;
                    if client.archived {
                        scope.clients().archive(&created.id).await?;
                    }
                    copied += 1;
                }
                Ok::<_, DataError>(copied)
            }
            .boxed()
        })
        .await
        .map_err(ApiError::from)?;

    state
        .database()
        .directory()
        .record_platform_action(
            &principal,
            "clients_copied",
            &json!({
                "source_organization_id": source,
                "target_organization_id": target,
                "copied": copied,
            }),
        )
        .await?;
    info!(
        stage = "platform",
        source_organization_id = %source,
        target_organization_id = %target,
        copied,
        "clients copied between organizations"
    );
    Ok(CopyReport {
        source_organization_id: source,
        target_organization_id: target,
        copied,
    })
}

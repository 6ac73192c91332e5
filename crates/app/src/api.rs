//! Tenant-facing HTTP handlers.
//!
//! Every handler resolves the caller's session first and then does all of
//! its data access inside one tenant scope opened for the session's
//! organization. Handlers never see a connection.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use fieldbook_core::{
    entities::{
        Client, ClientUpdate, Estimate, EstimateStatus, Invoice, InvoiceStatus, Job, JobStatus,
        NewClient, NewEstimate, NewInvoice, NewJob, NewProperty, NewVisit, Property, Visit,
    },
    ClientId, EstimateId, InvoiceId, JobId, Organization, OrganizationId, OrganizationUpdate,
    VisitId,
};
use fieldbook_storage::{DataError, TenantScope};
use futures::{future::BoxFuture, FutureExt};
use metrics::counter;
use serde::{Deserialize, Serialize};

use crate::{identity::SESSION_COOKIE, problem::ApiError, router::AppState};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/session/switch", post(switch_organization))
        .route("/api/organization", get(current_organization).put(update_organization))
        .route("/api/clients", get(list_clients).post(create_client))
        .route("/api/clients/:id", get(get_client).patch(update_client))
        .route("/api/clients/:id/archive", post(archive_client))
        .route(
            "/api/clients/:id/properties",
            get(list_properties).post(create_property),
        )
        .route("/api/jobs", get(list_jobs).post(create_job))
        .route("/api/jobs/:id", get(get_job))
        .route("/api/jobs/:id/status", post(change_job_status))
        .route("/api/jobs/:id/visits", get(list_visits).post(schedule_visit))
        .route("/api/visits/:id/complete", post(complete_visit))
        .route("/api/estimates", get(list_estimates).post(create_estimate))
        .route("/api/estimates/:id", get(get_estimate))
        .route("/api/estimates/:id/status", post(change_estimate_status))
        .route("/api/estimates/:id/convert", post(convert_estimate))
        .route("/api/invoices", get(list_invoices).post(create_invoice))
        .route("/api/invoices/:id", get(get_invoice))
        .route("/api/invoices/:id/send", post(send_invoice))
        .route("/api/invoices/:id/pay", post(pay_invoice))
        .route("/api/invoices/:id/void", post(void_invoice))
}

/// Resolves the session and runs `work` in a scope for its organization.
pub(crate) async fn scoped<T, F>(
    state: &AppState,
    headers: &HeaderMap,
    route: &'static str,
    work: F,
) -> Result<T, ApiError>
where
    T: Send,
    F: for<'s> FnOnce(&'s mut TenantScope) -> BoxFuture<'s, Result<T, DataError>> + Send,
{
    let result = match state.identity().resolve(headers).await {
        Ok(identity) => state
            .guard()
            .run(&identity.organization_id, &identity.principal_id, work)
            .await
            .map_err(ApiError::from),
        Err(err) => Err(err.into()),
    };
    record(route, &result);
    result
}

pub(crate) fn record<T>(route: &'static str, result: &Result<T, ApiError>) {
    let label = match result {
        Ok(_) => "ok",
        Err(err) => err.kind(),
    };
    counter!("api_requests_total", "route" => route, "result" => label).increment(1);
}

#[derive(Debug, Deserialize)]
struct SwitchRequest {
    organization_id: OrganizationId,
}

#[derive(Debug, Serialize)]
struct SessionToken {
    token: String,
    organization_id: OrganizationId,
}

async fn switch_organization(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SwitchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let result = match state.identity().resolve(&headers).await {
        Ok(identity) => state
            .identity()
            .switch(&identity, &request.organization_id)
            .await
            .map_err(ApiError::from),
        Err(err) => Err(err.into()),
    };
    record("session.switch", &result);
    let token = result?;

    let cookie = format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax");
    Ok((
        [(header::SET_COOKIE, cookie)],
        Json(SessionToken {
            token,
            organization_id: request.organization_id,
        }),
    ))
}

async fn current_organization(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Organization>, ApiError> {
    let organization = scoped(&state, &headers, "organization.get", |scope| {
        async move { scope.organization().current().await }.boxed()
    })
    .await?;
    Ok(Json(organization))
}

async fn update_organization(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(update): Json<OrganizationUpdate>,
) -> Result<Json<Organization>, ApiError> {
    let organization = scoped(&state, &headers, "organization.update", move |scope| {
        async move { scope.organization().update(update).await }.boxed()
    })
    .await?;
    Ok(Json(organization))
}

#[derive(Debug, Default, Deserialize)]
struct ClientListQuery {
    #[serde(default)]
    include_archived: bool,
}

async fn list_clients(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ClientListQuery>,
) -> Result<Json<Vec<Client>>, ApiError> {
    let clients = scoped(&state, &headers, "clients.list", move |scope| {
        async move { scope.clients().list(query.include_archived).await }.boxed()
    })
    .await?;
    Ok(Json(clients))
}

async fn create_client(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(new): Json<NewClient>,
) -> Result<(StatusCode, Json<Client>), ApiError> {
    let client = scoped(&state, &headers, "clients.create", move |scope| {
        async move { scope.clients().create(new).await }.boxed()
    })
    .await?;
    Ok((StatusCode::CREATED, Json(client)))
}

async fn get_client(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ClientId>,
) -> Result<Json<Client>, ApiError> {
    let client = scoped(&state, &headers, "clients.get", move |scope| {
        async move { scope.clients().get(&id).await }.boxed()
    })
    .await?;
    Ok(Json(client))
}

async fn update_client(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ClientId>,
    Json(update): Json<ClientUpdate>,
) -> Result<Json<Client>, ApiError> {
    let client = scoped(&state, &headers, "clients.update", move |scope| {
        async move { scope.clients().update(&id, update).await }.boxed()
    })
    .await?;
    Ok(Json(client))
}

async fn archive_client(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<ClientId>,
) -> Result<Json<Client>, ApiError> {
    let client = scoped(&state, &headers, "clients.archive", move |scope| {
        async move { scope.clients().archive(&id).await }.boxed()
    })
    .await?;
    Ok(Json(client))
}

async fn list_properties(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(client_id): Path<ClientId>,
) -> Result<Json<Vec<Property>>, ApiError> {
    let properties = scoped(&state, &headers, "properties.list", move |scope| {
        async move {
            // An unknown client is a 404, not an empty list.
            scope.clients().get(&client_id).await?;
            scope.properties().list_for_client(&client_id).await
        }
        .boxed()
    })
    .await?;
    Ok(Json(properties))
}

async fn create_property(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(client_id): Path<ClientId>,
    Json(new): Json<NewProperty>,
) -> Result<(StatusCode, Json<Property>), ApiError> {
    let property = scoped(&state, &headers, "properties.create", move |scope| {
        async move { scope.properties().create(&client_id, new).await }.boxed()
    })
    .await?;
    Ok((StatusCode::CREATED, Json(property)))
}

#[derive(Debug, Deserialize)]
struct StatusFilter<S> {
    status: Option<S>,
}

#[derive(Debug, Deserialize)]
struct StatusChange<S> {
    status: S,
}

async fn list_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(filter): Query<StatusFilter<JobStatus>>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let jobs = scoped(&state, &headers, "jobs.list", move |scope| {
        async move { scope.jobs().list(filter.status).await }.boxed()
    })
    .await?;
    Ok(Json(jobs))
}

async fn create_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(new): Json<NewJob>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let job = scoped(&state, &headers, "jobs.create", move |scope| {
        async move { scope.jobs().create(new).await }.boxed()
    })
    .await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn get_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<JobId>,
) -> Result<Json<Job>, ApiError> {
    let job = scoped(&state, &headers, "jobs.get", move |scope| {
        async move { scope.jobs().get(&id).await }.boxed()
    })
    .await?;
    Ok(Json(job))
}

async fn change_job_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<JobId>,
    Json(change): Json<StatusChange<JobStatus>>,
) -> Result<Json<Job>, ApiError> {
    let job = scoped(&state, &headers, "jobs.status", move |scope| {
        async move { scope.jobs().update_status(&id, change.status).await }.boxed()
    })
    .await?;
    Ok(Json(job))
}

async fn list_visits(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<JobId>,
) -> Result<Json<Vec<Visit>>, ApiError> {
    let visits = scoped(&state, &headers, "visits.list", move |scope| {
        async move {
            scope.jobs().get(&job_id).await?;
            scope.jobs().list_visits(&job_id).await
        }
        .boxed()
    })
    .await?;
    Ok(Json(visits))
}

async fn schedule_visit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<JobId>,
    Json(new): Json<NewVisit>,
) -> Result<(StatusCode, Json<Visit>), ApiError> {
    let visit = scoped(&state, &headers, "visits.schedule", move |scope| {
        async move { scope.jobs().schedule_visit(&job_id, new).await }.boxed()
    })
    .await?;
    Ok((StatusCode::CREATED, Json(visit)))
}

async fn complete_visit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<VisitId>,
) -> Result<Json<Visit>, ApiError> {
    let visit = scoped(&state, &headers, "visits.complete", move |scope| {
        async move { scope.jobs().complete_visit(&id).await }.boxed()
    })
    .await?;
    Ok(Json(visit))
}

async fn list_estimates(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(filter): Query<StatusFilter<EstimateStatus>>,
) -> Result<Json<Vec<Estimate>>, ApiError> {
    let estimates = scoped(&state, &headers, "estimates.list", move |scope| {
        async move { scope.estimates().list(filter.status).await }.boxed()
    })
    .await?;
    Ok(Json(estimates))
}

async fn create_estimate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(new): Json<NewEstimate>,
) -> Result<(StatusCode, Json<Estimate>), ApiError> {
    let estimate = scoped(&state, &headers, "estimates.create", move |scope| {
        async move { scope.estimates().create(new).await }.boxed()
    })
    .await?;
    Ok((StatusCode::CREATED, Json(estimate)))
}

async fn get_estimate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<EstimateId>,
) -> Result<Json<Estimate>, ApiError> {
    let estimate = scoped(&state, &headers, "estimates.get", move |scope| {
        async move { scope.estimates().get(&id).await }.boxed()
    })
    .await?;
    Ok(Json(estimate))
}

async fn change_estimate_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<EstimateId>,
    Json(change): Json<StatusChange<EstimateStatus>>,
) -> Result<Json<Estimate>, ApiError> {
    let estimate = scoped(&state, &headers, "estimates.status", move |scope| {
        async move { scope.estimates().update_status(&id, change.status).await }.boxed()
    })
    .await?;
    Ok(Json(estimate))
}

#[derive(Debug, Serialize)]
struct Conversion {
    estimate: Estimate,
    job: Job,
}

async fn convert_estimate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<EstimateId>,
) -> Result<(StatusCode, Json<Conversion>), ApiError> {
    let (estimate, job) = scoped(&state, &headers, "estimates.convert", move |scope| {
        async move { scope.estimates().convert_to_job(&id).await }.boxed()
    })
    .await?;
    Ok((StatusCode::CREATED, Json(Conversion { estimate, job })))
}

async fn list_invoices(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(filter): Query<StatusFilter<InvoiceStatus>>,
) -> Result<Json<Vec<Invoice>>, ApiError> {
    let invoices = scoped(&state, &headers, "invoices.list", move |scope| {
        async move { scope.invoices().list(filter.status).await }.boxed()
    })
    .await?;
    Ok(Json(invoices))
}

async fn create_invoice(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(new): Json<NewInvoice>,
) -> Result<(StatusCode, Json<Invoice>), ApiError> {
    let invoice = scoped(&state, &headers, "invoices.create", move |scope| {
        async move { scope.invoices().create(new).await }.boxed()
    })
    .await?;
    Ok((StatusCode::CREATED, Json(invoice)))
}

async fn get_invoice(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<InvoiceId>,
) -> Result<Json<Invoice>, ApiError> {
    let invoice = scoped(&state, &headers, "invoices.get", move |scope| {
        async move { scope.invoices().get(&id).await }.boxed()
    })
    .await?;
    Ok(Json(invoice))
}

async fn send_invoice(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<InvoiceId>,
) -> Result<Json<Invoice>, ApiError> {
    let invoice = scoped(&state, &headers, "invoices.send", move |scope| {
        async move { scope.invoices().send(&id).await }.boxed()
    })
    .await?;
    Ok(Json(invoice))
}

async fn pay_invoice(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<InvoiceId>,
) -> Result<Json<Invoice>, ApiError> {
    let invoice = scoped(&state, &headers, "invoices.pay", move |scope| {
        async move { scope.invoices().record_payment(&id).await }.boxed()
    })
    .await?;
    Ok(Json(invoice))
}

async fn void_invoice(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<InvoiceId>,
) -> Result<Json<Invoice>, ApiError> {
    let invoice = scoped(&state, &headers, "invoices.void", move |scope| {
        async move { scope.invoices().void(&id).await }.boxed()
    })
    .await?;
    Ok(Json(invoice))
}

use std::time::Duration;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use fieldbook_storage::{Database, PlatformAggregator, TenantGuard};
use metrics_exporter_prometheus::PrometheusHandle;

use crate::{api, identity::IdentityResolver, platform, telemetry};

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    database: Database,
    guard: TenantGuard,
    identity: IdentityResolver,
    aggregator: PlatformAggregator,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        database: Database,
        guard: TenantGuard,
        session_secret: &[u8],
        session_ttl: Duration,
    ) -> Self {
        let identity = IdentityResolver::new(database.directory(), session_secret, session_ttl);
        let aggregator = database.aggregator();
        Self {
            metrics,
            database,
            guard,
            identity,
            aggregator,
        }
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn guard(&self) -> &TenantGuard {
        &self.guard
    }

    pub fn identity(&self) -> &IdentityResolver {
        &self.identity
    }

    pub fn aggregator(&self) -> &PlatformAggregator {
        &self.aggregator
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .merge(api::routes())
        .merge(platform::routes())
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

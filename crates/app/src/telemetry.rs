use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{
    BuildError as PrometheusBuildError, PrometheusBuilder, PrometheusHandle,
};
use std::{
    sync::{Mutex, OnceLock, PoisonError},
    time::Instant,
};
use thiserror::Error;
use tracing_subscriber::{
    fmt::{self as tracing_fmt, time::UtcTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use fieldbook_util::{AppConfig, Environment};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to initialize tracing: {0}")]
    Tracing(#[from] tracing_subscriber::util::TryInitError),
    #[error("failed to initialize prometheus recorder: {0}")]
    Metrics(#[from] PrometheusBuildError),
}

static TRACING_INIT: OnceLock<()> = OnceLock::new();
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_INSTALL_GUARD: OnceLock<Mutex<()>> = OnceLock::new();
static START_TIME: OnceLock<Instant> = OnceLock::new();

const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

fn build_git_sha() -> &'static str {
    option_env!("GIT_SHA").unwrap_or("unknown")
}

pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryError> {
    if TRACING_INIT.get().is_some() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    let base = || {
        tracing_fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_timer(UtcTime::rfc_3339())
    };
    match config.environment {
        Environment::Development | Environment::Test => registry.with(base().pretty()).try_init()?,
        Environment::Production => registry.with(base().json()).try_init()?,
    }

    TRACING_INIT.set(()).ok();
    tracing::info!(stage = "telemetry", env = %config.environment.as_str(), version = BUILD_VERSION, git_sha = build_git_sha(), "tracing initialized");
    Ok(())
}

pub fn init_metrics() -> Result<PrometheusHandle, TelemetryError> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let guard = METRICS_INSTALL_GUARD
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner);

    if let Some(handle) = METRICS_HANDLE.get() {
        drop(guard);
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    METRICS_HANDLE.set(handle.clone()).ok();
    drop(guard);

    describe_gauge!("app_build_info", "Build metadata for the running binary");
    describe_gauge!("app_uptime_seconds", "Seconds since the process started");
    describe_counter!(
        "tenant_scope_total",
        "Count of closed tenant scopes, labelled by result"
    );
    describe_histogram!(
        "tenant_scope_duration_seconds",
        "Lifetime of tenant scopes from bind to verified reset"
    );
    describe_counter!(
        "isolation_integrity_failures_total",
        "Count of connections discarded because their tenant binding could not be cleared, labelled by stage"
    );
    describe_counter!(
        "tenant_nested_mismatch_total",
        "Count of attempts to enter a second organization inside an active scope"
    );
    describe_counter!(
        "platform_aggregation_total",
        "Count of cross-tenant summary requests, labelled by result"
    );
    describe_counter!(
        "session_resolve_total",
        "Count of session identity resolutions, labelled by result"
    );
    describe_counter!(
        "api_requests_total",
        "Count of API requests, labelled by route and result"
    );
    describe_counter!(
        "invoice_sweep_total",
        "Count of per-organization overdue invoice sweeps, labelled by result"
    );
    describe_counter!(
        "invoices_marked_overdue_total",
        "Count of invoices moved to overdue by the sweeper"
    );
    START_TIME.get_or_init(Instant::now);

    Ok(handle)
}

pub fn render_metrics(handle: &PrometheusHandle) -> String {
    let mut body = handle.render();
    if !body.is_empty() && !body.ends_with('\n') {
        body.push('\n');
    }

    body.push_str("# TYPE app_build_info gauge\n");
    body.push_str(&format!(
        "app_build_info{{version=\"{}\",git=\"{}\"}} 1\n",
        BUILD_VERSION,
        build_git_sha()
    ));

    let uptime = START_TIME
        .get()
        .map(|start| start.elapsed().as_secs_f64())
        .unwrap_or_default();
    body.push_str("# TYPE app_uptime_seconds gauge\n");
    body.push_str(&format!("app_uptime_seconds {}\n", uptime));

    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_metrics_carry_build_info_and_uptime() {
        let handle = init_metrics().expect("metrics");
        metrics::counter!("tenant_scope_total", "result" => "released").increment(1);
        let body = render_metrics(&handle);
        assert!(body.contains("app_build_info{version="));
        assert!(body.contains("app_uptime_seconds"));
        assert!(body.ends_with('\n'));
    }
}

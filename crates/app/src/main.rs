mod api;
mod identity;
mod platform;
mod problem;
mod router;
mod sweeper;
mod telemetry;

use std::net::SocketAddr;

use fieldbook_core::PrincipalId;
use fieldbook_storage::{Database, TenantGuard};
use fieldbook_util::{load_env_file, AppConfig};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect_with(&config.database_url, config.db_max_connections).await?;
    database.run_migrations().await?;

    let report = database.audit().run().await?;
    if !report.is_clean() {
        error!(stage = "app", isolation_integrity = true, findings = report.findings.len(), %report, "isolation audit failed; refusing to serve");
        return Err(format!("isolation audit failed:\n{report}").into());
    }
    info!(stage = "app", "isolation audit clean");

    let guard = TenantGuard::new(database.clone());

    match config.system_principal.as_deref() {
        Some(raw) => {
            let principal = PrincipalId::parse(raw)?;
            sweeper::OverdueSweeper::new(
                database.clone(),
                guard.clone(),
                principal,
                config.sweep_interval,
            )
            .spawn();
            info!(stage = "app", principal_id = %principal, interval_secs = config.sweep_interval.as_secs(), "overdue sweeper started");
        }
        None => warn!(stage = "app", "APP_SYSTEM_PRINCIPAL not set; overdue sweeper disabled"),
    }

    let state = router::AppState::new(
        metrics,
        database,
        guard,
        &config.session_secret,
        config.session_ttl,
    );

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}

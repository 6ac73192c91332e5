//! The session tenant parameter: one row in each connection's
//! `temp.tenant_session`, present only while a scope is open.

use chrono::Utc;
use fieldbook_core::TenantContext;
use metrics::counter;
use sqlx::SqliteConnection;
use tracing::{debug, error};

use crate::{
    schema::{self, SESSION_TABLE, TENANT_TABLES},
    to_rfc3339,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArmState {
    /// Guard views and triggers are installed on this connection.
    Armed,
    /// Tenant tables do not exist yet (before migrations).
    SchemaMissing,
}

pub(crate) async fn install_session_table(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    sqlx::query(&schema::session_table_ddl())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Installs the guard objects on this connection once the tenant tables exist.
pub(crate) async fn arm(conn: &mut SqliteConnection) -> Result<ArmState, sqlx::Error> {
    let tables_sql = format!(
        "SELECT COUNT(*) FROM main.sqlite_master WHERE type = 'table' AND name IN ({})",
        placeholders(TENANT_TABLES.len())
    );
    let mut tables = sqlx::query_as::<_, (i64,)>(&tables_sql);
    for table in TENANT_TABLES {
        tables = tables.bind(table.name);
    }
    let (present,) = tables.fetch_one(&mut *conn).await?;
    if present == 0 {
        return Ok(ArmState::SchemaMissing);
    }

    let expected = schema::expected_guard_objects();
    let objects_sql = format!(
        "SELECT COUNT(*) FROM temp.sqlite_master WHERE type IN ('view', 'trigger') AND name IN ({})",
        placeholders(expected.len())
    );
    let mut objects = sqlx::query_as::<_, (i64,)>(&objects_sql);
    for name in &expected {
        objects = objects.bind(name.as_str());
    }
    let (installed,) = objects.fetch_one(&mut *conn).await?;
    if installed as usize == expected.len() {
        return Ok(ArmState::Armed);
    }

    for statement in schema::all_guard_ddl() {
        sqlx::query(&statement).execute(&mut *conn).await?;
    }
    debug!(stage = "storage", objects = expected.len(), "tenant guard armed on connection");
    Ok(ArmState::Armed)
}

/// Sets the session tenant parameter.
///
/// Fails when a binding is already present, which only happens on a
/// connection that escaped teardown.
pub(crate) async fn bind(
    conn: &mut SqliteConnection,
    context: &TenantContext,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        "INSERT INTO temp.{SESSION_TABLE} (slot, organization_id, principal_id, bound_at) \
         VALUES (1, ?, ?, ?)"
    ))
    .bind(context.organization_id.to_string())
    .bind(context.principal_id.to_string())
    .bind(to_rfc3339(Utc::now()))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Clears the session tenant parameter and reads it back.
///
/// Returns `Ok(false)` when the binding survived the reset.
pub(crate) async fn reset(conn: &mut SqliteConnection) -> Result<bool, sqlx::Error> {
    sqlx::query(&format!("DELETE FROM temp.{SESSION_TABLE}"))
        .execute(&mut *conn)
        .await?;
    Ok(bound_tenant(conn).await?.is_none())
}

pub(crate) async fn bound_tenant(conn: &mut SqliteConnection) -> Result<Option<String>, sqlx::Error> {
    let row: Option<(String,)> = sqlx::query_as(&format!(
        "SELECT organization_id FROM temp.{SESSION_TABLE} WHERE slot = 1"
    ))
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(|(organization_id,)| organization_id))
}

/// Pool checkout hook: only neutral, armed connections leave the pool.
pub(crate) async fn admit(conn: &mut SqliteConnection) -> Result<bool, sqlx::Error> {
    if let Some(organization_id) = bound_tenant(conn).await? {
        report_residual("checkout", &organization_id);
        return Ok(false);
    }
    arm(conn).await?;
    Ok(true)
}

/// Pool release hook: a connection still carrying a binding is closed
/// instead of being returned.
pub(crate) async fn readmit(conn: &mut SqliteConnection) -> Result<bool, sqlx::Error> {
    match bound_tenant(conn).await {
        Ok(None) => Ok(true),
        Ok(Some(organization_id)) => {
            report_residual("release", &organization_id);
            Ok(false)
        }
        Err(err) => {
            error!(stage = "storage", error = %err, "could not verify connection on release; closing it");
            Ok(false)
        }
    }
}

fn report_residual(hook: &'static str, organization_id: &str) {
    counter!("isolation_integrity_failures_total", "stage" => hook).increment(1);
    error!(
        stage = "storage",
        hook,
        organization_id,
        "pooled connection still carries a tenant binding; closing it"
    );
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

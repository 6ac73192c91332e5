//! The tenant context guard.
//!
//! Every read or write of tenant-scoped data runs inside a [`TenantScope`],
//! and [`TenantGuard::run`] is the only way to get one. Opening a scope
//! resolves the organization, runs the capability check, checks a dedicated
//! connection out of the pool, binds the tenant into that connection's
//! session table and takes the write lock with `BEGIN IMMEDIATE`. Closing it
//! ends the transaction, clears the binding and confirms the clear before
//! the connection goes back to the pool. A scope dropped without being
//! closed (a cancelled request, a panicking unit of work) takes its
//! connection with it instead of returning it.

use std::{fmt, sync::Arc, time::Instant};

use fieldbook_core::{OrganizationId, PrincipalId, TenantContext};
use futures::future::BoxFuture;
use metrics::{counter, histogram};
use sqlx::{pool::PoolConnection, Sqlite, SqliteConnection};
use tracing::{debug, error, warn};

use crate::{
    capability::{CapabilityCheck, DirectoryCapability},
    error::{DataError, IsolationError},
    scoped::{
        ClientRepository, EstimateRepository, InvoiceRepository, JobRepository,
        OrganizationRepository, PropertyRepository, VisitRepository,
    },
    session, Database,
};

tokio::task_local! {
    static ACTIVE_TENANT: TenantContext;
}

/// The tenant bound to the currently executing unit of work, if any.
pub fn current_context() -> Option<TenantContext> {
    ACTIVE_TENANT.try_with(Clone::clone).ok()
}

/// How a scope's connection left it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeOutcome {
    /// Reset, verified neutral and returned to the pool.
    Released,
    /// Closed without being returned.
    Discarded,
}

impl ScopeOutcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Released => "released",
            Self::Discarded => "discarded",
        }
    }
}

/// Hook for watching scopes open and close.
pub trait ScopeObserver: Send + Sync {
    fn scope_opened(&self, _context: &TenantContext) {}
    fn scope_closed(&self, _context: &TenantContext, _outcome: ScopeOutcome) {}
}

/// Opens tenant scopes.
pub struct TenantGuard<C = DirectoryCapability> {
    database: Database,
    capability: C,
    observer: Option<Arc<dyn ScopeObserver>>,
}

impl<C: Clone> Clone for TenantGuard<C> {
    fn clone(&self) -> Self {
        Self {
            database: self.database.clone(),
            capability: self.capability.clone(),
            observer: self.observer.clone(),
        }
    }
}

impl TenantGuard<DirectoryCapability> {
    pub fn new(database: Database) -> Self {
        let capability = DirectoryCapability::new(database.directory());
        Self::with_capability(database, capability)
    }
}

impl<C: CapabilityCheck> TenantGuard<C> {
    pub fn with_capability(database: Database, capability: C) -> Self {
        Self {
            database,
            capability,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ScopeObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Runs `unit_of_work` inside a scope bound to `organization_id`.
    ///
    /// The transaction commits when the unit of work returns `Ok` and rolls
    /// back otherwise. Teardown runs exactly once whatever the outcome; an
    /// integrity failure during teardown replaces the unit of work's result.
    ///
    /// One scope per task: a nested `run` fails fast with
    /// [`IsolationError::NestedContextMismatch`] for another organization and
    /// [`IsolationError::NestedScope`] for the same one.
    pub async fn run<T, E, F>(
        &self,
        organization_id: &OrganizationId,
        principal_id: &PrincipalId,
        unit_of_work: F,
    ) -> Result<T, E>
    where
        F: for<'s> FnOnce(&'s mut TenantScope) -> BoxFuture<'s, Result<T, E>> + Send,
        T: Send,
        E: From<IsolationError> + fmt::Display + Send,
    {
        let mut scope = self.enter(organization_id, principal_id).await?;
        let context = scope.context().clone();
        let outcome = ACTIVE_TENANT.scope(context, unit_of_work(&mut scope)).await;
        let teardown = scope.close(outcome.is_ok()).await;

        match (outcome, teardown) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) => Err(err.into()),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(teardown)) if teardown.is_fatal() => {
                warn!(
                    stage = "guard",
                    error = %err,
                    "unit of work error superseded by teardown integrity failure"
                );
                Err(teardown.into())
            }
            (Err(err), Err(teardown)) => {
                warn!(stage = "guard", error = %teardown, "teardown failed after unit of work error");
                Err(err)
            }
        }
    }

    /// Opens the scope `run` executes in. Only `run` calls this, so every live
    /// scope has its context published through [`current_context`].
    async fn enter(
        &self,
        organization_id: &OrganizationId,
        principal_id: &PrincipalId,
    ) -> Result<TenantScope, IsolationError> {
        if let Some(active) = current_context() {
            if active.organization_id != *organization_id {
                counter!("tenant_nested_mismatch_total").increment(1);
                warn!(
                    stage = "guard",
                    active = %active.organization_id,
                    requested = %organization_id,
                    "refusing nested scope for a different organization"
                );
                return Err(IsolationError::NestedContextMismatch {
                    active: active.organization_id,
                    requested: *organization_id,
                });
            }
            // The outer scope holds the write lock; a second connection would block on it.
            debug!(stage = "guard", organization_id = %organization_id, "refusing nested scope");
            return Err(IsolationError::NestedScope(*organization_id));
        }

        let organization = self
            .database
            .directory()
            .find_organization(organization_id)
            .await?;
        if !organization.is_some_and(|organization| organization.is_active()) {
            counter!("tenant_scope_total", "result" => "invalid_organization").increment(1);
            return Err(IsolationError::InvalidOrganization(organization_id.to_string()));
        }

        let grant = match self.capability.authorize(principal_id, organization_id).await {
            Ok(grant) => grant,
            Err(err) => {
                counter!("tenant_scope_total", "result" => "unauthorized").increment(1);
                debug!(stage = "guard", organization_id = %organization_id, principal_id = %principal_id, "capability check refused");
                return Err(err);
            }
        };
        let context = TenantContext::new(*organization_id, *principal_id, grant);

        let mut conn = self.database.pool().acquire().await?;
        if session::arm(&mut conn).await? != session::ArmState::Armed {
            return Err(IsolationError::Integrity(
                "tenant guard objects are not installed; run migrations first".to_string(),
            ));
        }
        if let Err(err) = session::bind(&mut conn, &context).await {
            let _ = conn.detach();
            record_integrity_failure("bind", organization_id, &err.to_string());
            return Err(IsolationError::Integrity(format!(
                "could not bind tenant to connection: {err}"
            )));
        }
        if let Err(err) = sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await {
            match session::reset(&mut conn).await {
                Ok(true) => drop(conn),
                _ => {
                    let _ = conn.detach();
                }
            }
            return Err(IsolationError::Database(err));
        }

        if let Some(observer) = &self.observer {
            observer.scope_opened(&context);
        }
        debug!(
            stage = "guard",
            organization_id = %context.organization_id,
            principal_id = %context.principal_id,
            "tenant scope opened"
        );

        Ok(TenantScope {
            context,
            conn: Some(conn),
            observer: self.observer.clone(),
            opened: Instant::now(),
        })
    }
}

/// Proof that a tenant is bound. Data operations are only reachable through it.
pub struct TenantScope {
    context: TenantContext,
    conn: Option<PoolConnection<Sqlite>>,
    observer: Option<Arc<dyn ScopeObserver>>,
    opened: Instant,
}

impl fmt::Debug for TenantScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantScope")
            .field("context", &self.context)
            .field("active", &self.is_active())
            .finish()
    }
}

impl TenantScope {
    pub fn context(&self) -> &TenantContext {
        &self.context
    }

    pub fn organization_id(&self) -> &OrganizationId {
        &self.context.organization_id
    }

    /// False once the scope has been closed.
    pub fn is_active(&self) -> bool {
        self.conn.is_some()
    }

    pub fn clients(&mut self) -> ClientRepository<'_> {
        ClientRepository::new(self)
    }

    pub fn properties(&mut self) -> PropertyRepository<'_> {
        PropertyRepository::new(self)
    }

    pub fn jobs(&mut self) -> JobRepository<'_> {
        JobRepository::new(self)
    }

    pub fn visits(&mut self) -> VisitRepository<'_> {
        VisitRepository::new(self)
    }

    pub fn estimates(&mut self) -> EstimateRepository<'_> {
        EstimateRepository::new(self)
    }

    pub fn invoices(&mut self) -> InvoiceRepository<'_> {
        InvoiceRepository::new(self)
    }

    pub fn organization(&mut self) -> OrganizationRepository<'_> {
        OrganizationRepository::new(self)
    }

    pub(crate) fn connection(&mut self) -> Result<&mut SqliteConnection, IsolationError> {
        self.conn
            .as_deref_mut()
            .ok_or(IsolationError::NoActiveScope)
    }

    /// Rejects a row that does not belong to the bound tenant.
    pub(crate) fn ensure_owned(&self, organization_id: &str) -> Result<(), DataError> {
        if organization_id == self.context.organization_id.to_string() {
            return Ok(());
        }
        record_integrity_failure("read", &self.context.organization_id, organization_id);
        Err(IsolationError::Integrity(format!(
            "row owned by {organization_id} surfaced in scope for {}",
            self.context.organization_id
        ))
        .into())
    }

    /// Ends the transaction, clears the binding and returns the connection.
    ///
    /// `run` calls this when the unit of work finishes; calling it earlier
    /// commits or rolls back in place. Idempotent; a closed scope rejects
    /// further data operations with [`IsolationError::NoActiveScope`].
    pub async fn close(&mut self, commit: bool) -> Result<(), IsolationError> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };

        let mut outcome = Ok(());
        let end = if commit { "COMMIT" } else { "ROLLBACK" };
        if let Err(err) = sqlx::query(end).execute(&mut *conn).await {
            if commit {
                match sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    Ok(_) => outcome = Err(IsolationError::Database(err)),
                    Err(rollback) if no_transaction_active(&rollback) => {
                        outcome = Err(IsolationError::Database(err));
                    }
                    Err(rollback) => {
                        return Err(
                            self.discard(conn, &format!("transaction did not end: {rollback}"))
                        );
                    }
                }
            } else if !no_transaction_active(&err) {
                return Err(self.discard(conn, &format!("transaction did not end: {err}")));
            }
        }

        match session::reset(&mut conn).await {
            Ok(true) => {}
            Ok(false) => return Err(self.discard(conn, "tenant binding survived reset")),
            Err(err) => return Err(self.discard(conn, &format!("reset failed: {err}"))),
        }
        drop(conn);

        let result = if outcome.is_ok() { "ok" } else { "error" };
        counter!("tenant_scope_total", "result" => result).increment(1);
        histogram!("tenant_scope_duration_seconds").record(self.opened.elapsed().as_secs_f64());
        self.notify_closed(ScopeOutcome::Released);
        debug!(
            stage = "guard",
            organization_id = %self.context.organization_id,
            committed = commit && outcome.is_ok(),
            "tenant scope closed"
        );
        outcome
    }

    fn discard(&self, conn: PoolConnection<Sqlite>, reason: &str) -> IsolationError {
        let _ = conn.detach();
        record_integrity_failure("teardown", &self.context.organization_id, reason);
        counter!("tenant_scope_total", "result" => "integrity").increment(1);
        self.notify_closed(ScopeOutcome::Discarded);
        IsolationError::Integrity(reason.to_string())
    }

    fn notify_closed(&self, outcome: ScopeOutcome) {
        if let Some(observer) = &self.observer {
            observer.scope_closed(&self.context, outcome);
        }
    }
}

impl Drop for TenantScope {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        // The binding may still be set; the connection must not be pooled.
        drop(conn.detach());
        counter!("tenant_scope_total", "result" => ScopeOutcome::Discarded.as_str()).increment(1);
        warn!(
            stage = "guard",
            organization_id = %self.context.organization_id,
            "tenant scope dropped before close; connection discarded"
        );
        self.notify_closed(ScopeOutcome::Discarded);
    }
}

fn no_transaction_active(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.message().contains("no transaction is active"))
}

fn record_integrity_failure(stage: &'static str, organization_id: &OrganizationId, detail: &str) {
    counter!("isolation_integrity_failures_total", "stage" => stage).increment(1);
    error!(
        stage = "guard",
        phase = stage,
        organization_id = %organization_id,
        detail,
        "tenant isolation integrity failure"
    );
}

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use fieldbook_core::{OrganizationId, PrincipalId};
use fieldbook_storage::{DataError, Database, DirectoryError, TenantGuard};
use futures::FutureExt;
use metrics::counter;
use thiserror::Error;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{error, info, warn};

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Background worker that flags sent invoices past their due date.
///
/// Each organization is swept in its own scope, acting as the configured
/// system principal.
#[derive(Clone)]
pub struct OverdueSweeper {
    database: Database,
    guard: TenantGuard,
    principal: PrincipalId,
    interval: Duration,
    clock: Clock,
}

/// Totals from one pass over every active organization.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub organizations: usize,
    pub marked_overdue: usize,
    pub failed: usize,
}

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("failed to list active organizations: {0}")]
    Directory(#[from] DirectoryError),
    #[error("tenant isolation failure while sweeping {organization}: {source}")]
    Integrity {
        organization: OrganizationId,
        #[source]
        source: DataError,
    },
}

impl OverdueSweeper {
    pub fn new(
        database: Database,
        guard: TenantGuard,
        principal: PrincipalId,
        interval: Duration,
    ) -> Self {
        Self {
            database,
            guard,
            principal,
            interval,
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                error!(stage = "sweeper", error = %err, "overdue sweep failed");
            }
        }
    }

    /// Sweeps every active organization once.
    ///
    /// A failing organization does not stop the pass. Integrity failures do:
    /// they are returned immediately.
    pub async fn run_once(&self) -> Result<SweepReport, SweepError> {
        let organizations = self.database.directory().active_organization_ids().await?;
        let mut report = SweepReport {
            organizations: organizations.len(),
            ..SweepReport::default()
        };

        for organization in organizations {
            match self.sweep_with_retry(&organization).await {
                Ok(marked) => {
                    report.marked_overdue += marked;
                    counter!("invoice_sweep_total", "result" => "ok").increment(1);
                    counter!("invoices_marked_overdue_total").increment(marked as u64);
                }
                Err(err) if err.is_fatal() => {
                    counter!("invoice_sweep_total", "result" => "integrity").increment(1);
                    return Err(SweepError::Integrity {
                        organization,
                        source: err,
                    });
                }
                Err(err) => {
                    report.failed += 1;
                    counter!("invoice_sweep_total", "result" => "error").increment(1);
                    warn!(stage = "sweeper", organization_id = %organization, error = %err, "organization sweep failed");
                }
            }
        }

        info!(
            stage = "sweeper",
            organizations = report.organizations,
            marked_overdue = report.marked_overdue,
            failed = report.failed,
            "overdue sweep completed"
        );
        Ok(report)
    }

    async fn sweep_with_retry(&self, organization: &OrganizationId) -> Result<usize, DataError> {
        let mut attempt = 1;
        loop {
            match self.sweep(organization).await {
                Err(err) if err.is_transient() && attempt < MAX_ATTEMPTS => {
                    warn!(
                        stage = "sweeper",
                        organization_id = %organization,
                        attempt,
                        error = %err,
                        "transient storage error; retrying"
                    );
                    sleep(RETRY_BACKOFF * attempt).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn sweep(&self, organization: &OrganizationId) -> Result<usize, DataError> {
        let now = (self.clock)();
        self.guard
            .run(organization, &self.principal, move |scope| {
                async move {
                    let settings = scope.organization().current().await?.settings;
                    let today = now.with_timezone(&settings.tz()).date_naive();
                    let flagged = scope.invoices().mark_overdue(today).await?;
                    Ok::<_, DataError>(flagged.len())
                }
                .boxed()
            })
            .await
    }
}

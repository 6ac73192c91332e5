//! Verification harness for tenant isolation.
//!
//! * [`IsolationAudit::schema`] checks the live schema: every table with an
//!   `organization_id` column is registered (or explicitly exempt), the
//!   column is `NOT NULL`, the registry matches the table, and every guard
//!   view and trigger is installed on the connection.
//! * [`IsolationAudit::probe`] takes an unbound connection and confirms it
//!   sees nothing through the scoped views and cannot write tenant tables.
//! * [`SourceAudit`] scans Rust sources for SQL naming tenant tables outside
//!   the modules allowed to, and for scoped repositories reaching around the
//!   scope to the pool.

use std::{
    collections::{BTreeSet, HashSet},
    fmt, fs, io,
    path::Path,
};

use sqlx::{Connection, SqlitePool};
use tracing::{info, warn};

use crate::{
    schema::{self, ISOLATION_ABORT, ORGANIZATION_VIEW, TENANT_TABLES},
    session,
};

const ORGANIZATION_COLUMN: &str = "organization_id";
const PROBE_ORGANIZATION: &str = "00000000-0000-0000-0000-000000000000";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditFinding {
    pub check: &'static str,
    pub subject: String,
    pub problem: String,
}

impl AuditFinding {
    fn new(check: &'static str, subject: impl Into<String>, problem: impl Into<String>) -> Self {
        Self {
            check,
            subject: subject.into(),
            problem: problem.into(),
        }
    }
}

impl fmt::Display for AuditFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.check, self.subject, self.problem)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    pub findings: Vec<AuditFinding>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn merge(mut self, other: AuditReport) -> Self {
        self.findings.extend(other.findings);
        self
    }

    pub fn mentions(&self, subject: &str) -> bool {
        self.findings.iter().any(|finding| finding.subject == subject)
    }
}

impl fmt::Display for AuditReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.findings.is_empty() {
            return f.write_str("no findings");
        }
        for (index, finding) in self.findings.iter().enumerate() {
            if index > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{finding}")?;
        }
        Ok(())
    }
}

/// Schema and probe checks against live pooled connections.
#[derive(Clone)]
pub struct IsolationAudit {
    pool: SqlitePool,
}

impl IsolationAudit {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Runs the schema audit followed by the probe audit.
    pub async fn run(&self) -> Result<AuditReport, sqlx::Error> {
        let report = self.schema().await?.merge(self.probe().await?);
        if report.is_clean() {
            info!(stage = "audit", tables = TENANT_TABLES.len(), "isolation audit clean");
        } else {
            warn!(stage = "audit", findings = report.findings.len(), report = %report, "isolation audit failed");
        }
        Ok(report)
    }

    pub async fn schema(&self) -> Result<AuditReport, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        let mut report = AuditReport::default();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM main.sqlite_master WHERE type = 'table' \
             AND name NOT LIKE 'sqlite_%' AND name NOT LIKE '_sqlx%' ORDER BY name",
        )
        .fetch_all(&mut *conn)
        .await?;
        let present: HashSet<&str> = tables.iter().map(|(name,)| name.as_str()).collect();

        for (table,) in &tables {
            let columns: Vec<(String, i64)> =
                sqlx::query_as("SELECT name, \"notnull\" FROM pragma_table_info(?)")
                    .bind(table.as_str())
                    .fetch_all(&mut *conn)
                    .await?;
            let organization_column = columns
                .iter()
                .find(|(name, _)| name == ORGANIZATION_COLUMN);

            match (schema::tenant_table(table), organization_column) {
                (Some(registered), Some((_, not_null))) => {
                    if *not_null == 0 {
                        report.findings.push(AuditFinding::new(
                            "schema",
                            table.as_str(),
                            "organization_id is nullable",
                        ));
                    }
                    let actual: BTreeSet<&str> = columns
                        .iter()
                        .map(|(name, _)| name.as_str())
                        .filter(|name| *name != ORGANIZATION_COLUMN)
                        .collect();
                    let declared: BTreeSet<&str> = registered.columns.iter().copied().collect();
                    if actual != declared {
                        report.findings.push(AuditFinding::new(
                            "schema",
                            table.as_str(),
                            format!("registered columns {declared:?} differ from table columns {actual:?}"),
                        ));
                    }
                }
                (Some(_), None) => report.findings.push(AuditFinding::new(
                    "schema",
                    table.as_str(),
                    "registered as tenant-scoped but has no organization_id column",
                )),
                (None, Some(_)) if !schema::is_exempt(table) => {
                    report.findings.push(AuditFinding::new(
                        "schema",
                        table.as_str(),
                        "carries organization_id but is not registered as tenant-scoped",
                    ))
                }
                _ => {}
            }
        }

        for registered in TENANT_TABLES {
            if !present.contains(registered.name) {
                report.findings.push(AuditFinding::new(
                    "schema",
                    registered.name,
                    "registered table does not exist",
                ));
            }
        }

        let installed: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM temp.sqlite_master WHERE type IN ('view', 'trigger')",
        )
        .fetch_all(&mut *conn)
        .await?;
        let installed: HashSet<&str> = installed.iter().map(|(name,)| name.as_str()).collect();
        for object in schema::expected_guard_objects() {
            if !installed.contains(object.as_str()) {
                report.findings.push(AuditFinding::new(
                    "schema",
                    object,
                    "guard object missing on pooled connection",
                ));
            }
        }

        Ok(report)
    }

    /// Checks that an unbound connection fails closed.
    pub async fn probe(&self) -> Result<AuditReport, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        let mut report = AuditReport::default();

        if let Some(organization_id) = session::bound_tenant(&mut conn).await? {
            report.findings.push(AuditFinding::new(
                "probe",
                "connection",
                format!("pooled connection is bound to {organization_id}"),
            ));
            return Ok(report);
        }

        let mut tx = conn.begin().await?;
        for table in TENANT_TABLES {
            let name = table.name;
            let view = table.view();

            let (visible,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {view}"))
                .fetch_one(&mut *tx)
                .await?;
            if visible != 0 {
                report.findings.push(AuditFinding::new(
                    "probe",
                    view.as_str(),
                    format!("{visible} rows visible without a bound tenant"),
                ));
            }

            let base_insert = sqlx::query(&format!(
                "INSERT INTO main.{name} (organization_id) VALUES (?)"
            ))
            .bind(PROBE_ORGANIZATION)
            .execute(&mut *tx)
            .await;
            expect_abort(&mut report, name, "direct insert", base_insert);

            let view_insert = sqlx::query(&format!("INSERT INTO {view} (id) VALUES (?)"))
                .bind(PROBE_ORGANIZATION)
                .execute(&mut *tx)
                .await;
            expect_abort(&mut report, view.as_str(), "scoped insert", view_insert);

            let (stored,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM main.{name}"))
                .fetch_one(&mut *tx)
                .await?;
            if stored > 0 {
                let base_update = sqlx::query(&format!(
                    "UPDATE main.{name} SET organization_id = organization_id \
                     WHERE rowid = (SELECT MIN(rowid) FROM main.{name})"
                ))
                .execute(&mut *tx)
                .await;
                expect_abort(&mut report, name, "direct update", base_update);

                let base_delete = sqlx::query(&format!(
                    "DELETE FROM main.{name} WHERE rowid = (SELECT MIN(rowid) FROM main.{name})"
                ))
                .execute(&mut *tx)
                .await;
                expect_abort(&mut report, name, "direct delete", base_delete);
            }
        }

        let (visible,): (i64,) =
            sqlx::query_as(&format!("SELECT COUNT(*) FROM {ORGANIZATION_VIEW}"))
                .fetch_one(&mut *tx)
                .await?;
        if visible != 0 {
            report.findings.push(AuditFinding::new(
                "probe",
                ORGANIZATION_VIEW,
                "organization visible without a bound tenant",
            ));
        }
        tx.rollback().await?;

        Ok(report)
    }
}

fn expect_abort(
    report: &mut AuditReport,
    subject: &str,
    action: &str,
    result: Result<sqlx::sqlite::SqliteQueryResult, sqlx::Error>,
) {
    let problem = match result {
        Ok(_) => format!("{action} succeeded without a bound tenant"),
        Err(sqlx::Error::Database(err)) if err.message().contains(ISOLATION_ABORT) => return,
        Err(err) => format!("{action} was not stopped by the isolation guard: {err}"),
    };
    report
        .findings
        .push(AuditFinding::new("probe", subject, problem));
}

/// Static scan of Rust sources.
#[derive(Debug, Clone)]
pub struct SourceAudit {
    allowed_files: Vec<&'static str>,
}

impl Default for SourceAudit {
    fn default() -> Self {
        Self {
            allowed_files: vec!["schema.rs", "aggregate.rs", "audit.rs"],
        }
    }
}

const SQL_KEYWORDS: &[&str] = &["from", "join", "into", "update", "table", "main"];
const SCOPE_BYPASS_TOKENS: &[&str] = &["pool", "SqlitePool", "Database", "acquire"];

impl SourceAudit {
    /// Walks `root` recursively and scans every `.rs` file.
    pub fn scan_dir(&self, root: &Path) -> io::Result<AuditReport> {
        let mut report = AuditReport::default();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir)?.collect::<Result<Vec<_>, _>>()?;
            entries.sort_by_key(|entry| entry.path());
            for entry in entries {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else if path.extension().is_some_and(|ext| ext == "rs") {
                    let text = fs::read_to_string(&path)?;
                    report
                        .findings
                        .extend(self.scan_source(&path.to_string_lossy(), &text));
                }
            }
        }
        Ok(report)
    }

    /// Scans one file. `path` decides which rules apply.
    pub fn scan_source(&self, path: &str, text: &str) -> Vec<AuditFinding> {
        let normalized = path.replace('\\', "/");
        let file_name = normalized.rsplit('/').next().unwrap_or(&normalized);
        let allowed = self.allowed_files.iter().any(|allowed| *allowed == file_name);
        let scoped = normalized.contains("/scoped/");
        let mut findings = Vec::new();

        for (index, line) in text.lines().enumerate() {
            if line.trim_start().starts_with("//") {
                continue;
            }
            let location = format!("{normalized}:{}", index + 1);
            let tokens: Vec<&str> = line
                .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .filter(|token| !token.is_empty())
                .collect();

            if !allowed {
                for pair in tokens.windows(2) {
                    let keyword = pair[0].to_ascii_lowercase();
                    if SQL_KEYWORDS.contains(&keyword.as_str()) && schema::tenant_table(pair[1]).is_some() {
                        findings.push(AuditFinding::new(
                            "source",
                            location.clone(),
                            format!("names tenant table {} directly; use its scoped view", pair[1]),
                        ));
                    }
                }
            }

            if scoped {
                if let Some(token) = tokens.iter().find(|token| SCOPE_BYPASS_TOKENS.contains(token)) {
                    findings.push(AuditFinding::new(
                        "source",
                        location.clone(),
                        format!("scoped repository reaches for {token} instead of its scope"),
                    ));
                }
            }
        }

        findings
    }
}

#[cfg(test)]
mod tests {
    use fieldbook_core::{
        settings::OrganizationSettings,
        tenancy::{Industry, NewOrganization, NewPrincipal},
    };
    use futures::FutureExt;

    use super::*;
    use crate::{test_support::setup_db, TenantGuard};

    async fn organization(db: &crate::Database, slug: &str) -> fieldbook_core::OrganizationId {
        db.directory()
            .create_organization(NewOrganization {
                slug: slug.into(),
                display_name: slug.into(),
                industry: Industry::Other,
                settings: OrganizationSettings::default(),
            })
            .await
            .expect("organization")
            .id
    }

    #[tokio::test]
    async fn migrated_schema_passes_both_audits() {
        let (db, _dir) = setup_db().await;
        let report = db.audit().run().await.expect("audit");
        assert!(report.is_clean(), "{report}");
    }

    #[tokio::test]
    async fn unregistered_tenant_table_is_reported() {
        let (db, _dir) = setup_db().await;
        sqlx::query(
            "CREATE TABLE crew_notes (id TEXT PRIMARY KEY, organization_id TEXT, body TEXT)",
        )
        .execute(db.pool())
        .await
        .expect("create table");

        let report = db.audit().schema().await.expect("audit");
        assert!(report.mentions("crew_notes"), "{report}");
        assert_eq!(report.findings.len(), 1, "{report}");
    }

    #[tokio::test]
    async fn probe_checks_existing_rows_too() {
        let (db, _dir) = setup_db().await;
        let report = db.audit().probe().await.expect("probe");
        assert!(report.is_clean(), "{report}");
    }

    #[tokio::test]
    async fn bound_connection_rejects_writes_for_other_organizations() {
        let (db, _dir) = setup_db().await;
        let acme = organization(&db, "acme").await;
        let zen = organization(&db, "zen").await;
        let root = db
            .directory()
            .create_principal(NewPrincipal {
                display_name: "Root".into(),
                email: "root@fieldbook.test".into(),
                credential_hash: None,
                is_superadmin: true,
            })
            .await
            .expect("superadmin")
            .id;
        let guard = TenantGuard::new(db);

        guard
            .run(&acme, &root, move |scope| {
                async move {
                    let client = scope
                        .clients()
                        .create(fieldbook_core::entities::NewClient::named("Jane Doe"))
                        .await?;
                    let conn = scope.connection()?;

                    let forged = sqlx::query(
                        "INSERT INTO main.clients (id, organization_id, display_name, archived, created_at, updated_at) \
                         VALUES (?, ?, 'Forged', 0, '2024-01-01T00:00:00.000Z', '2024-01-01T00:00:00.000Z')",
                    )
                    .bind(fieldbook_core::ClientId::new().to_string())
                    .bind(zen.to_string())
                    .execute(&mut *conn)
                    .await
                    .expect_err("insert for another tenant");
                    assert!(forged.to_string().contains(ISOLATION_ABORT), "{forged}");

                    let moved = sqlx::query("UPDATE main.clients SET organization_id = ? WHERE id = ?")
                        .bind(zen.to_string())
                        .bind(client.id.to_string())
                        .execute(&mut *conn)
                        .await
                        .expect_err("re-homing a row");
                    assert!(moved.to_string().contains(ISOLATION_ABORT), "{moved}");
                    Ok::<_, crate::DataError>(())
                }
                .boxed()
            })
            .await
            .expect("scope");
    }

    #[test]
    fn flags_raw_tenant_tables_outside_allowed_modules() {
        let audit = SourceAudit::default();
        let source = r#"
            let rows = sqlx::query("SELECT id FROM clients WHERE organization_id = ?");
            let fine = sqlx::query("SELECT id FROM scoped_clients");
            // SELECT * FROM invoices in a comment is ignored
            let also = "UPDATE main.jobs SET status = 'draft'";
        "#;
        let findings = audit.scan_source("crates/app/src/api.rs", source);
        assert_eq!(findings.len(), 2, "{findings:?}");
        assert!(findings[0].problem.contains("clients"));
        assert!(findings[1].problem.contains("jobs"));

        assert!(audit
            .scan_source("crates/storage/src/aggregate.rs", source)
            .is_empty());
    }

    #[test]
    fn flags_pool_access_from_scoped_repositories() {
        let audit = SourceAudit::default();
        let source = "let conn = self.pool.acquire().await?;";
        let findings = audit.scan_source("crates/storage/src/scoped/clients.rs", source);
        assert_eq!(findings.len(), 1);
        assert!(audit
            .scan_source("crates/storage/src/directory.rs", source)
            .is_empty());
    }
}

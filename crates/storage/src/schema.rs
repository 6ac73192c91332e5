//! Registry of tenant-scoped tables and the per-connection guard objects
//! generated from it.
//!
//! For each registered table `T` every pooled connection carries:
//!
//! * `temp.scoped_T`, a view restricted to the organization bound in
//!   `temp.tenant_session`;
//! * `INSTEAD OF` insert/update/delete triggers on that view which stamp the
//!   bound organization on writes and refuse to run when nothing is bound;
//! * `BEFORE` insert/update/delete triggers on `main.T` which abort any write
//!   whose `organization_id` differs from the bound one.
//!
//! With no tenant bound the views are empty and every tenant table write is
//! aborted, so an unbound connection fails closed.

/// Marker carried by every isolation abort raised from the guard triggers.
pub const ISOLATION_ABORT: &str = "tenant isolation violation";

/// Per-connection table holding the session tenant parameter.
pub const SESSION_TABLE: &str = "tenant_session";

/// View over the bound organization's own row in `organizations`.
pub const ORGANIZATION_VIEW: &str = "scoped_organization";

/// Table whose rows belong to exactly one organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantTable {
    pub name: &'static str,
    /// Every column except `organization_id`, `id` first.
    pub columns: &'static [&'static str],
    /// Columns fixed at insert and never rewritten by updates.
    pub immutable: &'static [&'static str],
}

impl TenantTable {
    pub fn view(&self) -> String {
        format!("scoped_{}", self.name)
    }

    /// Names of the six triggers guarding this table.
    pub fn trigger_names(&self) -> [String; 6] {
        let table = self.name;
        [
            format!("scoped_{table}_insert"),
            format!("scoped_{table}_update"),
            format!("scoped_{table}_delete"),
            format!("guard_{table}_insert"),
            format!("guard_{table}_update"),
            format!("guard_{table}_delete"),
        ]
    }

    fn mutable_columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.columns
            .iter()
            .copied()
            .filter(|column| *column != "id" && !self.immutable.contains(column))
    }
}

/// Table carrying an `organization_id` column that is deliberately not
/// tenant-scoped.
#[derive(Debug, Clone, Copy)]
pub struct ExemptTable {
    pub name: &'static str,
    pub reason: &'static str,
}

pub const TENANT_TABLES: &[TenantTable] = &[
    TenantTable {
        name: "clients",
        columns: &[
            "id",
            "display_name",
            "email",
            "phone",
            "notes",
            "archived",
            "created_at",
            "updated_at",
        ],
        immutable: &["created_at"],
    },
    TenantTable {
        name: "properties",
        columns: &[
            "id",
            "client_id",
            "address_line",
            "city",
            "region",
            "postal_code",
            "created_at",
        ],
        immutable: &["client_id", "created_at"],
    },
    TenantTable {
        name: "jobs",
        columns: &[
            "id",
            "client_id",
            "property_id",
            "title",
            "description",
            "status",
            "scheduled_for",
            "created_at",
            "updated_at",
        ],
        immutable: &["client_id", "created_at"],
    },
    TenantTable {
        name: "visits",
        columns: &[
            "id",
            "job_id",
            "starts_at",
            "ends_at",
            "completed_at",
            "notes",
            "created_at",
        ],
        immutable: &["job_id", "created_at"],
    },
    TenantTable {
        name: "estimates",
        columns: &[
            "id",
            "client_id",
            "title",
            "line_items_json",
            "subtotal_cents",
            "tax_cents",
            "total_cents",
            "status",
            "job_id",
            "created_at",
            "updated_at",
        ],
        immutable: &["client_id", "created_at"],
    },
    TenantTable {
        name: "invoices",
        columns: &[
            "id",
            "client_id",
            "job_id",
            "number",
            "line_items_json",
            "subtotal_cents",
            "tax_cents",
            "total_cents",
            "status",
            "due_on",
            "issued_at",
            "paid_at",
            "created_at",
            "updated_at",
        ],
        immutable: &["client_id", "number", "created_at"],
    },
];

pub const EXEMPT_TABLES: &[ExemptTable] = &[ExemptTable {
    name: "memberships",
    reason: "authorization edge consulted before a tenant is bound",
}];

pub fn tenant_table(name: &str) -> Option<&'static TenantTable> {
    TENANT_TABLES.iter().find(|table| table.name == name)
}

pub fn is_exempt(name: &str) -> bool {
    EXEMPT_TABLES.iter().any(|table| table.name == name)
}

pub(crate) fn session_table_ddl() -> String {
    format!(
        "CREATE TEMP TABLE IF NOT EXISTS {SESSION_TABLE} (\
            slot INTEGER PRIMARY KEY CHECK (slot = 1), \
            organization_id TEXT NOT NULL, \
            principal_id TEXT NOT NULL, \
            bound_at TEXT NOT NULL)"
    )
}

fn bound_tenant() -> String {
    format!("(SELECT organization_id FROM {SESSION_TABLE} WHERE slot = 1)")
}

fn unbound_abort() -> String {
    format!(
        "SELECT RAISE(ABORT, '{ISOLATION_ABORT}: no tenant bound') \
         WHERE {bound} IS NULL;",
        bound = bound_tenant()
    )
}

/// Temp views and triggers guarding one tenant table.
pub(crate) fn guard_ddl(table: &TenantTable) -> Vec<String> {
    let name = table.name;
    let view = table.view();
    let bound = bound_tenant();
    let unbound = unbound_abort();
    let [view_insert, view_update, view_delete, base_insert, base_update, base_delete] =
        table.trigger_names();

    let insert_columns = table.columns.join(", ");
    let insert_values = table
        .columns
        .iter()
        .map(|column| format!("NEW.{column}"))
        .collect::<Vec<_>>()
        .join(", ");
    let assignments = table
        .mutable_columns()
        .map(|column| format!("{column} = NEW.{column}"))
        .collect::<Vec<_>>()
        .join(", ");

    vec![
        format!(
            "CREATE TEMP VIEW IF NOT EXISTS {view} AS \
             SELECT * FROM main.{name} \
             WHERE organization_id = (SELECT organization_id FROM temp.{SESSION_TABLE} WHERE slot = 1)"
        ),
        format!(
            "CREATE TEMP TRIGGER IF NOT EXISTS {view_insert} INSTEAD OF INSERT ON {view} \
             BEGIN \
                {unbound} \
                INSERT INTO {name} (organization_id, {insert_columns}) \
                VALUES ({bound}, {insert_values}); \
             END"
        ),
        format!(
            "CREATE TEMP TRIGGER IF NOT EXISTS {view_update} INSTEAD OF UPDATE ON {view} \
             BEGIN \
                {unbound} \
                UPDATE {name} SET {assignments} \
                WHERE id = OLD.id AND organization_id = {bound}; \
             END"
        ),
        format!(
            "CREATE TEMP TRIGGER IF NOT EXISTS {view_delete} INSTEAD OF DELETE ON {view} \
             BEGIN \
                {unbound} \
                DELETE FROM {name} WHERE id = OLD.id AND organization_id = {bound}; \
             END"
        ),
        format!(
            "CREATE TEMP TRIGGER IF NOT EXISTS {base_insert} BEFORE INSERT ON main.{name} \
             WHEN NEW.organization_id IS NOT {bound} \
             BEGIN SELECT RAISE(ABORT, '{ISOLATION_ABORT}: {name}'); END"
        ),
        format!(
            "CREATE TEMP TRIGGER IF NOT EXISTS {base_update} BEFORE UPDATE ON main.{name} \
             WHEN OLD.organization_id IS NOT {bound} OR NEW.organization_id IS NOT {bound} \
             BEGIN SELECT RAISE(ABORT, '{ISOLATION_ABORT}: {name}'); END"
        ),
        format!(
            "CREATE TEMP TRIGGER IF NOT EXISTS {base_delete} BEFORE DELETE ON main.{name} \
             WHEN OLD.organization_id IS NOT {bound} \
             BEGIN SELECT RAISE(ABORT, '{ISOLATION_ABORT}: {name}'); END"
        ),
    ]
}

/// View over the bound organization's row; only updates of editable fields
/// pass through it.
pub(crate) fn organization_ddl() -> Vec<String> {
    let bound = bound_tenant();
    let unbound = unbound_abort();
    vec![
        format!(
            "CREATE TEMP VIEW IF NOT EXISTS {ORGANIZATION_VIEW} AS \
             SELECT * FROM main.organizations \
             WHERE id = (SELECT organization_id FROM temp.{SESSION_TABLE} WHERE slot = 1)"
        ),
        format!(
            "CREATE TEMP TRIGGER IF NOT EXISTS {ORGANIZATION_VIEW}_update \
             INSTEAD OF UPDATE ON {ORGANIZATION_VIEW} \
             BEGIN \
                {unbound} \
                UPDATE organizations SET display_name = NEW.display_name, \
                    industry = NEW.industry, \
                    settings_json = NEW.settings_json, \
                    updated_at = NEW.updated_at \
                WHERE id = OLD.id AND id = {bound}; \
             END"
        ),
    ]
}

/// Every temp object name the guard installs, for arming checks and audits.
pub fn expected_guard_objects() -> Vec<String> {
    let mut names = Vec::with_capacity(TENANT_TABLES.len() * 7 + 2);
    for table in TENANT_TABLES {
        names.push(table.view());
        names.extend(table.trigger_names());
    }
    names.push(ORGANIZATION_VIEW.to_string());
    names.push(format!("{ORGANIZATION_VIEW}_update"));
    names
}

pub(crate) fn all_guard_ddl() -> Vec<String> {
    let mut statements: Vec<String> = TENANT_TABLES.iter().flat_map(guard_ddl).collect();
    statements.extend(organization_ddl());
    statements
}

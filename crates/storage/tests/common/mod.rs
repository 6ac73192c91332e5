#![allow(dead_code)]

use fieldbook_core::{
    entities::{Client, NewClient},
    settings::OrganizationSettings,
    tenancy::{Industry, NewOrganization, NewPrincipal},
    OrganizationId, PrincipalId, Role,
};
use fieldbook_storage::{DataError, Database, TenantGuard};
use futures::FutureExt;
use tempfile::TempDir;

pub struct Tenant {
    pub org: OrganizationId,
    pub member: PrincipalId,
}

pub struct Fixture {
    pub db: Database,
    pub guard: TenantGuard,
    pub acme: Tenant,
    pub zen: Tenant,
    pub superadmin: PrincipalId,
    pub outsider: PrincipalId,
    _dir: TempDir,
}

pub async fn database(max_connections: u32) -> (Database, TempDir) {
    let dir = TempDir::new().expect("tempdir");
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("fieldbook.db").display());
    let db = Database::connect_with(&url, max_connections)
        .await
        .expect("connect");
    db.run_migrations().await.expect("migrations");
    (db, dir)
}

pub async fn fixture() -> Fixture {
    fixture_with_pool(5).await
}

/// Two organizations, one member each, a superadmin and a principal with no
/// memberships at all.
pub async fn fixture_with_pool(max_connections: u32) -> Fixture {
    let (db, dir) = database(max_connections).await;
    let acme = tenant(&db, "acme", "jane@acme.test").await;
    let zen = tenant(&db, "zen", "bob@zen.test").await;
    let superadmin = principal(&db, "root@fieldbook.test", true).await;
    let outsider = principal(&db, "mallory@nowhere.test", false).await;
    let guard = TenantGuard::new(db.clone());
    Fixture {
        db,
        guard,
        acme,
        zen,
        superadmin,
        outsider,
        _dir: dir,
    }
}

pub async fn tenant(db: &Database, slug: &str, email: &str) -> Tenant {
    let org = db
        .directory()
        .create_organization(NewOrganization {
            slug: slug.to_string(),
            display_name: slug.to_string(),
            industry: Industry::Landscaping,
            settings: OrganizationSettings::default(),
        })
        .await
        .expect("organization");
    let member = principal(db, email, false).await;
    db.directory()
        .grant_membership(&member, &org.id, Role::Owner)
        .await
        .expect("membership");
    Tenant {
        org: org.id,
        member,
    }
}

pub async fn principal(db: &Database, email: &str, is_superadmin: bool) -> PrincipalId {
    db.directory()
        .create_principal(NewPrincipal {
            display_name: email.split('@').next().unwrap_or(email).to_string(),
            email: email.to_string(),
            credential_hash: None,
            is_superadmin,
        })
        .await
        .expect("principal")
        .id
}

pub async fn create_client(guard: &TenantGuard, tenant: &Tenant, name: &str) -> Client {
    let name = name.to_string();
    guard
        .run(&tenant.org, &tenant.member, |scope| {
            async move { scope.clients().create(NewClient::named(name)).await }.boxed()
        })
        .await
        .expect("create client")
}

pub async fn list_client_names(guard: &TenantGuard, tenant: &Tenant) -> Result<Vec<String>, DataError> {
    guard
        .run(&tenant.org, &tenant.member, |scope| {
            async move {
                let clients = scope.clients().list(true).await?;
                Ok(clients.into_iter().map(|client| client.display_name).collect())
            }
            .boxed()
        })
        .await
}

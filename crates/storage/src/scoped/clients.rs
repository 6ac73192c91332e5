use chrono::{DateTime, Utc};
use fieldbook_core::{
    entities::{Client, ClientUpdate, NewClient},
    ClientId, OrganizationId,
};
use sqlx::FromRow;

use crate::{error::DataError, guard::TenantScope, to_rfc3339};

const COLUMNS: &str =
    "id, organization_id, display_name, email, phone, notes, archived, created_at, updated_at";

pub struct ClientRepository<'s> {
    scope: &'s mut TenantScope,
}

impl<'s> ClientRepository<'s> {
    pub(crate) fn new(scope: &'s mut TenantScope) -> Self {
        Self { scope }
    }

    pub async fn create(&mut self, new: NewClient) -> Result<Client, DataError> {
        new.validate()?;
        let id = ClientId::new();
        let now = to_rfc3339(Utc::now());
        sqlx::query(
            "INSERT INTO scoped_clients (id, display_name, email, phone, notes, archived, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(id.to_string())
        .bind(new.display_name.trim())
        .bind(new.email.as_deref())
        .bind(new.phone.as_deref())
        .bind(new.notes.as_deref())
        .bind(&now)
        .bind(&now)
        .execute(self.scope.connection()?)
        .await?;
        self.get(&id).await
    }

    pub async fn find(&mut self, id: &ClientId) -> Result<Option<Client>, DataError> {
        let row = sqlx::query_as::<_, ClientRow>(&format!(
            "SELECT {COLUMNS} FROM scoped_clients WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(self.scope.connection()?)
        .await?;
        row.map(|row| row.into_domain(self.scope)).transpose()
    }

    pub async fn get(&mut self, id: &ClientId) -> Result<Client, DataError> {
        self.find(id)
            .await?
            .ok_or_else(|| DataError::not_found("client", id))
    }

    pub async fn list(&mut self, include_archived: bool) -> Result<Vec<Client>, DataError> {
        let rows = sqlx::query_as::<_, ClientRow>(&format!(
            "SELECT {COLUMNS} FROM scoped_clients WHERE archived = 0 OR ? ORDER BY display_name, id"
        ))
        .bind(include_archived)
        .fetch_all(self.scope.connection()?)
        .await?;
        rows.into_iter()
            .map(|row| row.into_domain(self.scope))
            .collect()
    }

    pub async fn update(&mut self, id: &ClientId, update: ClientUpdate) -> Result<Client, DataError> {
        let current = self.get(id).await?;
        let merged = NewClient {
            display_name: update.display_name.unwrap_or(current.display_name),
            email: update.email.or(current.email),
            phone: update.phone.or(current.phone),
            notes: update.notes.or(current.notes),
        };
        merged.validate()?;
        sqlx::query(
            "UPDATE scoped_clients SET display_name = ?, email = ?, phone = ?, notes = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(merged.display_name.trim())
        .bind(merged.email.as_deref())
        .bind(merged.phone.as_deref())
        .bind(merged.notes.as_deref())
        .bind(to_rfc3339(Utc::now()))
        .bind(id.to_string())
        .execute(self.scope.connection()?)
        .await?;
        self.get(id).await
    }

    /// Archived clients drop out of default listings but keep their history.
    pub async fn archive(&mut self, id: &ClientId) -> Result<Client, DataError> {
        self.get(id).await?;
        sqlx::query("UPDATE scoped_clients SET archived = 1, updated_at = ? WHERE id = ?")
            .bind(to_rfc3339(Utc::now()))
            .bind(id.to_string())
            .execute(self.scope.connection()?)
            .await?;
        self.get(id).await
    }
}

#[derive(Debug, FromRow)]
struct ClientRow {
    id: String,
    organization_id: String,
    display_name: String,
    email: Option<String>,
    phone: Option<String>,
    notes: Option<String>,
    archived: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ClientRow {
    fn into_domain(self, scope: &TenantScope) -> Result<Client, DataError> {
        scope.ensure_owned(&self.organization_id)?;
        Ok(Client {
            id: ClientId::parse(&self.id)?,
            organization_id: OrganizationId::parse(&self.organization_id)?,
            display_name: self.display_name,
            email: self.email,
            phone: self.phone,
            notes: self.notes,
            archived: self.archived != 0,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

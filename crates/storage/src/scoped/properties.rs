use chrono::{DateTime, Utc};
use fieldbook_core::{
    entities::{NewProperty, Property},
    ClientId, OrganizationId, PropertyId,
};
use sqlx::FromRow;

use crate::{error::DataError, guard::TenantScope, to_rfc3339};

const COLUMNS: &str =
    "id, organization_id, client_id, address_line, city, region, postal_code, created_at";

pub struct PropertyRepository<'s> {
    scope: &'s mut TenantScope,
}

impl<'s> PropertyRepository<'s> {
    pub(crate) fn new(scope: &'s mut TenantScope) -> Self {
        Self { scope }
    }

    /// Adds a service location to a client of the bound organization.
    pub async fn create(
        &mut self,
        client_id: &ClientId,
        new: NewProperty,
    ) -> Result<Property, DataError> {
        new.validate()?;
        self.scope.clients().get(client_id).await?;
        let id = PropertyId::new();
        sqlx::query(
            "INSERT INTO scoped_properties (id, client_id, address_line, city, region, postal_code, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(client_id.to_string())
        .bind(new.address_line.trim())
        .bind(new.city.trim())
        .bind(new.region.as_deref())
        .bind(new.postal_code.as_deref())
        .bind(to_rfc3339(Utc::now()))
        .execute(self.scope.connection()?)
        .await?;
        self.get(&id).await
    }

    pub async fn get(&mut self, id: &PropertyId) -> Result<Property, DataError> {
        let row = sqlx::query_as::<_, PropertyRow>(&format!(
            "SELECT {COLUMNS} FROM scoped_properties WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(self.scope.connection()?)
        .await?;
        row.map(|row| row.into_domain(self.scope))
            .transpose()?
            .ok_or_else(|| DataError::not_found("property", id))
    }

    pub async fn list_for_client(&mut self, client_id: &ClientId) -> Result<Vec<Property>, DataError> {
        self.scope.clients().get(client_id).await?;
        let rows = sqlx::query_as::<_, PropertyRow>(&format!(
            "SELECT {COLUMNS} FROM scoped_properties WHERE client_id = ? ORDER BY created_at, id"
        ))
        .bind(client_id.to_string())
        .fetch_all(self.scope.connection()?)
        .await?;
        rows.into_iter()
            .map(|row| row.into_domain(self.scope))
            .collect()
    }
}

#[derive(Debug, FromRow)]
struct PropertyRow {
    id: String,
    organization_id: String,
    client_id: String,
    address_line: String,
    city: String,
    region: Option<String>,
    postal_code: Option<String>,
    created_at: DateTime<Utc>,
}

impl PropertyRow {
    fn into_domain(self, scope: &TenantScope) -> Result<Property, DataError> {
        scope.ensure_owned(&self.organization_id)?;
        Ok(Property {
            id: PropertyId::parse(&self.id)?,
            organization_id: OrganizationId::parse(&self.organization_id)?,
            client_id: ClientId::parse(&self.client_id)?,
            address_line: self.address_line,
            city: self.city,
            region: self.region,
            postal_code: self.postal_code,
            created_at: self.created_at,
        })
    }
}

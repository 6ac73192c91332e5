use chrono::{DateTime, Utc};
use fieldbook_core::{
    entities::{ensure_transition, EntityError, Job, JobStatus, NewJob, NewVisit, Visit},
    ClientId, JobId, OrganizationId, PropertyId, VisitId,
};
use sqlx::FromRow;

use crate::{error::DataError, guard::TenantScope, to_rfc3339};

const JOB_COLUMNS: &str = "id, organization_id, client_id, property_id, title, description, status, \
     scheduled_for, created_at, updated_at";
const VISIT_COLUMNS: &str =
    "id, organization_id, job_id, starts_at, ends_at, completed_at, notes, created_at";

pub struct JobRepository<'s> {
    scope: &'s mut TenantScope,
}

impl<'s> JobRepository<'s> {
    pub(crate) fn new(scope: &'s mut TenantScope) -> Self {
        Self { scope }
    }

    pub async fn create(&mut self, new: NewJob) -> Result<Job, DataError> {
        new.validate()?;
        self.scope.clients().get(&new.client_id).await?;
        if let Some(property_id) = &new.property_id {
            let property = self.scope.properties().get(property_id).await?;
            if property.client_id != new.client_id {
                return Err(EntityError::Validation(
                    "property belongs to a different client".to_string(),
                )
                .into());
            }
        }

        let id = JobId::new();
        let now = to_rfc3339(Utc::now());
        sqlx::query(
            "INSERT INTO scoped_jobs (id, client_id, property_id, title, description, status, scheduled_for, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(new.client_id.to_string())
        .bind(new.property_id.map(|id| id.to_string()))
        .bind(new.title.trim())
        .bind(new.description.as_deref())
        .bind(new.initial_status().as_str())
        .bind(new.scheduled_for.map(to_rfc3339))
        .bind(&now)
        .bind(&now)
        .execute(self.scope.connection()?)
        .await?;
        self.get(&id).await
    }

    pub async fn find(&mut self, id: &JobId) -> Result<Option<Job>, DataError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM scoped_jobs WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(self.scope.connection()?)
        .await?;
        row.map(|row| row.into_domain(self.scope)).transpose()
    }

    pub async fn get(&mut self, id: &JobId) -> Result<Job, DataError> {
        self.find(id)
            .await?
            .ok_or_else(|| DataError::not_found("job", id))
    }

    pub async fn list(&mut self, status: Option<JobStatus>) -> Result<Vec<Job>, DataError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM scoped_jobs WHERE ? IS NULL OR status = ? \
             ORDER BY COALESCE(scheduled_for, created_at), id"
        ))
        .bind(status.map(JobStatus::as_str))
        .bind(status.map(JobStatus::as_str))
        .fetch_all(self.scope.connection()?)
        .await?;
        rows.into_iter()
            .map(|row| row.into_domain(self.scope))
            .collect()
    }

    pub async fn list_for_client(&mut self, client_id: &ClientId) -> Result<Vec<Job>, DataError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM scoped_jobs WHERE client_id = ? ORDER BY created_at, id"
        ))
        .bind(client_id.to_string())
        .fetch_all(self.scope.connection()?)
        .await?;
        rows.into_iter()
            .map(|row| row.into_domain(self.scope))
            .collect()
    }

    /// Moves a job along its lifecycle, refusing transitions it does not allow.
    pub async fn update_status(&mut self, id: &JobId, next: JobStatus) -> Result<Job, DataError> {
        let job = self.get(id).await?;
        ensure_transition("job", job.status, next, JobStatus::can_transition_to)?;
        sqlx::query("UPDATE scoped_jobs SET status = ?, updated_at = ? WHERE id = ?")
            .bind(next.as_str())
            .bind(to_rfc3339(Utc::now()))
            .bind(id.to_string())
            .execute(self.scope.connection()?)
            .await?;
        self.get(id).await
    }

    pub async fn schedule_visit(&mut self, id: &JobId, new: NewVisit) -> Result<Visit, DataError> {
        self.scope.visits().schedule(id, new).await
    }

    pub async fn list_visits(&mut self, id: &JobId) -> Result<Vec<Visit>, DataError> {
        self.scope.visits().list_for_job(id).await
    }

    pub async fn complete_visit(&mut self, visit_id: &VisitId) -> Result<Visit, DataError> {
        self.scope.visits().complete(visit_id).await
    }
}

pub struct VisitRepository<'s> {
    scope: &'s mut TenantScope,
}

impl<'s> VisitRepository<'s> {
    pub(crate) fn new(scope: &'s mut TenantScope) -> Self {
        Self { scope }
    }

    /// Books a visit; a draft job becomes scheduled for the visit's start.
    pub async fn schedule(&mut self, job_id: &JobId, new: NewVisit) -> Result<Visit, DataError> {
        new.validate()?;
        let job = self.scope.jobs().get(job_id).await?;
        if matches!(job.status, JobStatus::Completed | JobStatus::Cancelled) {
            return Err(DataError::Conflict(format!(
                "job {job_id} is {} and cannot take new visits",
                job.status
            )));
        }

        let id = VisitId::new();
        let now = to_rfc3339(Utc::now());
        sqlx::query(
            "INSERT INTO scoped_visits (id, job_id, starts_at, ends_at, completed_at, notes, created_at) \
             VALUES (?, ?, ?, ?, NULL, ?, ?)",
        )
        .bind(id.to_string())
        .bind(job_id.to_string())
        .bind(to_rfc3339(new.starts_at))
        .bind(to_rfc3339(new.ends_at))
        .bind(new.notes.as_deref())
        .bind(&now)
        .execute(self.scope.connection()?)
        .await?;

        if job.status == JobStatus::Draft {
            sqlx::query(
                "UPDATE scoped_jobs SET status = ?, scheduled_for = ?, updated_at = ? WHERE id = ?",
            )
            .bind(JobStatus::Scheduled.as_str())
            .bind(to_rfc3339(new.starts_at))
            .bind(&now)
            .bind(job_id.to_string())
            .execute(self.scope.connection()?)
            .await?;
        }
        self.get(&id).await
    }

    pub async fn get(&mut self, id: &VisitId) -> Result<Visit, DataError> {
        let row = sqlx::query_as::<_, VisitRow>(&format!(
            "SELECT {VISIT_COLUMNS} FROM scoped_visits WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(self.scope.connection()?)
        .await?;
        row.map(|row| row.into_domain(self.scope))
            .transpose()?
            .ok_or_else(|| DataError::not_found("visit", id))
    }

    pub async fn list_for_job(&mut self, job_id: &JobId) -> Result<Vec<Visit>, DataError> {
        self.scope.jobs().get(job_id).await?;
        let rows = sqlx::query_as::<_, VisitRow>(&format!(
            "SELECT {VISIT_COLUMNS} FROM scoped_visits WHERE job_id = ? ORDER BY starts_at, id"
        ))
        .bind(job_id.to_string())
        .fetch_all(self.scope.connection()?)
        .await?;
        rows.into_iter()
            .map(|row| row.into_domain(self.scope))
            .collect()
    }

    pub async fn complete(&mut self, id: &VisitId) -> Result<Visit, DataError> {
        let visit = self.get(id).await?;
        if visit.completed_at.is_some() {
            return Err(DataError::Conflict(format!("visit {id} is already completed")));
        }
        sqlx::query("UPDATE scoped_visits SET completed_at = ? WHERE id = ?")
            .bind(to_rfc3339(Utc::now()))
            .bind(id.to_string())
            .execute(self.scope.connection()?)
            .await?;
        self.get(id).await
    }
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: String,
    organization_id: String,
    client_id: String,
    property_id: Option<String>,
    title: String,
    description: Option<String>,
    status: String,
    scheduled_for: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobRow {
    fn into_domain(self, scope: &TenantScope) -> Result<Job, DataError> {
        scope.ensure_owned(&self.organization_id)?;
        Ok(Job {
            id: JobId::parse(&self.id)?,
            organization_id: OrganizationId::parse(&self.organization_id)?,
            client_id: ClientId::parse(&self.client_id)?,
            property_id: self
                .property_id
                .as_deref()
                .map(PropertyId::parse)
                .transpose()?,
            title: self.title,
            description: self.description,
            status: self.status.parse()?,
            scheduled_for: self.scheduled_for,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct VisitRow {
    id: String,
    organization_id: String,
    job_id: String,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    notes: Option<String>,
    created_at: DateTime<Utc>,
}

impl VisitRow {
    fn into_domain(self, scope: &TenantScope) -> Result<Visit, DataError> {
        scope.ensure_owned(&self.organization_id)?;
        Ok(Visit {
            id: VisitId::parse(&self.id)?,
            organization_id: OrganizationId::parse(&self.organization_id)?,
            job_id: JobId::parse(&self.job_id)?,
            starts_at: self.starts_at,
            ends_at: self.ends_at,
            completed_at: self.completed_at,
            notes: self.notes,
            created_at: self.created_at,
        })
    }
}

//! Domain types shared by the storage layer, the HTTP surface and background
//! workers: tenancy identities, tenant-scoped entities, typed organization
//! settings and billing arithmetic.

pub mod billing;
pub mod entities;
pub mod ids;
pub mod settings;
pub mod tenancy;

pub use ids::{
    ClientId, EstimateId, IdError, InvoiceId, JobId, OrganizationId, PrincipalId, PropertyId,
    VisitId,
};
pub use tenancy::{
    Grant, Industry, Membership, NewOrganization, NewPrincipal, Organization, OrganizationUpdate,
    Principal, Role, TenantContext,
};

//! Repositories for tenant-scoped data.
//!
//! Each repository mutably borrows a [`TenantScope`](crate::TenantScope), so
//! none can be constructed or used without an open scope. They read and write
//! only through the per-connection `scoped_*` views; the organization is
//! never passed in and never bound as a parameter.

mod clients;
mod estimates;
mod invoices;
mod jobs;
mod organization;
mod properties;

pub use clients::ClientRepository;
pub use estimates::EstimateRepository;
pub use invoices::InvoiceRepository;
pub use jobs::{JobRepository, VisitRepository};
pub use organization::OrganizationRepository;
pub use properties::PropertyRepository;

use fieldbook_core::billing::LineItem;

use crate::error::DataError;

fn decode_line_items(json: &str) -> Result<Vec<LineItem>, DataError> {
    Ok(serde_json::from_str(json)?)
}

fn encode_line_items(items: &[LineItem]) -> Result<String, DataError> {
    Ok(serde_json::to_string(items)?)
}

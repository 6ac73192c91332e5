use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single priced line on an estimate or invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

impl LineItem {
    pub fn amount_cents(&self) -> Result<i64, BillingError> {
        self.unit_price_cents
            .checked_mul(i64::from(self.quantity))
            .ok_or(BillingError::Overflow)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
}

impl Totals {
    /// Sums the line items and applies the tax rate (basis points, rounded half up).
    pub fn compute(items: &[LineItem], tax_rate_bps: u32) -> Result<Self, BillingError> {
        if items.is_empty() {
            return Err(BillingError::NoLineItems);
        }
        let mut subtotal: i64 = 0;
        for item in items {
            if item.description.trim().is_empty() {
                return Err(BillingError::MissingDescription);
            }
            if item.quantity == 0 || item.unit_price_cents < 0 {
                return Err(BillingError::InvalidLine(item.description.clone()));
            }
            subtotal = subtotal
                .checked_add(item.amount_cents()?)
                .ok_or(BillingError::Overflow)?;
        }
        let tax = subtotal
            .checked_mul(i64::from(tax_rate_bps))
            .map(|scaled| (scaled + 5_000) / 10_000)
            .ok_or(BillingError::Overflow)?;
        Ok(Self {
            subtotal_cents: subtotal,
            tax_cents: tax,
            total_cents: subtotal + tax,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BillingError {
    #[error("at least one line item is required")]
    NoLineItems,
    #[error("line item description must not be empty")]
    MissingDescription,
    #[error("line item {0:?} needs a positive quantity and non-negative price")]
    InvalidLine(String),
    #[error("amount overflow")]
    Overflow,
}

use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

/// Error returned when an identifier is not a well-formed UUID.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} identifier is malformed: {value}")]
pub struct IdError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a fresh random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(value: Uuid) -> Self {
                Self(value)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            /// Parses the hyphenated textual form, rejecting anything else.
            pub fn parse(value: &str) -> Result<Self, IdError> {
                let trimmed = value.trim();
                Uuid::parse_str(trimmed)
                    .ok()
                    .filter(|uuid| uuid.hyphenated().to_string().eq_ignore_ascii_case(trimmed))
                    .map(Self)
                    .ok_or_else(|| IdError {
                        kind: $kind,
                        value: value.to_string(),
                    })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.hyphenated())
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                Self::parse(value)
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let value = String::deserialize(deserializer)?;
                Self::parse(&value).map_err(serde::de::Error::custom)
            }
        }
    };
}

uuid_id!(
    /// Identifies an organization, the tenant boundary.
    OrganizationId,
    "organization"
);
uuid_id!(
    /// Identifies an authenticated actor.
    PrincipalId,
    "principal"
);
uuid_id!(ClientId, "client");
uuid_id!(PropertyId, "property");
uuid_id!(JobId, "job");
uuid_id!(VisitId, "visit");
uuid_id!(EstimateId, "estimate");
uuid_id!(InvoiceId, "invoice");

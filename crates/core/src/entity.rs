//! Catalog entity kinds and the versioning contract shared by every store.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{EntityId, TenantId};

/// The closed set of catalog entity kinds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Product,
    Category,
}

impl EntityType {
    pub const ALL: [EntityType; 2] = [EntityType::Product, EntityType::Category];

    /// Stable lowercase name, used in cache keys, event types and SQL rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Product => "product",
            EntityType::Category => "category",
        }
    }
}

impl core::fmt::Display for EntityType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "product" => Ok(EntityType::Product),
            "category" => Ok(EntityType::Category),
            other => Err(DomainError::validation(format!("unknown entity type: {other}"))),
        }
    }
}

/// A tenant-owned record whose `version` is assigned by the primary store.
///
/// The version starts at 1 on creation and increases by exactly one per
/// committed mutation.
pub trait Versioned {
    fn entity_id(&self) -> EntityId;

    fn tenant_id(&self) -> TenantId;

    fn entity_type(&self) -> EntityType;

    fn version(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_type_round_trips_through_str() {
        for t in EntityType::ALL {
            assert_eq!(t.as_str().parse::<EntityType>().unwrap(), t);
        }
        assert!("order".parse::<EntityType>().is_err());
    }
}

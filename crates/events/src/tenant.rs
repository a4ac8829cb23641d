use marketplace_core::TenantId;

use crate::DomainEvent;

/// Helper trait for tenant-scoped messages.
///
/// Every entity, search document and event in the catalog carries its tenant.
/// Infrastructure uses this trait to reject records that surface under the
/// wrong tenant (e.g. a cached entity read back under another tenant's key).
pub trait TenantScoped {
    fn tenant_id(&self) -> TenantId;

    fn belongs_to(&self, tenant_id: TenantId) -> bool {
        self.tenant_id() == tenant_id
    }
}

impl TenantScoped for DomainEvent {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

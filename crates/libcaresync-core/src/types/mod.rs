pub mod actor;
pub mod audit;
pub mod change;
pub mod ids;
pub mod record;

pub use ids::{AuditId, ChangeId, DeviceId, TenantId, UserId};
